//! `hgms` — command-line entry points for the store.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hgms_core::crypto::{AesCbc, PadReader};
use hgms_fuse::MountConfig;
use hgms_proxy::{ProxyConfig, ProxyServer};

/// Steganographic file store: proxy, filesystem and crypto tooling
#[derive(Parser)]
#[command(name = "hgms")]
#[command(author, version)]
#[command(after_help = "EXAMPLES:
    # Encrypt a file the way the ingest pipeline does
    hgms encrypt mysecretkey myiv plain.dat blob.raw

    # Serve the alias tree at http://0.0.0.0:8080/
    hgms proxy 0.0.0.0 8080

    # Mount the store through a running proxy
    hgms mount /mnt/hgms http://localhost:8080/
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a local file with AES-CBC (zero-padding the tail block)
    Encrypt {
        key: String,
        iv: String,
        input: PathBuf,
        output: PathBuf,
    },

    /// Decrypt a local file with AES-CBC
    Decrypt {
        key: String,
        iv: String,
        input: PathBuf,
        output: PathBuf,
    },

    /// Run the reverse proxy
    Proxy {
        bind_addr: IpAddr,
        port: u16,
        /// Web-root prefix the proxy answers under
        #[arg(default_value = "")]
        prefix: String,
        /// Directory holding the alias sidecars
        #[arg(long, default_value = "./_aliases")]
        aliases: PathBuf,
    },

    /// Mount the store as a read-only filesystem
    Mount {
        target: PathBuf,
        /// Base URL of a running proxy
        #[arg(default_value = "http://localhost:8080/")]
        proxy_url: String,
        /// Block cache database (created on first use)
        #[arg(long)]
        cache: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Encrypt {
            key,
            iv,
            input,
            output,
        } => crypt_file(&key, &iv, &input, &output, true),
        Commands::Decrypt {
            key,
            iv,
            input,
            output,
        } => crypt_file(&key, &iv, &input, &output, false),
        Commands::Proxy {
            bind_addr,
            port,
            prefix,
            aliases,
        } => run_proxy(bind_addr, port, prefix, aliases),
        Commands::Mount {
            target,
            proxy_url,
            cache,
        } => run_mount(&target, proxy_url, cache),
    }
}

/// Whole-file encrypt/decrypt, matching the blob pipeline byte for byte.
fn crypt_file(key: &str, iv: &str, input: &Path, output: &Path, encrypt: bool) -> Result<()> {
    let mut codec = AesCbc::new(&pad_key(key), iv.as_bytes(), None)
        .context("cannot construct cipher")?;

    let src = File::open(input).with_context(|| format!("cannot open {}", input.display()))?;
    let dst = File::create(output).with_context(|| format!("cannot create {}", output.display()))?;
    let mut dst = BufWriter::new(dst);

    if encrypt {
        let mut src = PadReader::new(BufReader::new(src));
        codec.encrypt_stream(&mut dst, &mut src)?;
    } else {
        let mut src = BufReader::new(src);
        codec.decrypt_stream(&mut dst, &mut src)?;
    }
    Ok(())
}

/// Pads or truncates a passphrase to a legal AES key length, the way the
/// historical tooling treated its KEY argument.
fn pad_key(key: &str) -> Vec<u8> {
    let target = match key.len() {
        0..=16 => 16,
        17..=24 => 24,
        _ => 32,
    };
    let mut padded = vec![0u8; target];
    let n = key.len().min(target);
    padded[..n].copy_from_slice(&key.as_bytes()[..n]);
    padded
}

fn run_proxy(bind_addr: IpAddr, port: u16, prefix: String, aliases: PathBuf) -> Result<()> {
    let config = ProxyConfig {
        bind_address: bind_addr,
        port,
        webroot: prefix,
        alias_root: aliases,
        ..ProxyConfig::default()
    };

    let runtime = tokio::runtime::Runtime::new().context("cannot start runtime")?;
    runtime.block_on(async {
        let server = ProxyServer::start(config).await?;
        tokio::signal::ctrl_c().await?;
        server.stop().await;
        Ok(())
    })
}

fn run_mount(target: &Path, proxy_url: String, cache: Option<PathBuf>) -> Result<()> {
    let config = MountConfig {
        proxy_url,
        cache_path: cache,
        ..MountConfig::default()
    };
    hgms_fuse::mount(config, target).context("mount failed")?;
    Ok(())
}
