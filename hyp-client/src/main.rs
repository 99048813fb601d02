//! Command-line client for the install pipeline
//!
//! Drives one operation per invocation against a metadata service and
//! prints phase and progress to the terminal. Ctrl-C pauses the running
//! operation cooperatively; re-running the same command continues it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::Level;

use hyp_download::RateLimiter;
use hyp_installer::{
    InstallManager, InstallOperation, InstallPhase, InstallRequest, InstallService,
    InstalledBuild, SiblingInstall,
};
use hyp_manifest::{AudioLanguages, GameVariant, MetadataClient};
use hyp_unpack::HpatchTool;

#[derive(Parser)]
#[command(
    name = "hyp",
    about = "Game package install and update pipeline",
    version,
    long_about = "Installs, updates, repairs and predownloads game builds from a \
                  metadata service, with resumable downloads, checksum verification, \
                  binary-diff patching and cross-variant hard linking."
)]
struct Cli {
    /// Set the logging level
    #[arg(short, long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Base URL of the metadata service
    #[arg(short, long, env = "HYP_METADATA_URL")]
    metadata_url: String,

    /// Directory for cached manifest index files
    #[arg(long, env = "HYP_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Path to the external binary-diff merge tool
    #[arg(long, env = "HYP_HPATCH", default_value = "hpatchz")]
    hpatch: PathBuf,

    /// Aggregate download limit in KiB/s (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    rate_limit: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
struct OperationArgs {
    /// Variant identifier, e.g. `hk4e_global`
    biz: String,

    /// Install directory
    #[arg(short, long)]
    path: PathBuf,

    /// Audio languages as comma-separated locale codes (e.g. `zh-cn,ja-jp`)
    #[arg(short, long, default_value = "")]
    audio: String,

    /// Allow hard-linking identical files from sibling installs
    #[arg(long)]
    hard_link: bool,

    /// Sibling install for hard linking, as `<biz>:<path>` (repeatable)
    #[arg(long = "sibling", value_parser = parse_sibling)]
    siblings: Vec<(String, PathBuf)>,

    /// Promote downloads without checksum verification
    ///
    /// The only way corrupted data can reach the install; use only in
    /// environments where hashing is prohibitively slow.
    #[arg(long)]
    skip_verify: bool,
}

fn parse_sibling(value: &str) -> Result<(String, PathBuf), String> {
    value
        .split_once(':')
        .map(|(biz, path)| (biz.to_string(), PathBuf::from(path)))
        .ok_or_else(|| format!("expected <biz>:<path>, got {value:?}"))
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a fresh build
    Install(OperationArgs),

    /// Update an existing build to the released version
    Update(OperationArgs),

    /// Re-validate an install and fix mismatched files
    Repair(OperationArgs),

    /// Fetch an upcoming version's payload ahead of release
    Predownload(OperationArgs),
}

impl Commands {
    fn operation(&self) -> InstallOperation {
        match self {
            Self::Install(_) => InstallOperation::Install,
            Self::Update(_) => InstallOperation::Update,
            Self::Repair(_) => InstallOperation::Repair,
            Self::Predownload(_) => InstallOperation::Predownload,
        }
    }

    fn args(&self) -> &OperationArgs {
        match self {
            Self::Install(args)
            | Self::Update(args)
            | Self::Repair(args)
            | Self::Predownload(args) => args,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(Level::from(cli.log_level).to_string())
            }),
        )
        .init();

    let mut client = MetadataClient::new(&cli.metadata_url).context("invalid metadata URL")?;
    if let Some(cache_dir) = &cli.cache_dir {
        client = client.with_cache_dir(cache_dir);
    }
    let limiter = Arc::new(RateLimiter::new(cli.rate_limit * 1024));
    let service = InstallService::new(client.clone(), limiter, HpatchTool::new(&cli.hpatch))
        .context("failed to build install service")?;
    let manager = InstallManager::new(service);

    let operation = cli.command.operation();
    let args = cli.command.args();
    let variant = GameVariant::from_biz(&args.biz).context("invalid biz identifier")?;

    let mut request = InstallRequest::new(variant.clone(), &args.path, operation);
    request.audio = AudioLanguages::from_locales(&args.audio);
    request.hard_link_enabled = args.hard_link;
    request.skip_verify = args.skip_verify;
    request.siblings = resolve_siblings(&client, &args.siblings).await?;

    let handle = manager.start_or_continue(request);
    let poll = Duration::from_millis(500);
    let mut last_line = String::new();
    let mut started = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                tracing::info!("pausing, partial files stay resumable");
                let _ = manager.pause(&variant);
            }
            () = tokio::time::sleep(poll) => {}
        }

        let status = handle.status();
        if status.phase != InstallPhase::None {
            started = true;
        }
        match status.phase {
            InstallPhase::Finish => {
                println!("\n{operation} finished");
                return Ok(());
            }
            InstallPhase::Error => {
                let message = status.error.unwrap_or_else(|| "unknown error".to_string());
                anyhow::bail!("{operation} failed: {message}");
            }
            InstallPhase::None if started => {
                println!("\npaused; run the same command again to continue");
                return Ok(());
            }
            InstallPhase::None => {}
            phase => {
                let line = match phase {
                    InstallPhase::Decompress | InstallPhase::Merge => {
                        format!(
                            "{phase}: {}/{} entries",
                            status.content.finished_files, status.content.total_files
                        )
                    }
                    _ => format!(
                        "{phase}: {:.1}% ({}/{} bytes)",
                        status.download.ratio() * 100.0,
                        status.download.finished_bytes,
                        status.download.total_bytes
                    ),
                };
                if line != last_line {
                    eprint!("\r{line}        ");
                    last_line = line;
                }
            }
        }
    }
}

/// Inspect configured sibling installs for the hard-link resolver
async fn resolve_siblings(
    client: &MetadataClient,
    configured: &[(String, PathBuf)],
) -> anyhow::Result<Vec<SiblingInstall>> {
    let mut siblings = Vec::new();
    for (biz, path) in configured {
        let sibling_variant =
            GameVariant::from_biz(biz).with_context(|| format!("invalid sibling biz {biz:?}"))?;
        let profile = client.variant_profile(&sibling_variant).await?;
        let build = InstalledBuild::detect(path, &profile).await?;
        tracing::debug!(
            "sibling {biz} at {} detected version {:?}",
            path.display(),
            build.version
        );
        siblings.push(SiblingInstall {
            variant: sibling_variant,
            install_path: path.clone(),
            version: build.version,
            active: false,
        });
    }
    Ok(siblings)
}
