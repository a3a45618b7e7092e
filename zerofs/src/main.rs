use anyhow::Context;
use clap::Parser;
use fuser::MountOption;
use std::path::PathBuf;
use std::sync::Arc;
use zerofs::{fs::Options, store::B2, ZeroFs, ZeroFuse};

/// Mount a Backblaze B2 bucket as a local filesystem.
#[derive(Parser, Debug)]
#[command(name = "zerofs", version, about)]
struct Args {
    /// Where to mount the filesystem
    mount: PathBuf,

    /// The B2 bucket to mount
    #[arg(long)]
    bucket: String,

    /// Cache directory to use
    #[arg(long, default_value = "~/.zerofs")]
    cache_dir: String,

    /// Disk cache size in MB
    #[arg(long, default_value_t = 5000)]
    cache_size: u64,

    /// Run in the background
    #[arg(long)]
    background: bool,

    /// Log debug info
    #[arg(long)]
    verbose: bool,
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    let cache_dir = expand_home(&args.cache_dir);
    let store = Arc::new(B2::from_env().context("B2 authorization failed")?);

    // fork before the worker threads exist
    if args.background {
        nix::unistd::daemon(true, false).context("failed to daemonize")?;
    }

    let mut opts = Options::new(&args.bucket, cache_dir);
    opts.cache_size_mb = args.cache_size;
    let fs = ZeroFs::new(store, opts)
        .with_context(|| format!("cannot mount bucket {}", args.bucket))?;

    let options = [
        MountOption::FSName("zerofs".to_string()),
        MountOption::AutoUnmount,
        MountOption::AllowOther,
    ];
    fuser::mount2(ZeroFuse::new(fs), &args.mount, &options)
        .with_context(|| format!("mount at {} failed", args.mount.display()))?;
    Ok(())
}
