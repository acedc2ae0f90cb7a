#![forbid(unsafe_code)]
//! Broken Fuse daemon.
//!
//! Mounts a fault-injecting passthrough filesystem for testing. Exit
//! codes: 0 clean unmount, 1 argument error, 2 mount failure, 3
//! backing-store failure during mount. Internal invariant violations
//! abort with code 10 from inside the adapter.

use anyhow::Context;
use bf_core::{Backing, BrokenFs, DirBacking, MemBacking};
use bf_fuse::MountOptions;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const EXIT_ARGS: i32 = 1;
const EXIT_MOUNT: i32 = 2;
const EXIT_BACKING: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "brokenfuse", version, about = "Fault-injecting passthrough filesystem")]
struct Args {
    /// Mount point of the filesystem.
    #[arg(value_name = "MOUNT_POINT")]
    mountpoint: PathBuf,

    /// Backing directory to pass operations through to. Without it, the
    /// backing store is an empty in-memory tree.
    #[arg(short, long, value_name = "DIR")]
    backing: Option<PathBuf>,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(EXIT_ARGS);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let backing: Arc<dyn Backing> = match &args.backing {
        Some(dir) => match DirBacking::open(dir)
            .with_context(|| format!("cannot open backing directory {}", dir.display()))
        {
            Ok(backing) => Arc::new(backing),
            Err(err) => {
                eprintln!("error: {err:#}");
                std::process::exit(EXIT_BACKING);
            }
        },
        None => Arc::new(MemBacking::new()),
    };

    let fs = Arc::new(BrokenFs::with_defaults(backing));
    let options = MountOptions {
        allow_other: args.allow_other,
        ..MountOptions::default()
    };

    info!(
        mountpoint = %args.mountpoint.display(),
        backing = ?args.backing,
        "mounting"
    );

    if let Err(err) = bf_fuse::mount(fs, &args.mountpoint, &options) {
        eprintln!("error: mount failed: {err}");
        std::process::exit(EXIT_MOUNT);
    }
}
