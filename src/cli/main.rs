use std::error::Error;
use std::fs;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::bounded;
use nix::unistd::Uid;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

use floodlight::debug_info::DebugInfoUploader;
use floodlight::scope::ProfilerConfig;
use floodlight::store::{DebugInfoStore, HttpStore, NullStore, ProfileStore};
use floodlight::target::{StaticTargets, TargetManager, TargetSource};
use floodlight::Caches;

mod args;

use crate::args::CliArgs;
use crate::args::LoggingLevel;

const STORE_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.logging {
            LoggingLevel::Trace => Level::TRACE,
            LoggingLevel::Debug => Level::DEBUG,
            LoggingLevel::Info => Level::INFO,
            LoggingLevel::Warn => Level::WARN,
            LoggingLevel::Error => Level::ERROR,
        })
        .with_ansi(std::io::stdout().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if !Uid::current().is_root() {
        error!("root permissions are required to run floodlight");
        std::process::exit(1);
    }

    if args.cgroups.is_empty() {
        error!("no targets: pass at least one --cgroup");
        std::process::exit(1);
    }

    let token = match (&args.bearer_token, &args.bearer_token_file) {
        (Some(token), _) => Some(token.clone()),
        (None, Some(path)) => Some(fs::read_to_string(path)?.trim().to_string()),
        (None, None) => None,
    };

    let (profile_store, debug_info_store): (Arc<dyn ProfileStore>, Arc<dyn DebugInfoStore>) =
        match &args.store_address {
            Some(address) => {
                debug!("uploading profiles to {}", address);
                let store = Arc::new(HttpStore::new(address, token, STORE_TIMEOUT)?);
                (store.clone(), store)
            }
            None => {
                info!("no store address configured, profiles will be discarded");
                (Arc::new(NullStore), Arc::new(NullStore))
            }
        };

    let config = ProfilerConfig {
        sampler_object_path: args.sampler_object,
        profiling_duration: args.profiling_duration,
        sample_freq: args.sample_freq,
    };

    let manager = TargetManager::new(
        config,
        Caches::new(),
        profile_store,
        Arc::new(DebugInfoUploader::new(
            debug_info_store,
            std::env::temp_dir(),
        )),
    );

    let (stop_send, stop_receive) = bounded(1);
    ctrlc::set_handler(move || {
        info!("received Ctrl+C, stopping...");
        let _ = stop_send.try_send(());
    })
    .expect("Error setting Ctrl-C handler");

    info!(
        "starting floodlight on node {} with {} target(s)",
        args.node,
        args.cgroups.len()
    );
    let sources: Vec<Box<dyn TargetSource>> =
        vec![Box::new(StaticTargets::new(&args.node, args.cgroups))];
    manager.run(sources, stop_receive)?;

    Ok(())
}
