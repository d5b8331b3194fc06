use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use floodlight::scope::ProfilerConfig;

#[derive(clap::ValueEnum, Debug, Clone, Default)]
pub(crate) enum LoggingLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

pub(crate) fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

#[derive(Parser, Debug)]
pub(crate) struct CliArgs {
    /// Name of the node this agent runs on.
    #[arg(long, default_value = "localhost")]
    pub(crate) node: String,
    /// Cgroup to profile; may be given multiple times.
    #[arg(long = "cgroup", value_name = "CGROUP_PATH")]
    pub(crate) cgroups: Vec<PathBuf>,
    /// Compiled sampler object to load into the kernel.
    #[arg(long, default_value = ProfilerConfig::default().sampler_object_path.into_os_string())]
    pub(crate) sampler_object: PathBuf,
    /// Seconds between profile uploads.
    #[arg(long, default_value = ProfilerConfig::default().profiling_duration.as_secs().to_string(),
          value_name = "SECONDS", value_parser = parse_duration)]
    pub(crate) profiling_duration: Duration,
    /// Per-CPU sampling frequency in Hz.
    #[arg(long, default_value_t = ProfilerConfig::default().sample_freq)]
    pub(crate) sample_freq: u64,
    /// Base URL of the profile store. Profiles are discarded when unset.
    #[arg(long)]
    pub(crate) store_address: Option<String>,
    /// Bearer token to authenticate against the store.
    #[arg(long)]
    pub(crate) bearer_token: Option<String>,
    /// File to read the bearer token from.
    #[arg(long)]
    pub(crate) bearer_token_file: Option<PathBuf>,
    /// Set floodlight's logging level.
    #[arg(long, default_value_t, value_enum)]
    pub(crate) logging: LoggingLevel,
}
