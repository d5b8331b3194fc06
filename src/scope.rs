use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use floodlight_proto::profile::encode_gzipped;

use crate::debug_info::DebugInfoUploader;
use crate::profile::{MissingStackCounters, ProfileBuilder};
use crate::sampler::{AttachedSampler, SamplerMaps};
use crate::store::{ProfileStore, RawProfileSeries};
use crate::target::{
    LabelSet, ProfileFanout, CGROUP_PATH_LABEL, CPU_PROFILE_NAME, PROFILE_NAME_LABEL,
};
use crate::Caches;

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Compiled sampler object to load into the kernel.
    pub sampler_object_path: PathBuf,
    /// How long one drain-aggregate-upload cycle lasts.
    pub profiling_duration: Duration,
    /// Per-CPU sampling frequency in Hz.
    pub sample_freq: u64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sampler_object_path: "sampler.bpf.o".into(),
            profiling_duration: Duration::from_secs(10),
            sample_freq: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerState {
    Created,
    Running,
    /// Terminal.
    Stopped,
}

#[derive(Default)]
struct StatusInner {
    last_profile_taken_at: Option<SystemTime>,
    last_error: Option<String>,
}

/// Snapshot of one scope profiler, rendered by the status surface.
#[derive(Debug, Clone)]
pub struct ProfilerStatus {
    pub labels: LabelSet,
    pub last_profile_taken_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub missing_user_stacks: u64,
    pub missing_kernel_stacks: u64,
}

/// Profiles one scope: attaches the sampler to the scope's cgroup on every
/// online CPU and, once per profiling duration, drains the sampler maps into
/// a profile, uploads it, and clears the maps for the next cycle.
pub struct ScopeProfiler {
    target: LabelSet,
    config: ProfilerConfig,
    caches: Caches,
    store: Arc<dyn ProfileStore>,
    debug_info: Arc<DebugInfoUploader>,
    fanout: Arc<ProfileFanout>,
    missing_stacks: MissingStackCounters,
    state: Mutex<ProfilerState>,
    status: Mutex<StatusInner>,
    stop_send: Sender<()>,
    stop_receive: Receiver<()>,
}

impl ScopeProfiler {
    pub fn new(
        target: LabelSet,
        config: ProfilerConfig,
        caches: Caches,
        store: Arc<dyn ProfileStore>,
        debug_info: Arc<DebugInfoUploader>,
        fanout: Arc<ProfileFanout>,
    ) -> Arc<Self> {
        let (stop_send, stop_receive) = bounded(1);
        Arc::new(Self {
            target,
            config,
            caches,
            store,
            debug_info,
            fanout,
            missing_stacks: MissingStackCounters::default(),
            state: Mutex::new(ProfilerState::Created),
            status: Mutex::new(StatusInner::default()),
            stop_send,
            stop_receive,
        })
    }

    pub fn target(&self) -> &LabelSet {
        &self.target
    }

    /// The labels uploaded series carry: the scope's labels minus the
    /// `__`-prefixed internal ones, plus the injected profile name.
    pub fn labels(&self) -> LabelSet {
        let mut labels = LabelSet::new();
        labels.insert(PROFILE_NAME_LABEL.to_string(), CPU_PROFILE_NAME.to_string());
        for (name, value) in &self.target {
            if !name.starts_with("__") {
                labels.insert(name.clone(), value.clone());
            }
        }
        labels
    }

    pub fn state(&self) -> ProfilerState {
        *self.state.lock()
    }

    pub fn status(&self) -> ProfilerStatus {
        let status = self.status.lock();
        ProfilerStatus {
            labels: self.labels(),
            last_profile_taken_at: status.last_profile_taken_at,
            last_error: status.last_error.clone(),
            missing_user_stacks: self.missing_stacks.user_count(),
            missing_kernel_stacks: self.missing_stacks.kernel_count(),
        }
    }

    /// Spawns the profiling thread. Valid once, from `Created`.
    pub fn start(self: &Arc<Self>) -> Result<thread::JoinHandle<()>> {
        {
            let mut state = self.state.lock();
            match *state {
                ProfilerState::Created => *state = ProfilerState::Running,
                ProfilerState::Running => return Err(anyhow!("scope profiler already running")),
                ProfilerState::Stopped => return Err(anyhow!("scope profiler is stopped")),
            }
        }

        let profiler = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("scope-profiler".to_string())
            .spawn(move || {
                if let Err(e) = profiler.run() {
                    error!("scope profiler failed: {:?}", e);
                    profiler.status.lock().last_error = Some(format!("{:#}", e));
                }
                *profiler.state.lock() = ProfilerState::Stopped;
            })?;
        Ok(handle)
    }

    pub fn stop(&self) {
        debug!("stopping scope profiler");
        *self.state.lock() = ProfilerState::Stopped;
        let _ = self.stop_send.try_send(());
    }

    fn cgroup_path(&self) -> Result<PathBuf> {
        self.target
            .get(CGROUP_PATH_LABEL)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("target has no {} label", CGROUP_PATH_LABEL))
    }

    fn run(&self) -> Result<()> {
        let cgroup_path = self.cgroup_path()?;
        let sampler = AttachedSampler::load(
            &self.config.sampler_object_path,
            &cgroup_path,
            self.config.sample_freq,
        )?;
        self.run_loop(&sampler.maps())
    }

    /// The drain loop, detached from sampler setup so it can be exercised
    /// against in-memory maps.
    pub(crate) fn run_loop(&self, maps: &SamplerMaps<'_>) -> Result<()> {
        let builder = ProfileBuilder {
            ksym_cache: &self.caches.ksym,
            mapping_cache: &self.caches.mappings,
            object_cache: &self.caches.objects,
            perf_map_cache: &self.caches.perf_maps,
        };

        let ticker = tick(self.config.profiling_duration);
        debug!("start profiling loop");
        loop {
            select! {
                recv(self.stop_receive) -> _ => return Ok(()),
                recv(ticker) -> _ => {}
            }

            let capture_time = SystemTime::now();
            let result = self.cycle(&builder, maps, capture_time);
            if let Err(e) = &result {
                debug!("profile cycle error: {:?}", e);
            }

            let mut status = self.status.lock();
            status.last_profile_taken_at = Some(capture_time);
            status.last_error = result.err().map(|e| format!("{:#}", e));
        }
    }

    fn cycle(
        &self,
        builder: &ProfileBuilder<'_>,
        maps: &SamplerMaps<'_>,
        capture_time: SystemTime,
    ) -> Result<()> {
        let cycle_profile = builder.build(
            capture_time,
            self.config.profiling_duration,
            maps,
            &self.missing_stacks,
        )?;
        let encoded = encode_gzipped(&cycle_profile.profile)?;

        // Debug info rides a detached thread, concurrent with the next cycle.
        let uploader = Arc::clone(&self.debug_info);
        let object_files = cycle_profile.object_files;
        let _ = thread::Builder::new()
            .name("debuginfo-upload".to_string())
            .spawn(move || uploader.ensure_uploaded(&object_files));

        let labels = self.labels();
        self.fanout.publish(&labels, &encoded);

        let series = RawProfileSeries {
            labels,
            samples: vec![encoded],
        };
        // The write is awaited so a slow store back-pressures the cycle; an
        // error is retried implicitly next cycle.
        if let Err(e) = self.store.write_raw(&[series]) {
            error!("failed to send profile: {:?}", e);
        }

        if let Err(e) = maps.clear() {
            warn!("failed to clear sampler maps: {:?}", e);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::fake::{counts_entry, stacks_entry, FakeMap};
    use crate::store::NullStore;
    use floodlight_proto::profile::decode_gzipped;

    struct ChannelStore {
        send: Sender<RawProfileSeries>,
    }

    impl ProfileStore for ChannelStore {
        fn write_raw(&self, series: &[RawProfileSeries]) -> Result<()> {
            for entry in series {
                let _ = self.send.try_send(entry.clone());
            }
            Ok(())
        }
    }

    fn test_target() -> LabelSet {
        LabelSet::from([
            (CGROUP_PATH_LABEL.to_string(), "/sys/fs/cgroup/test".to_string()),
            ("service".to_string(), "api".to_string()),
        ])
    }

    fn test_profiler(config: ProfilerConfig, store: Arc<dyn ProfileStore>) -> Arc<ScopeProfiler> {
        ScopeProfiler::new(
            test_target(),
            config,
            Caches::new(),
            store,
            Arc::new(DebugInfoUploader::new(
                Arc::new(NullStore),
                std::env::temp_dir(),
            )),
            Arc::new(ProfileFanout::default()),
        )
    }

    #[test]
    fn public_labels_hide_internal_keys_and_add_the_name() {
        let profiler = test_profiler(ProfilerConfig::default(), Arc::new(NullStore));
        let labels = profiler.labels();

        assert_eq!(labels.get(PROFILE_NAME_LABEL).unwrap(), CPU_PROFILE_NAME);
        assert_eq!(labels.get("service").unwrap(), "api");
        assert!(!labels.contains_key(CGROUP_PATH_LABEL));
    }

    #[test]
    fn failing_sampler_load_is_fatal_for_the_scope() {
        let config = ProfilerConfig {
            sampler_object_path: "/does/not/exist.bpf.o".into(),
            ..Default::default()
        };
        let profiler = test_profiler(config, Arc::new(NullStore));

        assert_eq!(profiler.state(), ProfilerState::Created);
        let handle = profiler.start().unwrap();
        handle.join().unwrap();

        assert_eq!(profiler.state(), ProfilerState::Stopped);
        let status = profiler.status();
        assert!(status.last_error.unwrap().contains("sampler object"));
        // Stopped is terminal.
        assert!(profiler.start().is_err());
    }

    #[test]
    fn stop_is_terminal() {
        let profiler = test_profiler(ProfilerConfig::default(), Arc::new(NullStore));
        profiler.stop();
        assert_eq!(profiler.state(), ProfilerState::Stopped);
        assert!(profiler.start().is_err());
    }

    #[test]
    fn run_loop_builds_uploads_and_clears() {
        let (send, receive) = bounded(8);
        let config = ProfilerConfig {
            profiling_duration: Duration::from_millis(30),
            ..Default::default()
        };
        let profiler = test_profiler(config, Arc::new(ChannelStore { send }));

        let counts = FakeMap::with_entries([counts_entry(999_999, 1, -1, 25)]);
        let stacks = FakeMap::with_entries([stacks_entry(1, &[0xaaa, 0xbbb])]);
        let maps = SamplerMaps::new(&counts, &stacks);

        thread::scope(|scope| {
            let profiler = &profiler;
            let maps = &maps;
            scope.spawn(move || {
                let _ = profiler.run_loop(maps);
            });

            let series = receive
                .recv_timeout(Duration::from_secs(5))
                .expect("a profile should be uploaded within a few ticks");
            profiler.stop();

            assert_eq!(series.labels.get("service").unwrap(), "api");
            let profile = decode_gzipped(&series.samples[0]).unwrap();
            assert_eq!(profile.sample.len(), 1);
            assert_eq!(profile.sample[0].value, vec![25]);
        });

        // The cycle cleared both sampler maps after uploading.
        assert_eq!(counts.len(), 0);
        assert_eq!(stacks.len(), 0);
        assert!(profiler.status().last_profile_taken_at.is_some());
        assert!(profiler.status().last_error.is_none());
    }
}
