use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, unbounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::debug_info::DebugInfoUploader;
use crate::scope::{ProfilerConfig, ProfilerStatus, ScopeProfiler};
use crate::store::ProfileStore;
use crate::Caches;

/// Label key whose value is the cgroup the scope's sampler attaches to.
/// Internal, stripped from uploaded series.
pub const CGROUP_PATH_LABEL: &str = "__cgroup_path__";
pub const PROFILE_NAME_LABEL: &str = "__name__";
pub const CPU_PROFILE_NAME: &str = "floodlight_cpu";

/// We profile every 10 seconds, so leave 1s of wiggle room: if no profile
/// matched after 11s there is very likely no profiler matching the selector.
pub const DEFAULT_NEXT_PROFILE_DEADLINE: Duration = Duration::from_secs(11);

/// A scope is identified by its label set. Sorted keys make label sets
/// usable as map keys and give stable rendering.
pub type LabelSet = BTreeMap<String, String>;

/// Equality matcher over a single label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    pub name: String,
    pub value: String,
}

impl LabelMatcher {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        labels.get(&self.name) == Some(&self.value)
    }
}

pub fn matches_all(matchers: &[LabelMatcher], labels: &LabelSet) -> bool {
    matchers.iter().all(|matcher| matcher.matches(labels))
}

#[derive(Debug, Clone)]
pub enum TargetEvent {
    Added(LabelSet),
    Removed(LabelSet),
}

/// Something that discovers profiling targets: a pod watcher, a systemd unit
/// lister, or the static list below. `run` streams add/remove events until
/// the stop channel fires.
pub trait TargetSource: Send {
    fn events(&self) -> Receiver<TargetEvent>;
    fn run(&self, stop: Receiver<()>) -> Result<()>;
}

/// The degenerate target source: a fixed list of cgroups given on the
/// command line, each becoming one scope.
pub struct StaticTargets {
    node: String,
    cgroup_paths: Vec<PathBuf>,
    send: Sender<TargetEvent>,
    receive: Receiver<TargetEvent>,
}

impl StaticTargets {
    pub fn new(node: &str, cgroup_paths: Vec<PathBuf>) -> Self {
        let (send, receive) = unbounded();
        Self {
            node: node.to_string(),
            cgroup_paths,
            send,
            receive,
        }
    }
}

impl TargetSource for StaticTargets {
    fn events(&self) -> Receiver<TargetEvent> {
        self.receive.clone()
    }

    fn run(&self, stop: Receiver<()>) -> Result<()> {
        for path in &self.cgroup_paths {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());

            let labels = LabelSet::from([
                (CGROUP_PATH_LABEL.to_string(), path.display().to_string()),
                ("node".to_string(), self.node.clone()),
                ("cgroup".to_string(), name),
            ]);
            self.send.send(TargetEvent::Added(labels))?;
        }

        // Static targets never change; wait for shutdown.
        let _ = stop.recv();
        Ok(())
    }
}

struct Waiter {
    id: u64,
    matchers: Vec<LabelMatcher>,
    send: Sender<Vec<u8>>,
}

/// Hands finished profiles to whoever is waiting for one with matching
/// labels, for the "fetch the next matching profile" endpoint.
#[derive(Default)]
pub struct ProfileFanout {
    next_waiter_id: Mutex<u64>,
    waiters: Mutex<Vec<Waiter>>,
}

impl ProfileFanout {
    /// Called by scope profilers at the end of each cycle with the encoded
    /// profile. Fulfills and removes every matching waiter.
    pub fn publish(&self, labels: &LabelSet, encoded_profile: &[u8]) {
        self.waiters.lock().retain(|waiter| {
            if matches_all(&waiter.matchers, labels) {
                let _ = waiter.send.try_send(encoded_profile.to_vec());
                false
            } else {
                true
            }
        });
    }

    /// Blocks until a scope matching all `matchers` completes a cycle, or
    /// the deadline passes.
    pub fn wait(&self, matchers: &[LabelMatcher], deadline: Duration) -> Option<Vec<u8>> {
        let (send, receive) = bounded(1);
        let id = {
            let mut next_id = self.next_waiter_id.lock();
            *next_id += 1;
            let id = *next_id;
            self.waiters.lock().push(Waiter {
                id,
                matchers: matchers.to_vec(),
                send,
            });
            id
        };

        match receive.recv_timeout(deadline) {
            Ok(profile) => Some(profile),
            Err(_) => {
                self.waiters.lock().retain(|waiter| waiter.id != id);
                None
            }
        }
    }
}

/// Supervises one scope profiler per live target, fed by any number of
/// target sources.
pub struct TargetManager {
    config: ProfilerConfig,
    caches: Caches,
    store: Arc<dyn ProfileStore>,
    debug_info: Arc<DebugInfoUploader>,
    fanout: Arc<ProfileFanout>,
    profilers: Mutex<HashMap<LabelSet, Arc<ScopeProfiler>>>,
}

impl TargetManager {
    pub fn new(
        config: ProfilerConfig,
        caches: Caches,
        store: Arc<dyn ProfileStore>,
        debug_info: Arc<DebugInfoUploader>,
    ) -> Self {
        Self {
            config,
            caches,
            store,
            debug_info,
            fanout: Arc::new(ProfileFanout::default()),
            profilers: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the supervisor loop until `stop` fires: spawns the sources,
    /// multiplexes their event streams, and keeps the profiler set in sync.
    pub fn run(&self, sources: Vec<Box<dyn TargetSource>>, stop: Receiver<()>) -> Result<()> {
        let mut receivers: Vec<Receiver<TargetEvent>> =
            sources.iter().map(|source| source.events()).collect();

        let mut source_stops = Vec::new();
        let mut source_handles = Vec::new();
        for source in sources {
            let (stop_send, stop_receive) = bounded(1);
            source_stops.push(stop_send);
            source_handles.push(
                thread::Builder::new()
                    .name("target-source".to_string())
                    .spawn(move || {
                        if let Err(e) = source.run(stop_receive) {
                            warn!("target source failed: {:?}", e);
                        }
                    })?,
            );
        }

        loop {
            enum Step {
                Stop,
                Event(TargetEvent),
                SourceGone(usize),
            }

            let step = {
                let mut select = Select::new();
                for receiver in &receivers {
                    select.recv(receiver);
                }
                let stop_index = select.recv(&stop);

                let op = select.select();
                let index = op.index();
                if index == stop_index {
                    let _ = op.recv(&stop);
                    Step::Stop
                } else {
                    match op.recv(&receivers[index]) {
                        Ok(event) => Step::Event(event),
                        Err(_) => Step::SourceGone(index),
                    }
                }
            };

            match step {
                Step::Stop => break,
                Step::Event(event) => self.handle_event(event),
                // The source hung up; stop watching its channel.
                Step::SourceGone(index) => {
                    receivers.remove(index);
                }
            }
        }

        info!("target manager shutting down");
        for stop_send in source_stops {
            let _ = stop_send.try_send(());
        }
        for handle in source_handles {
            let _ = handle.join();
        }
        for (_, profiler) in self.profilers.lock().drain() {
            profiler.stop();
        }
        Ok(())
    }

    fn handle_event(&self, event: TargetEvent) {
        match event {
            TargetEvent::Added(target) => {
                let mut profilers = self.profilers.lock();
                if profilers.contains_key(&target) {
                    return;
                }
                debug!("starting scope profiler for {:?}", target);
                let profiler = ScopeProfiler::new(
                    target.clone(),
                    self.config.clone(),
                    self.caches.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.debug_info),
                    Arc::clone(&self.fanout),
                );
                if let Err(e) = profiler.start() {
                    warn!("could not start scope profiler: {:?}", e);
                    return;
                }
                profilers.insert(target, profiler);
            }
            TargetEvent::Removed(target) => {
                debug!("removing scope profiler for {:?}", target);
                if let Some(profiler) = self.profilers.lock().remove(&target) {
                    profiler.stop();
                }
            }
        }
    }

    /// Snapshot of every live scope for status rendering, sorted by label
    /// set so the output is stable.
    pub fn active_profilers(&self) -> Vec<ProfilerStatus> {
        let mut statuses: Vec<ProfilerStatus> = self
            .profilers
            .lock()
            .values()
            .map(|profiler| profiler.status())
            .collect();
        statuses.sort_by(|a, b| a.labels.cmp(&b.labels));
        statuses
    }

    /// The most recent profile of a scope matching all `matchers`, waiting
    /// at most `deadline` for one to complete a cycle.
    pub fn next_matching_profile(
        &self,
        matchers: &[LabelMatcher],
        deadline: Duration,
    ) -> Option<Vec<u8>> {
        self.fanout.wait(matchers, deadline)
    }
}
