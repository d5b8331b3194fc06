use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use procfs::process::{MMPermissions, MMapPath, Process};
use tracing::debug;

pub type Pid = u32;

/// An executable, file-backed region of a process's address space, as read
/// from `/proc/[pid]/maps`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableMapping {
    pub start_addr: u64,
    pub end_addr: u64,
    pub offset: u64,
    pub path: PathBuf,
    pub dev: (i32, i32),
    pub inode: u64,
}

impl ExecutableMapping {
    pub fn contains(&self, addr: u64) -> bool {
        (self.start_addr..self.end_addr).contains(&addr)
    }

    /// The path as seen through the process's own mount namespace.
    pub fn namespaced_path(&self, pid: Pid) -> PathBuf {
        PathBuf::from(format!("/proc/{}/root{}", pid, self.path.display()))
    }
}

/// Caches the executable mappings of every process we have sampled.
///
/// `/proc/[pid]/maps` is parsed at most once per process until the entry is
/// evicted. Processes exit at any time, so a vanished or unreadable pid is
/// not an error, the lookup just comes back empty.
pub struct MappingCache {
    proc_prefix: PathBuf,
    inner: RwLock<HashMap<Pid, Arc<Vec<ExecutableMapping>>>>,
}

impl Default for MappingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingCache {
    pub fn new() -> Self {
        Self::with_proc_prefix("/proc".into())
    }

    pub fn with_proc_prefix(proc_prefix: PathBuf) -> Self {
        Self {
            proc_prefix,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// The executable mapping covering `addr`, if any. Anonymous regions,
    /// the vdso, stacks and heaps all answer `None`.
    pub fn mapping_for(&self, pid: Pid, addr: u64) -> Option<ExecutableMapping> {
        let mappings = self.mappings_for_process(pid)?;
        mappings.iter().find(|m| m.contains(addr)).cloned()
    }

    pub fn mappings_for_process(&self, pid: Pid) -> Option<Arc<Vec<ExecutableMapping>>> {
        if let Some(mappings) = self.inner.read().get(&pid) {
            return Some(Arc::clone(mappings));
        }

        let parsed = match self.parse(pid) {
            Ok(mappings) => Arc::new(mappings),
            Err(e) => {
                // The process is most likely gone already.
                debug!("could not read maps for pid {}: {:?}", pid, e);
                return None;
            }
        };

        let mut inner = self.inner.write();
        Some(Arc::clone(inner.entry(pid).or_insert(parsed)))
    }

    pub fn evict(&self, pid: Pid) {
        self.inner.write().remove(&pid);
    }

    fn parse(&self, pid: Pid) -> anyhow::Result<Vec<ExecutableMapping>> {
        let proc = Process::new_with_root(self.proc_prefix.join(pid.to_string()))?;
        let maps = proc.maps()?;

        let mut mappings = Vec::new();
        for map in maps.iter() {
            if !map.perms.contains(MMPermissions::EXECUTE) {
                continue;
            }
            let MMapPath::Path(path) = &map.pathname else {
                continue;
            };
            mappings.push(ExecutableMapping {
                start_addr: map.address.0,
                end_addr: map.address.1,
                offset: map.offset,
                path: path.clone(),
                dev: map.dev,
                inode: map.inode,
            });
        }
        Ok(mappings)
    }
}

/// Cycle-local view over the mapping cache. Remembers every distinct
/// `(pid, mapping)` pair handed out during one profiling cycle so that the
/// debug info uploader can enumerate the object files that were seen.
pub struct CycleMappings<'a> {
    cache: &'a MappingCache,
    seen: Vec<(Pid, ExecutableMapping)>,
    seen_keys: HashSet<(Pid, PathBuf)>,
}

impl<'a> CycleMappings<'a> {
    pub fn new(cache: &'a MappingCache) -> Self {
        Self {
            cache,
            seen: Vec::new(),
            seen_keys: HashSet::new(),
        }
    }

    pub fn mapping_for(&mut self, pid: Pid, addr: u64) -> Option<ExecutableMapping> {
        let mapping = self.cache.mapping_for(pid, addr)?;
        if self.seen_keys.insert((pid, mapping.path.clone())) {
            self.seen.push((pid, mapping.clone()));
        }
        Some(mapping)
    }

    pub fn all_mappings(&self) -> &[(Pid, ExecutableMapping)] {
        &self.seen
    }
}
