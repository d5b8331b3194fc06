use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::process::Pid;

#[derive(Debug, thiserror::Error)]
pub enum PerfMapError {
    #[error("reading perf map: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed perf map line: {0:?}")]
    MalformedLine(String),
}

#[derive(Debug, PartialEq, Clone)]
pub struct PerfMapEntry {
    pub start: u64,
    pub size: u64,
    pub name: String,
}

/// A parsed `/tmp/perf-<pid>.map`, the de-facto format JIT runtimes use to
/// publish symbols for the code they generate. Each line is
/// `hex_start hex_size name`; names may contain spaces.
#[derive(Debug)]
pub struct PerfMap {
    /// Sorted by start address.
    entries: Vec<PerfMapEntry>,
}

impl PerfMap {
    pub fn parse<R: Read>(reader: R) -> Result<PerfMap, PerfMapError> {
        let mut entries = Vec::new();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let mut fields = line.splitn(3, ' ');
            let (Some(start), Some(size), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(PerfMapError::MalformedLine(line));
            };
            let (Ok(start), Ok(size)) = (
                u64::from_str_radix(start, 16),
                u64::from_str_radix(size, 16),
            ) else {
                return Err(PerfMapError::MalformedLine(line));
            };

            entries.push(PerfMapEntry {
                start,
                size,
                name: name.trim_end().to_string(),
            });
        }
        entries.sort_by_key(|entry| entry.start);
        Ok(PerfMap { entries })
    }

    /// The JIT symbol covering `addr`, if any.
    pub fn lookup(&self, addr: u64) -> Option<&str> {
        let idx = self.entries.partition_point(|entry| entry.start <= addr);
        if idx == 0 {
            return None;
        }
        let entry = &self.entries[idx - 1];
        (addr < entry.start + entry.size).then_some(entry.name.as_str())
    }
}

enum CachedPerfMap {
    Parsed(Arc<PerfMap>),
    /// The file existed but did not parse. Remembered so we do not rescan
    /// and re-log every cycle.
    Broken,
}

/// Process-wide cache of per-pid JIT symbol maps. Only a minority of
/// processes run a JIT, so an absent file is the common, silent case.
pub struct PerfMapCache {
    map_dir: PathBuf,
    inner: RwLock<HashMap<Pid, CachedPerfMap>>,
}

impl Default for PerfMapCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfMapCache {
    pub fn new() -> Self {
        Self::with_map_dir("/tmp".into())
    }

    pub fn with_map_dir(map_dir: PathBuf) -> Self {
        Self {
            map_dir,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn perf_map_for(&self, pid: Pid) -> Option<Arc<PerfMap>> {
        match self.inner.read().get(&pid) {
            Some(CachedPerfMap::Parsed(map)) => return Some(Arc::clone(map)),
            Some(CachedPerfMap::Broken) => return None,
            None => {}
        }

        let path = self.map_dir.join(format!("perf-{}.map", pid));
        // Absent is the normal case, not worth caching: the runtime may
        // still write the map later in the process's life.
        let file = File::open(&path).ok()?;

        match PerfMap::parse(file) {
            Ok(map) => {
                let map = Arc::new(map);
                self.inner
                    .write()
                    .insert(pid, CachedPerfMap::Parsed(Arc::clone(&map)));
                Some(map)
            }
            Err(e) => {
                warn!("ignoring unparseable perf map {}: {}", path.display(), e);
                self.inner.write().insert(pid, CachedPerfMap::Broken);
                None
            }
        }
    }

    pub fn evict(&self, pid: Pid) {
        self.inner.write().remove(&pid);
    }
}
