use std::ffi::c_void;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use libbpf_rs::{Link, MapCore, MapFlags, MapHandle, ObjectBuilder};
use tracing::debug;

use crate::perf_events::setup_cgroup_perf_event;
use crate::util::get_online_cpus;

/// Always needs to be in sync with MAX_STACK_DEPTH in the sampler program.
pub const STACK_DEPTH: usize = 127;
pub const DOUBLE_STACK_DEPTH: usize = 254;

const COUNT_KEY_SIZE: usize = 12;
const COUNT_VALUE_SIZE: usize = 8;
const STACK_BYTES: usize = STACK_DEPTH * 8;

const SAMPLER_PROGRAM_NAME: &str = "do_sample";
const COUNTS_MAP_NAME: &str = "counts";
const STACK_TRACES_MAP_NAME: &str = "stack_traces";

#[derive(Debug, thiserror::Error)]
pub enum SamplerMapError {
    #[error("count key has {0} bytes, expected 12")]
    BadKeyLength(usize),
    #[error("count value has {0} bytes, expected 8")]
    BadValueLength(usize),
    #[error("stack trace has {0} bytes, expected 1016")]
    BadStackLength(usize),
    #[error("count value vanished mid-iteration")]
    VanishedValue,
    #[error("map operation failed: {0}")]
    Map(String),
}

/// One decoded key of the `counts` map: 12 bytes of
/// `u32 pid | i32 user stack id | i32 kernel stack id`, written by the
/// sampler in host byte order. A negative stack id means no stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CountKey {
    pub pid: u32,
    pub user_stack_id: i32,
    pub kernel_stack_id: i32,
}

impl CountKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SamplerMapError> {
        if bytes.len() != COUNT_KEY_SIZE {
            return Err(SamplerMapError::BadKeyLength(bytes.len()));
        }
        Ok(Self {
            pid: u32::from_ne_bytes(bytes[0..4].try_into().expect("length checked")),
            user_stack_id: i32::from_ne_bytes(bytes[4..8].try_into().expect("length checked")),
            kernel_stack_id: i32::from_ne_bytes(bytes[8..12].try_into().expect("length checked")),
        })
    }

    pub fn to_bytes(self) -> [u8; COUNT_KEY_SIZE] {
        let mut bytes = [0u8; COUNT_KEY_SIZE];
        bytes[0..4].copy_from_slice(&self.pid.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.user_stack_id.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.kernel_stack_id.to_ne_bytes());
        bytes
    }
}

/// The map operations the drain loop needs. `next_key` mirrors the kernel's
/// get-next-key contract: the cursor is the previously returned key, and
/// deleting the key under the cursor restarts iteration from the beginning,
/// which is exactly the corruption the clear protocol below avoids.
pub trait RawMap: Send + Sync {
    /// The first key when `prev` is `None`, the key after `prev` otherwise,
    /// `None` once the map is exhausted.
    fn next_key(&self, prev: Option<&[u8]>) -> Result<Option<Vec<u8>>, SamplerMapError>;
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SamplerMapError>;
    fn delete(&self, key: &[u8]) -> Result<(), SamplerMapError>;
}

/// `RawMap` over a BPF map fd.
pub struct BpfRawMap<M> {
    map: M,
}

impl<M: MapCore> BpfRawMap<M> {
    pub fn new(map: M) -> Self {
        Self { map }
    }
}

impl<M: MapCore + Send + Sync> RawMap for BpfRawMap<M> {
    fn next_key(&self, prev: Option<&[u8]>) -> Result<Option<Vec<u8>>, SamplerMapError> {
        let mut next = vec![0u8; self.map.key_size() as usize];
        let prev_ptr = match prev {
            Some(prev) => prev.as_ptr() as *const c_void,
            None => std::ptr::null(),
        };
        let ret = unsafe {
            libbpf_sys::bpf_map_get_next_key(
                self.map.as_fd().as_raw_fd(),
                prev_ptr,
                next.as_mut_ptr() as *mut c_void,
            )
        };
        if ret == 0 {
            return Ok(Some(next));
        }
        if -ret == libc::ENOENT {
            return Ok(None);
        }
        Err(SamplerMapError::Map(format!(
            "get_next_key failed with {}",
            ret
        )))
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SamplerMapError> {
        self.map
            .lookup(key, MapFlags::ANY)
            .map_err(|e| SamplerMapError::Map(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), SamplerMapError> {
        self.map
            .delete(key)
            .map_err(|e| SamplerMapError::Map(e.to_string()))
    }
}

/// The two maps the in-kernel sampler fills during a cycle:
/// `counts` aggregates `(pid, user sid, kernel sid) -> u64` and
/// `stack_traces` holds `u32 sid -> 127 addresses`, zero padded.
pub struct SamplerMaps<'a> {
    counts: &'a dyn RawMap,
    stack_traces: &'a dyn RawMap,
}

impl<'a> SamplerMaps<'a> {
    pub fn new(counts: &'a dyn RawMap, stack_traces: &'a dyn RawMap) -> Self {
        Self {
            counts,
            stack_traces,
        }
    }

    /// Single-pass iterator over the counts map. Each key is copied out of
    /// the map before the cursor advances past it.
    pub fn counts(&self) -> CountsIter<'_> {
        CountsIter {
            map: self.counts,
            prev: None,
            done: false,
        }
    }

    /// The stack stored under `stack_id`, or `None` if the sampler has
    /// already evicted it from its side map.
    pub fn stack_trace(
        &self,
        stack_id: i32,
    ) -> Result<Option<[u64; STACK_DEPTH]>, SamplerMapError> {
        let key = (stack_id as u32).to_ne_bytes();
        let Some(bytes) = self.stack_traces.lookup(&key)? else {
            return Ok(None);
        };
        if bytes.len() != STACK_BYTES {
            return Err(SamplerMapError::BadStackLength(bytes.len()));
        }

        let mut stack = [0u64; STACK_DEPTH];
        for (slot, chunk) in stack.iter_mut().zip(bytes.chunks_exact(8)) {
            *slot = u64::from_ne_bytes(chunk.try_into().expect("length checked"));
        }
        Ok(Some(stack))
    }

    /// Deletes every entry from both maps.
    pub fn clear(&self) -> Result<(), SamplerMapError> {
        clear_map(self.stack_traces)?;
        clear_map(self.counts)
    }
}

/// Get-next-key needs the previous key to advance, so a key can only be
/// deleted once the cursor has moved past it: deletion runs one step behind
/// iteration, and the final key is deleted after the loop ends.
fn clear_map(map: &dyn RawMap) -> Result<(), SamplerMapError> {
    let mut prev: Option<Vec<u8>> = None;
    loop {
        let next = map.next_key(prev.as_deref())?;
        if let Some(passed) = prev.take() {
            map.delete(&passed)?;
        }
        match next {
            Some(key) => prev = Some(key),
            None => return Ok(()),
        }
    }
}

pub struct CountsIter<'a> {
    map: &'a dyn RawMap,
    prev: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for CountsIter<'_> {
    type Item = Result<(CountKey, u64), SamplerMapError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let key = match self.map.next_key(self.prev.as_deref()) {
            Ok(Some(key)) => key,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let item = self.read_entry(&key);
        if item.is_err() {
            self.done = true;
        }
        self.prev = Some(key);
        Some(item)
    }
}

impl CountsIter<'_> {
    fn read_entry(&self, key: &[u8]) -> Result<(CountKey, u64), SamplerMapError> {
        let decoded = CountKey::from_bytes(key)?;
        let value = self
            .map
            .lookup(key)?
            .ok_or(SamplerMapError::VanishedValue)?;
        if value.len() != COUNT_VALUE_SIZE {
            return Err(SamplerMapError::BadValueLength(value.len()));
        }
        let count = u64::from_ne_bytes(value.as_slice().try_into().expect("length checked"));
        Ok((decoded, count))
    }
}

/// A loaded and attached instance of the in-kernel sampler: the BPF object,
/// one perf event per online CPU bound to the scope's cgroup, and handles to
/// the two maps. Dropping it detaches the program and closes every fd.
pub struct AttachedSampler {
    _object: libbpf_rs::Object,
    _links: Vec<Link>,
    _perf_fds: Vec<OwnedFd>,
    counts: BpfRawMap<MapHandle>,
    stack_traces: BpfRawMap<MapHandle>,
}

impl AttachedSampler {
    /// Loads the sampler object file and attaches its `do_sample` program to
    /// a freshly opened software CPU-clock perf event on every online CPU,
    /// scoped to `cgroup_path`. Any CPU failing to attach fails the scope.
    pub fn load(object_path: &Path, cgroup_path: &Path, sample_freq: u64) -> Result<Self> {
        let open_object = ObjectBuilder::default()
            .open_file(object_path)
            .with_context(|| format!("open sampler object {}", object_path.display()))?;
        let mut object = open_object.load().context("load sampler object")?;

        let cgroup = File::open(cgroup_path)
            .with_context(|| format!("open cgroup {}", cgroup_path.display()))?;

        let mut links = Vec::new();
        let mut perf_fds = Vec::new();
        {
            let mut program = object
                .progs_mut()
                .find(|program| program.name().to_string_lossy() == SAMPLER_PROGRAM_NAME)
                .ok_or_else(|| anyhow!("sampler program {} not found", SAMPLER_PROGRAM_NAME))?;

            for cpu in get_online_cpus()? {
                let perf_fd =
                    setup_cgroup_perf_event(cgroup.as_raw_fd(), cpu as i32, sample_freq)?;
                let link = program
                    .attach_perf_event(perf_fd.as_raw_fd())
                    .with_context(|| format!("attach sampler to perf event on cpu {}", cpu))?;
                links.push(link);
                perf_fds.push(perf_fd);
            }
        }
        debug!("sampler attached on {} cpus", perf_fds.len());

        let counts = map_handle(&object, COUNTS_MAP_NAME)?;
        let stack_traces = map_handle(&object, STACK_TRACES_MAP_NAME)?;

        Ok(Self {
            _object: object,
            _links: links,
            _perf_fds: perf_fds,
            counts: BpfRawMap::new(counts),
            stack_traces: BpfRawMap::new(stack_traces),
        })
    }

    pub fn maps(&self) -> SamplerMaps<'_> {
        SamplerMaps::new(&self.counts, &self.stack_traces)
    }
}

fn map_handle(object: &libbpf_rs::Object, name: &str) -> Result<MapHandle> {
    let map = object
        .maps()
        .find(|map| map.name().to_string_lossy() == name)
        .ok_or_else(|| anyhow!("sampler map {} not found", name))?;
    Ok(MapHandle::try_from(&map)?)
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::ops::Bound;

    /// In-memory stand-in for a BPF hash map, with the same get-next-key
    /// iteration contract.
    #[derive(Default)]
    pub(crate) struct FakeMap {
        pub(crate) entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
        /// When set, deletes beyond this many succeed no further.
        pub(crate) fail_deletes_after: Option<usize>,
        pub(crate) deletes: Mutex<usize>,
    }

    impl FakeMap {
        pub(crate) fn with_entries(
            entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
        ) -> Self {
            Self {
                entries: Mutex::new(entries.into_iter().collect()),
                fail_deletes_after: None,
                deletes: Mutex::new(0),
            }
        }

        pub(crate) fn len(&self) -> usize {
            self.entries.lock().len()
        }
    }

    impl RawMap for FakeMap {
        fn next_key(&self, prev: Option<&[u8]>) -> Result<Option<Vec<u8>>, SamplerMapError> {
            let entries = self.entries.lock();
            let next = match prev {
                None => entries.keys().next(),
                Some(prev) => entries
                    .range::<[u8], _>((Bound::Excluded(prev), Bound::Unbounded))
                    .map(|(k, _)| k)
                    .next(),
            };
            Ok(next.cloned())
        }

        fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SamplerMapError> {
            Ok(self.entries.lock().get(key).cloned())
        }

        fn delete(&self, key: &[u8]) -> Result<(), SamplerMapError> {
            let mut deletes = self.deletes.lock();
            if let Some(limit) = self.fail_deletes_after {
                if *deletes >= limit {
                    return Err(SamplerMapError::Map("simulated delete failure".into()));
                }
            }
            *deletes += 1;
            self.entries
                .lock()
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| SamplerMapError::Map("no such key".into()))
        }
    }

    pub(crate) fn stack_bytes(addrs: &[u64]) -> Vec<u8> {
        let mut stack = [0u64; STACK_DEPTH];
        stack[..addrs.len()].copy_from_slice(addrs);
        stack.iter().flat_map(|a| a.to_ne_bytes()).collect()
    }

    pub(crate) fn counts_entry(
        pid: u32,
        user_stack_id: i32,
        kernel_stack_id: i32,
        count: u64,
    ) -> (Vec<u8>, Vec<u8>) {
        let key = CountKey {
            pid,
            user_stack_id,
            kernel_stack_id,
        };
        (key.to_bytes().to_vec(), count.to_ne_bytes().to_vec())
    }

    pub(crate) fn stacks_entry(stack_id: i32, addrs: &[u64]) -> (Vec<u8>, Vec<u8>) {
        ((stack_id as u32).to_ne_bytes().to_vec(), stack_bytes(addrs))
    }
}

#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;

    #[test]
    fn count_key_round_trips_in_host_byte_order() {
        let key = CountKey {
            pid: 1234,
            user_stack_id: 7,
            kernel_stack_id: -1,
        };
        let bytes = key.to_bytes();
        assert_eq!(u32::from_ne_bytes(bytes[0..4].try_into().unwrap()), 1234);
        assert_eq!(CountKey::from_bytes(&bytes).unwrap(), key);

        assert!(matches!(
            CountKey::from_bytes(&bytes[..11]),
            Err(SamplerMapError::BadKeyLength(11))
        ));
    }

    #[test]
    fn counts_iteration_yields_every_entry() {
        let counts = FakeMap::with_entries([
            counts_entry(10, 1, -1, 3),
            counts_entry(11, 2, 4, 5),
            counts_entry(12, 3, -1, 8),
        ]);
        let stacks = FakeMap::default();
        let maps = SamplerMaps::new(&counts, &stacks);

        let drained: Vec<_> = maps.counts().map(|r| r.unwrap()).collect();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained.iter().map(|(_, c)| c).sum::<u64>(), 16);
        assert!(drained
            .iter()
            .any(|(k, c)| k.pid == 11 && k.kernel_stack_id == 4 && *c == 5));
    }

    #[test]
    fn stack_fetch_distinguishes_missing_from_present() {
        let counts = FakeMap::default();
        let stacks = FakeMap::with_entries([stacks_entry(42, &[0xa, 0xb, 0xc])]);
        let maps = SamplerMaps::new(&counts, &stacks);

        let stack = maps.stack_trace(42).unwrap().unwrap();
        assert_eq!(&stack[..4], &[0xa, 0xb, 0xc, 0x0]);
        assert!(maps.stack_trace(43).unwrap().is_none());
    }

    #[test]
    fn clear_empties_both_maps() {
        let counts = FakeMap::with_entries([
            counts_entry(1, 1, -1, 1),
            counts_entry(2, 2, -1, 1),
            counts_entry(3, 3, -1, 1),
        ]);
        let stacks = FakeMap::with_entries([
            stacks_entry(1, &[0x1]),
            stacks_entry(2, &[0x2]),
            stacks_entry(3, &[0x3]),
        ]);
        let maps = SamplerMaps::new(&counts, &stacks);

        maps.clear().unwrap();
        assert_eq!(counts.len(), 0);
        assert_eq!(stacks.len(), 0);
    }

    #[test]
    fn clear_on_empty_maps_is_a_noop() {
        let counts = FakeMap::default();
        let stacks = FakeMap::default();
        let maps = SamplerMaps::new(&counts, &stacks);

        maps.clear().unwrap();
        maps.clear().unwrap();
    }

    #[test]
    fn failed_delete_leaves_the_undeleted_tail() {
        let mut stacks = FakeMap::with_entries([
            stacks_entry(1, &[0x1]),
            stacks_entry(2, &[0x2]),
            stacks_entry(3, &[0x3]),
            stacks_entry(4, &[0x4]),
        ]);
        stacks.fail_deletes_after = Some(2);
        let counts = FakeMap::default();
        let maps = SamplerMaps::new(&counts, &stacks);

        assert!(maps.clear().is_err());
        // Two deletions went through, the rest of the keys survive.
        assert_eq!(stacks.len(), 2);
    }

    #[test]
    fn iteration_survives_deleting_one_step_behind() {
        // The protocol clear_map uses, spelled out against the fake.
        let map = FakeMap::with_entries([
            counts_entry(1, 1, -1, 1),
            counts_entry(2, 2, -1, 1),
            counts_entry(3, 3, -1, 1),
        ]);

        let mut visited = 0;
        let mut prev: Option<Vec<u8>> = None;
        loop {
            let next = map.next_key(prev.as_deref()).unwrap();
            if let Some(passed) = prev.take() {
                map.delete(&passed).unwrap();
            }
            match next {
                Some(key) => {
                    visited += 1;
                    prev = Some(key);
                }
                None => break,
            }
        }
        assert_eq!(visited, 3);
        assert_eq!(map.len(), 0);
    }
}
