use std::collections::BTreeMap;
use std::io::Write;
use std::ops::Bound;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use floodlight::ksym::KsymCache;
use floodlight::object_file::ObjectFileCache;
use floodlight::perf_map::PerfMapCache;
use floodlight::process::MappingCache;
use floodlight::profile::{MissingStackCounters, ProfileBuilder, KERNEL_MAPPING_FILE};
use floodlight::sampler::{CountKey, RawMap, SamplerMapError, SamplerMaps, STACK_DEPTH};
use floodlight_proto::profile::{decode_gzipped, encode_gzipped};

/// In-memory map with the sampler's get-next-key iteration contract.
#[derive(Default)]
struct MemoryMap(Mutex<BTreeMap<Vec<u8>, Vec<u8>>>);

impl MemoryMap {
    fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.0.lock().unwrap().insert(key, value);
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl RawMap for MemoryMap {
    fn next_key(&self, prev: Option<&[u8]>) -> Result<Option<Vec<u8>>, SamplerMapError> {
        let entries = self.0.lock().unwrap();
        let next = match prev {
            None => entries.keys().next(),
            Some(prev) => entries
                .range::<[u8], _>((Bound::Excluded(prev), Bound::Unbounded))
                .map(|(key, _)| key)
                .next(),
        };
        Ok(next.cloned())
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SamplerMapError> {
        Ok(self.0.lock().unwrap().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<(), SamplerMapError> {
        self.0
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| SamplerMapError::Map("no such key".into()))
    }
}

fn count_entry(pid: u32, user_stack_id: i32, kernel_stack_id: i32, count: u64) -> (Vec<u8>, Vec<u8>) {
    let key = CountKey {
        pid,
        user_stack_id,
        kernel_stack_id,
    };
    (key.to_bytes().to_vec(), count.to_ne_bytes().to_vec())
}

fn stack_entry(stack_id: i32, frames: &[u64]) -> (Vec<u8>, Vec<u8>) {
    let mut stack = [0u64; STACK_DEPTH];
    stack[..frames.len()].copy_from_slice(frames);
    (
        (stack_id as u32).to_ne_bytes().to_vec(),
        stack.iter().flat_map(|addr| addr.to_ne_bytes()).collect(),
    )
}

#[test]
fn drain_aggregate_encode_clear() {
    let mut kallsyms = tempfile::NamedTempFile::new().unwrap();
    kallsyms
        .write_all(b"ffffffff81000000 T do_syscall_64\n")
        .unwrap();
    kallsyms.flush().unwrap();
    let proc_dir = tempfile::tempdir().unwrap();
    let map_dir = tempfile::tempdir().unwrap();

    let ksym_cache = KsymCache::with_path(kallsyms.path().to_path_buf());
    let mapping_cache = MappingCache::with_proc_prefix(proc_dir.path().into());
    let object_cache = ObjectFileCache::new();
    let perf_map_cache = PerfMapCache::with_map_dir(map_dir.path().into());

    let counts = MemoryMap::default();
    let stacks = MemoryMap::default();
    // Two tuples sharing the user stack, one with a kernel half, one
    // pointing at an evicted stack.
    for (key, value) in [
        count_entry(100, 1, 10, 6),
        count_entry(100, 1, -1, 4),
        count_entry(200, 77, -1, 9),
    ] {
        counts.insert(key, value);
    }
    for (key, value) in [
        stack_entry(1, &[0x4000, 0x4100]),
        stack_entry(10, &[0xffffffff81000123]),
    ] {
        stacks.insert(key, value);
    }

    let maps = SamplerMaps::new(&counts, &stacks);
    let builder = ProfileBuilder {
        ksym_cache: &ksym_cache,
        mapping_cache: &mapping_cache,
        object_cache: &object_cache,
        perf_map_cache: &perf_map_cache,
    };
    let missing = MissingStackCounters::default();

    let cycle = builder
        .build(
            SystemTime::now(),
            Duration::from_secs(10),
            &maps,
            &missing,
        )
        .unwrap();
    let profile = cycle.profile;

    // Two live combined stacks, one dropped tuple, counts conserved.
    assert_eq!(profile.sample.len(), 2);
    let kept: i64 = profile.sample.iter().map(|s| s.value[0]).sum();
    assert_eq!(kept, 10);
    assert_eq!(missing.user_count(), 1);

    // The kernel frame was symbolized and the sentinel mapping comes last.
    let kernel_mapping = profile.mapping.last().unwrap();
    assert_eq!(
        profile.string_table[kernel_mapping.filename as usize],
        KERNEL_MAPPING_FILE
    );
    let names: Vec<&str> = profile
        .function
        .iter()
        .map(|f| profile.string_table[f.name as usize].as_str())
        .collect();
    assert_eq!(names, vec!["do_syscall_64"]);

    // The wire format round-trips byte for byte.
    let encoded = encode_gzipped(&profile).unwrap();
    let decoded = decode_gzipped(&encoded).unwrap();
    assert_eq!(decoded, profile);

    // Clearing leaves both maps empty; a second cycle sees nothing.
    maps.clear().unwrap();
    assert_eq!(counts.len(), 0);
    assert_eq!(stacks.len(), 0);

    let empty = builder
        .build(
            SystemTime::now(),
            Duration::from_secs(10),
            &maps,
            &missing,
        )
        .unwrap()
        .profile;
    assert!(empty.sample.is_empty());
    maps.clear().unwrap();
}
