use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::debug;

use floodlight_proto::profile::{pprof, StringTable};

use crate::ksym::KsymCache;
use crate::object_file::{MappedObjectFile, ObjectFileCache};
use crate::perf_map::PerfMapCache;
use crate::process::{CycleMappings, MappingCache, Pid};
use crate::sampler::{SamplerMaps, DOUBLE_STACK_DEPTH, STACK_DEPTH};

/// Sentinel mapping file name for kernel frames, matching what perf and
/// friends emit.
pub const KERNEL_MAPPING_FILE: &str = "[kernel.kallsyms]";

/// We sample at 100Hz, which is every 10 million nanoseconds.
pub const SAMPLE_PERIOD_NANOS: i64 = 10_000_000;

const NOT_FOUND_FUNCTION_NAME: &str = "not found";

/// Tuples dropped because the sampler evicted their stack from the side map
/// before we could read it.
#[derive(Debug, Default)]
pub struct MissingStackCounters {
    pub user: AtomicU64,
    pub kernel: AtomicU64,
}

impl MissingStackCounters {
    pub fn user_count(&self) -> u64 {
        self.user.load(Ordering::Relaxed)
    }

    pub fn kernel_count(&self) -> u64 {
        self.kernel.load(Ordering::Relaxed)
    }
}

/// Everything one drain cycle produced: the finished profile plus the object
/// files whose debug info should be uploaded.
pub struct CycleProfile {
    pub profile: pprof::Profile,
    pub object_files: Vec<Arc<MappedObjectFile>>,
}

/// Where a cycle-local location points to.
enum MappingRef {
    /// Index into the user mapping drafts.
    User(usize),
    Kernel,
    Unset,
}

enum FunctionRef {
    /// Keyed by kernel address, named after symbolization.
    Kernel(u64),
    /// Index into the user (JIT) function list.
    User(usize),
}

struct LocationDraft {
    address: u64,
    mapping: MappingRef,
    function: Option<FunctionRef>,
}

struct MappingDraft {
    start_addr: u64,
    end_addr: u64,
    offset: u64,
    path: PathBuf,
    build_id: String,
}

struct SampleDraft {
    count: u64,
    location_indices: Vec<usize>,
}

/// Turns one drained batch of `(pid, user sid, kernel sid) -> count` tuples
/// into a pprof profile: stacks are fetched and combined, addresses
/// normalized against the backing ELF files, kernel addresses symbolized,
/// and locations, functions and mappings interned into flat, cycle-local
/// arrays referenced by integer id.
pub struct ProfileBuilder<'a> {
    pub ksym_cache: &'a KsymCache,
    pub mapping_cache: &'a MappingCache,
    pub object_cache: &'a ObjectFileCache,
    pub perf_map_cache: &'a PerfMapCache,
}

struct CycleState<'a> {
    mappings: CycleMappings<'a>,
    object_cache: &'a ObjectFileCache,

    locations: Vec<LocationDraft>,
    /// `(pid, addr)` for user frames, `(0, addr)` for kernel frames. Pid 0
    /// is reserved by the sampler, so the keys never collide.
    location_index: HashMap<(u64, u64), usize>,
    /// Indices of kernel locations, in interning order.
    kernel_locations: Vec<usize>,
    kernel_addresses: HashSet<u64>,

    mapping_drafts: Vec<MappingDraft>,
    mapping_index: HashMap<(Pid, PathBuf), usize>,

    user_functions: Vec<String>,
    user_function_index: HashMap<(u64, u64), usize>,

    samples: HashMap<[u64; DOUBLE_STACK_DEPTH], SampleDraft>,
}

impl<'a> CycleState<'a> {
    fn new(mapping_cache: &'a MappingCache, object_cache: &'a ObjectFileCache) -> Self {
        Self {
            mappings: CycleMappings::new(mapping_cache),
            object_cache,
            locations: Vec::new(),
            location_index: HashMap::new(),
            kernel_locations: Vec::new(),
            kernel_addresses: HashSet::new(),
            mapping_drafts: Vec::new(),
            mapping_index: HashMap::new(),
            user_functions: Vec::new(),
            user_function_index: HashMap::new(),
            samples: HashMap::new(),
        }
    }

    fn intern_kernel_location(&mut self, addr: u64) -> usize {
        let key = (0, addr);
        if let Some(&index) = self.location_index.get(&key) {
            return index;
        }

        let index = self.locations.len();
        self.locations.push(LocationDraft {
            address: addr,
            mapping: MappingRef::Kernel,
            function: None,
        });
        self.kernel_locations.push(index);
        self.kernel_addresses.insert(addr);
        self.location_index.insert(key, index);
        index
    }

    /// Resolve a runtime user address to its file-relative form and the
    /// mapping it belongs to. Any failure along the way means the profile
    /// keeps the raw address with no mapping attached.
    fn normalize_user_address(&mut self, pid: Pid, addr: u64) -> Option<(u64, usize)> {
        let mapping = self.mappings.mapping_for(pid, addr)?;

        let object = match self.object_cache.object_for(pid, &mapping) {
            Ok(object) => object,
            Err(e) => {
                debug!("failed to open object file: {:?}", e);
                return None;
            }
        };

        let normalized = match object.normalize(addr, &mapping) {
            Ok(normalized) => normalized,
            Err(e) => {
                debug!("failed to normalize address: {:?}", e);
                return None;
            }
        };

        let key = (pid, mapping.path.clone());
        let mapping_index = match self.mapping_index.get(&key) {
            Some(&index) => index,
            None => {
                let index = self.mapping_drafts.len();
                self.mapping_drafts.push(MappingDraft {
                    start_addr: mapping.start_addr,
                    end_addr: mapping.end_addr,
                    offset: mapping.offset,
                    path: mapping.path.clone(),
                    build_id: object.build_id().hex(),
                });
                self.mapping_index.insert(key, index);
                index
            }
        };

        Some((normalized, mapping_index))
    }

    fn intern_user_location(&mut self, pid: Pid, addr: u64, perf_map: Option<&crate::perf_map::PerfMap>) -> usize {
        let key = (u64::from(pid), addr);
        if let Some(&index) = self.location_index.get(&key) {
            return index;
        }

        let (address, mapping) = match self.normalize_user_address(pid, addr) {
            Some((normalized, mapping_index)) => (normalized, MappingRef::User(mapping_index)),
            None => (addr, MappingRef::Unset),
        };

        // JIT frames live in anonymous mappings, so their names can only
        // come from the runtime's perf map, looked up by runtime address.
        let function = perf_map.and_then(|perf_map| {
            if let Some(&function_index) = self.user_function_index.get(&key) {
                return Some(FunctionRef::User(function_index));
            }
            let name = perf_map.lookup(addr)?;
            let function_index = self.user_functions.len();
            self.user_functions.push(name.to_string());
            self.user_function_index.insert(key, function_index);
            Some(FunctionRef::User(function_index))
        });

        let index = self.locations.len();
        self.locations.push(LocationDraft {
            address,
            mapping,
            function,
        });
        self.location_index.insert(key, index);
        index
    }
}

impl ProfileBuilder<'_> {
    pub fn build(
        &self,
        capture_time: SystemTime,
        cycle_duration: Duration,
        maps: &SamplerMaps<'_>,
        missing_stacks: &MissingStackCounters,
    ) -> Result<CycleProfile> {
        let mut cycle = CycleState::new(self.mapping_cache, self.object_cache);

        for entry in maps.counts() {
            let (key, count) = entry.context("drain counts")?;

            let Some(user_stack) = maps.stack_trace(key.user_stack_id)? else {
                missing_stacks.user.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            // Twice the stack depth because we have a user and a potential
            // kernel stack.
            let mut combined = [0u64; DOUBLE_STACK_DEPTH];
            combined[..STACK_DEPTH].copy_from_slice(&user_stack);

            if key.kernel_stack_id >= 0 {
                let Some(kernel_stack) = maps.stack_trace(key.kernel_stack_id)? else {
                    missing_stacks.kernel.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                combined[STACK_DEPTH..].copy_from_slice(&kernel_stack);
            }

            // Identical combined stacks collapse into one sample.
            if let Some(sample) = cycle.samples.get_mut(&combined) {
                sample.count += count;
                continue;
            }

            let mut location_indices = Vec::new();

            for &addr in &combined[STACK_DEPTH..] {
                if addr == 0 {
                    continue;
                }
                location_indices.push(cycle.intern_kernel_location(addr));
            }

            let perf_map = self.perf_map_cache.perf_map_for(key.pid);
            for &addr in &combined[..STACK_DEPTH] {
                if addr == 0 {
                    continue;
                }
                location_indices.push(cycle.intern_user_location(
                    key.pid,
                    addr,
                    perf_map.as_deref(),
                ));
            }

            cycle.samples.insert(
                combined,
                SampleDraft {
                    count,
                    location_indices,
                },
            );
        }

        // Object files seen this cycle; their debug info gets uploaded
        // concurrently with the next cycle.
        let mut object_files = Vec::new();
        for (pid, mapping) in cycle.mappings.all_mappings() {
            match self.object_cache.object_for(*pid, mapping) {
                Ok(object) => object_files.push(object),
                Err(_) => continue,
            }
        }

        // Resolve kernel function names in one batch.
        let kernel_symbols = if cycle.kernel_addresses.is_empty() {
            HashMap::new()
        } else {
            self.ksym_cache
                .resolve(&cycle.kernel_addresses)
                .context("resolve kernel symbols")?
        };

        let mut kernel_function_ids: HashMap<u64, u64> = HashMap::new();
        let mut strings = StringTable::new();
        let mut functions = Vec::new();

        for &location_index in &cycle.kernel_locations {
            let addr = cycle.locations[location_index].address;
            if !kernel_function_ids.contains_key(&addr) {
                let mut name = kernel_symbols.get(&addr).cloned().unwrap_or_default();
                if name.is_empty() {
                    name = NOT_FOUND_FUNCTION_NAME.to_string();
                }
                let id = functions.len() as u64 + 1;
                functions.push(pprof::Function {
                    id,
                    name: strings.get_or_insert(&name),
                    ..Default::default()
                });
                kernel_function_ids.insert(addr, id);
            }
            cycle.locations[location_index].function = Some(FunctionRef::Kernel(addr));
        }

        // User (JIT) functions come after the kernel ones.
        let user_function_id_base = functions.len() as u64;
        for name in &cycle.user_functions {
            let id = functions.len() as u64 + 1;
            functions.push(pprof::Function {
                id,
                name: strings.get_or_insert(name),
                ..Default::default()
            });
        }

        let mut mappings = Vec::new();
        for draft in &cycle.mapping_drafts {
            let id = mappings.len() as u64 + 1;
            mappings.push(pprof::Mapping {
                id,
                memory_start: draft.start_addr,
                memory_limit: draft.end_addr,
                file_offset: draft.offset,
                filename: strings.get_or_insert(&draft.path.to_string_lossy()),
                build_id: strings.get_or_insert(&draft.build_id),
                ..Default::default()
            });
        }
        // The kernel mapping sentinel always goes last.
        let kernel_mapping_id = mappings.len() as u64 + 1;
        mappings.push(pprof::Mapping {
            id: kernel_mapping_id,
            filename: strings.get_or_insert(KERNEL_MAPPING_FILE),
            ..Default::default()
        });

        let mut locations = Vec::with_capacity(cycle.locations.len());
        for (index, draft) in cycle.locations.iter().enumerate() {
            let mapping_id = match draft.mapping {
                MappingRef::User(mapping_index) => mapping_index as u64 + 1,
                MappingRef::Kernel => kernel_mapping_id,
                MappingRef::Unset => 0,
            };
            let line = match &draft.function {
                Some(FunctionRef::Kernel(addr)) => vec![pprof::Line {
                    function_id: kernel_function_ids[addr],
                    ..Default::default()
                }],
                Some(FunctionRef::User(function_index)) => vec![pprof::Line {
                    function_id: user_function_id_base + *function_index as u64 + 1,
                    ..Default::default()
                }],
                None => vec![],
            };
            locations.push(pprof::Location {
                id: index as u64 + 1,
                mapping_id,
                address: draft.address,
                line,
                ..Default::default()
            });
        }

        let samples = cycle
            .samples
            .into_values()
            .map(|draft| pprof::Sample {
                location_id: draft
                    .location_indices
                    .iter()
                    .map(|&index| index as u64 + 1)
                    .collect(),
                value: vec![draft.count as i64],
                label: vec![],
            })
            .collect();

        let profile = pprof::Profile {
            sample_type: vec![pprof::ValueType {
                r#type: strings.get_or_insert("samples"),
                unit: strings.get_or_insert("count"),
            }],
            period_type: Some(pprof::ValueType {
                r#type: strings.get_or_insert("cpu"),
                unit: strings.get_or_insert("nanoseconds"),
            }),
            period: SAMPLE_PERIOD_NANOS,
            time_nanos: capture_time
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as i64,
            duration_nanos: cycle_duration.as_nanos() as i64,
            sample: samples,
            mapping: mappings,
            location: locations,
            function: functions,
            string_table: strings.finish(),
            ..Default::default()
        };

        Ok(CycleProfile {
            profile,
            object_files,
        })
    }
}
