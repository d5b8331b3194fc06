pub mod debug_info;
pub mod ksym;
pub mod object_file;
pub mod perf_events;
pub mod perf_map;
pub mod process;
pub mod profile;
pub mod sampler;
pub mod scope;
pub mod store;
pub mod target;
pub mod util;

use std::sync::Arc;

use crate::ksym::KsymCache;
use crate::object_file::ObjectFileCache;
use crate::perf_map::PerfMapCache;
use crate::process::MappingCache;

/// The process-wide caches shared by every scope profiler: kernel symbols,
/// process memory maps, parsed object files and JIT perf maps. Passed
/// around explicitly, no hidden singletons.
#[derive(Clone)]
pub struct Caches {
    pub ksym: Arc<KsymCache>,
    pub mappings: Arc<MappingCache>,
    pub objects: Arc<ObjectFileCache>,
    pub perf_maps: Arc<PerfMapCache>,
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

impl Caches {
    pub fn new() -> Self {
        Self {
            ksym: Arc::new(KsymCache::new()),
            mappings: Arc::new(MappingCache::new()),
            objects: Arc::new(ObjectFileCache::new()),
            perf_maps: Arc::new(PerfMapCache::new()),
        }
    }
}
