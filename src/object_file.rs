use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use tracing::debug;

use floodlight_object::{BuildId, ObjectFile};

use crate::process::{ExecutableMapping, Pid};

/// A parsed object file together with the address arithmetic for mappings
/// backed by it.
pub struct MappedObjectFile {
    object: ObjectFile,
}

impl MappedObjectFile {
    pub fn build_id(&self) -> &BuildId {
        self.object.build_id()
    }

    pub fn path(&self) -> &Path {
        self.object.path()
    }

    pub fn has_debug_info(&self) -> bool {
        self.object.has_debug_info()
    }

    /// Translate a sampled runtime address into the virtual address the same
    /// instruction has inside the on-disk ELF, undoing the loader's
    /// placement. The mapping tells us where the file got placed, the
    /// section headers tell us where the file wants to be.
    pub fn normalize(&self, runtime_addr: u64, mapping: &ExecutableMapping) -> Result<u64> {
        let file_offset = runtime_addr
            .checked_sub(mapping.start_addr)
            .ok_or_else(|| anyhow!("address {:#x} below mapping start", runtime_addr))?
            + mapping.offset;

        self.object
            .virtual_address_for_file_offset(file_offset)
            .ok_or_else(|| {
                anyhow!(
                    "no section covers file offset {:#x} in {}",
                    file_offset,
                    self.path().display()
                )
            })
    }
}

/// Device and inode, which identify the backing file across processes even
/// when they see it under different paths.
type ObjectKey = ((i32, i32), u64);

/// Process-wide cache of parsed object files. Processes that map the same
/// binary share a single handle.
pub struct ObjectFileCache {
    inner: RwLock<HashMap<ObjectKey, Arc<MappedObjectFile>>>,
}

impl Default for ObjectFileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectFileCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// The object file backing `mapping` in process `pid`. The file is
    /// opened through `/proc/[pid]/root` first so binaries living in other
    /// mount namespaces resolve, falling back to the path as the agent
    /// sees it.
    pub fn object_for(
        &self,
        pid: Pid,
        mapping: &ExecutableMapping,
    ) -> Result<Arc<MappedObjectFile>> {
        let key = (mapping.dev, mapping.inode);
        if let Some(hit) = self.inner.read().get(&key) {
            return Ok(Arc::clone(hit));
        }

        let namespaced = mapping.namespaced_path(pid);
        let object = ObjectFile::open(&namespaced).or_else(|e| {
            debug!(
                "opening {} failed ({:?}), trying {}",
                namespaced.display(),
                e,
                mapping.path.display()
            );
            ObjectFile::open(&mapping.path)
        })?;

        let handle = Arc::new(MappedObjectFile { object });
        let mut inner = self.inner.write();
        Ok(Arc::clone(inner.entry(key).or_insert(handle)))
    }
}
