use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::object_file::MappedObjectFile;
use crate::store::DebugInfoStore;

/// Best-effort uploader for the debug information of object files observed
/// while profiling. Upload work runs concurrently with the next cycle;
/// failures are logged and implicitly retried when the binary shows up in a
/// later cycle. A process-wide in-flight set makes scopes that saw the same
/// binary coalesce into a single upload.
pub struct DebugInfoUploader {
    store: Arc<dyn DebugInfoStore>,
    temp_dir: PathBuf,
    in_flight: Mutex<HashSet<String>>,
}

impl DebugInfoUploader {
    pub fn new(store: Arc<dyn DebugInfoStore>, temp_dir: PathBuf) -> Self {
        Self {
            store,
            temp_dir,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn ensure_uploaded(&self, object_files: &[Arc<MappedObjectFile>]) {
        let mut seen_this_batch = HashSet::new();
        for object_file in object_files {
            let build_id = object_file.build_id().hex();
            if !seen_this_batch.insert(build_id.clone()) {
                continue;
            }

            if !self.in_flight.lock().insert(build_id.clone()) {
                // Another scope is already on it.
                continue;
            }
            let result = self.upload_one(&build_id, object_file);
            self.in_flight.lock().remove(&build_id);

            if let Err(e) = result {
                debug!(
                    "debug info upload for {} ({}) failed: {:?}",
                    build_id,
                    object_file.path().display(),
                    e
                );
            }
        }
    }

    fn upload_one(&self, build_id: &str, object_file: &MappedObjectFile) -> Result<()> {
        if self.store.exists(build_id)? {
            return Ok(());
        }
        let debug_info = self.extract(build_id, object_file)?;
        self.store.upload(build_id, debug_info)
    }

    /// Prefer stripping the debug sections out with objcopy, then a detached
    /// `<path>.debug` file, and as a last resort the binary itself, whose
    /// symbol table still beats raw addresses.
    fn extract(&self, build_id: &str, object_file: &MappedObjectFile) -> Result<Vec<u8>> {
        let path = object_file.path();

        if object_file.has_debug_info() {
            let stripped = self.temp_dir.join(format!("floodlight-dbg-{}", build_id));
            let result = Command::new("objcopy")
                .arg("--only-keep-debug")
                .arg(path)
                .arg(&stripped)
                .output();
            match result {
                Ok(output) if output.status.success() => {
                    let debug_info = fs::read(&stripped)?;
                    let _ = fs::remove_file(&stripped);
                    return Ok(debug_info);
                }
                Ok(output) => {
                    debug!(
                        "objcopy on {} exited with {}",
                        path.display(),
                        output.status
                    );
                }
                Err(e) => {
                    debug!("objcopy could not run: {:?}", e);
                }
            }
        }

        let mut detached = path.as_os_str().to_owned();
        detached.push(".debug");
        let detached = PathBuf::from(detached);
        if detached.is_file() {
            return Ok(fs::read(detached)?);
        }

        fs::read(path).map_err(|e| anyhow!("reading {} failed: {}", path.display(), e))
    }
}
