use std::collections::{HashMap, HashSet};
use std::fs;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::debug;

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

#[derive(Debug, PartialEq, Clone)]
pub struct Ksym {
    pub start_addr: u64,
    pub symbol_name: String,
}

pub struct KsymIter<R> {
    file: BufReader<R>,
    line: String,
}

impl<R: Read> KsymIter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            file: BufReader::new(reader),
            line: String::new(),
        }
    }
}

impl<R: Read> Iterator for KsymIter<R> {
    type Item = Ksym;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let buffer = &mut self.line;
            buffer.clear();
            match self.file.read_line(buffer) {
                Ok(0) => {
                    return None;
                }
                Ok(_) => {
                    let mut iter = buffer.split_whitespace();
                    if let (Some(addr_str), Some(symbol_type), Some(symbol_name)) =
                        (iter.next(), iter.next(), iter.next())
                    {
                        // See `man nm` for the meaning of the symbol types.
                        if symbol_type == "T"
                            || symbol_type == "t"
                            || symbol_type == "W"
                            || symbol_type == "D"
                        {
                            if let Ok(start_addr) = u64::from_str_radix(addr_str, 16) {
                                return Some(Ksym {
                                    start_addr,
                                    symbol_name: symbol_name.to_string(),
                                });
                            }
                        }
                    }
                }
                Err(_) => {
                    return None;
                }
            }
        }
    }
}

#[derive(Default)]
struct CachedSymbols {
    mtime: Option<SystemTime>,
    /// Sorted by start address.
    symbols: Vec<Ksym>,
}

impl CachedSymbols {
    /// The name of the greatest symbol at or below `addr`.
    fn resolve_one(&self, addr: u64) -> Option<&str> {
        let idx = self.symbols.partition_point(|k| k.start_addr <= addr);
        if idx == 0 {
            return None;
        }
        Some(&self.symbols[idx - 1].symbol_name)
    }
}

/// Resolves kernel instruction addresses to function names. kallsyms is
/// reparsed whenever its mtime changes, which happens when modules get
/// loaded or unloaded. Readers proceed in parallel, reparsing is exclusive.
///
/// Reading requires CAP_SYSLOG or root, otherwise every address in the file
/// is zeroed out and nothing will resolve.
pub struct KsymCache {
    path: PathBuf,
    inner: RwLock<CachedSymbols>,
}

impl Default for KsymCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KsymCache {
    pub fn new() -> Self {
        Self::with_path(KALLSYMS_PATH.into())
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            inner: RwLock::new(CachedSymbols::default()),
        }
    }

    /// Resolve a batch of kernel addresses. Addresses that fall below the
    /// first symbol map to an empty string.
    pub fn resolve(&self, addrs: &HashSet<u64>) -> Result<HashMap<u64, String>> {
        let mtime = fs::metadata(&self.path)?.modified()?;

        if self.inner.read().mtime != Some(mtime) {
            let mut inner = self.inner.write();
            // Whoever held the write lock before us may have already reparsed.
            if inner.mtime != Some(mtime) {
                debug!("reparsing kernel symbols from {}", self.path.display());
                let file = File::open(&self.path)?;
                let mut symbols: Vec<Ksym> = KsymIter::new(file).collect();
                symbols.sort_by_key(|k| k.start_addr);
                inner.symbols = symbols;
                inner.mtime = Some(mtime);
            }
        }

        let inner = self.inner.read();
        let mut resolved = HashMap::with_capacity(addrs.len());
        for &addr in addrs {
            resolved.insert(addr, inner.resolve_one(addr).unwrap_or_default().to_string());
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;

    const FIXTURE: &str = "0000000000000000 A fixed_percpu_data
ffffffffa2000000 T startup_64
ffffffffa2000070 T secondary_startup_64
ffffffffa2000270 T __pfx_sev_verify_cbit
ffffffffa2000280 T sev_verify_cbit
ffffffffa20002ed W vc_boot_ghcb
ffffffffa2000f00 D _etext
";

    #[test]
    fn parsing_works() {
        let mut iter = KsymIter::new(Cursor::new(FIXTURE.as_bytes()));
        assert_eq!(
            Ksym {
                start_addr: 0xffffffffa2000000,
                symbol_name: "startup_64".to_string()
            },
            iter.next().unwrap()
        );
        // The `A` typed symbol is skipped, the `W` and `D` ones are kept.
        assert_eq!(iter.count(), 5);
    }

    fn write_kallsyms(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn resolves_to_greatest_symbol_at_or_below() {
        let file = write_kallsyms(FIXTURE);
        let cache = KsymCache::with_path(file.path().to_path_buf());

        let addrs: HashSet<u64> = [
            0xffffffffa2000000, // exact hit
            0xffffffffa2000275, // between two symbols
            0x1,                // below every symbol
        ]
        .into();
        let resolved = cache.resolve(&addrs).unwrap();

        assert_eq!(resolved[&0xffffffffa2000000], "startup_64");
        assert_eq!(resolved[&0xffffffffa2000275], "__pfx_sev_verify_cbit");
        assert_eq!(resolved[&0x1], "");
    }

    #[test]
    fn resolution_is_idempotent_while_file_unchanged() {
        let file = write_kallsyms(FIXTURE);
        let cache = KsymCache::with_path(file.path().to_path_buf());

        let addrs: HashSet<u64> = [0xffffffffa2000071].into();
        let first = cache.resolve(&addrs).unwrap();
        let second = cache.resolve(&addrs).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn mtime_change_invalidates() {
        let mut file = write_kallsyms(FIXTURE);
        let cache = KsymCache::with_path(file.path().to_path_buf());

        let addrs: HashSet<u64> = [0xffffffffb0000010].into();
        assert_eq!(cache.resolve(&addrs).unwrap()[&0xffffffffb0000010], "_etext");

        // Give coarse filesystem timestamps a chance to tick over.
        std::thread::sleep(std::time::Duration::from_millis(20));
        file.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        file.as_file_mut().rewind().unwrap();
        file.write_all(b"ffffffffb0000000 T brand_new_symbol\n").unwrap();
        file.flush().unwrap();

        assert_eq!(
            cache.resolve(&addrs).unwrap()[&0xffffffffb0000010],
            "brand_new_symbol"
        );
    }
}
