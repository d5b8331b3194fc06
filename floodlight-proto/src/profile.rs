#[allow(clippy::all)]
pub mod pprof {
    include!(concat!(env!("OUT_DIR"), "/perftools.profiles.rs"));
}

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Read;
use std::io::Write;

use anyhow::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

/// The pprof string table. Strings are interned and referenced by index;
/// index 0 must be the empty string.
pub struct StringTable {
    known: HashMap<String, i64>,
    table: Vec<String>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    pub fn new() -> Self {
        let mut known = HashMap::new();
        known.insert("".to_string(), 0);
        Self {
            known,
            table: vec!["".to_string()],
        }
    }

    pub fn get_or_insert(&mut self, string: &str) -> i64 {
        match self.known.entry(string.to_string()) {
            Entry::Occupied(o) => *o.get(),
            Entry::Vacant(v) => {
                let id = self.table.len() as i64;
                v.insert(id);
                self.table.push(string.to_string());
                id
            }
        }
    }

    pub fn lookup(&self, string: &str) -> Option<i64> {
        self.known.get(string).copied()
    }

    pub fn finish(self) -> Vec<String> {
        self.table
    }
}

/// Serializes and gzip-compresses a profile, the framing every pprof
/// consumer expects.
pub fn encode_gzipped(profile: &pprof::Profile) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&profile.encode_to_vec())?;
    Ok(encoder.finish()?)
}

pub fn decode_gzipped(bytes: &[u8]) -> Result<pprof::Profile> {
    let mut decoder = GzDecoder::new(bytes);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded)?;
    Ok(pprof::Profile::decode(decoded.as_slice())?)
}
