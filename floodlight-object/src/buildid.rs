use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;

use data_encoding::HEXLOWER;
use ring::digest;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildIdError {
    #[error("no GNU build id note found")]
    NotFound,
    #[error("malformed notes section: {0}")]
    MalformedNotes(String),
}

/// How a build id was derived.
///
/// Executables linked without `--build-id` (Rust, some compilers and Linux
/// distributions) carry no GNU note, so we fall back to hashing the bytes of
/// the `.text` section, which is stable as long as the executable code is.
#[derive(Hash, Eq, PartialEq, Clone)]
pub enum BuildIdFlavour {
    Gnu,
    TextSha1,
}

#[derive(Hash, Eq, PartialEq, Clone)]
pub struct BuildId {
    pub flavour: BuildIdFlavour,
    data: Vec<u8>,
}

impl BuildId {
    pub fn gnu_from_bytes(bytes: &[u8]) -> Self {
        BuildId {
            flavour: BuildIdFlavour::Gnu,
            data: bytes.to_vec(),
        }
    }

    /// Hashes the contents of the `.text` section with SHA-1.
    pub fn sha1_of_text(text: &[u8]) -> Self {
        let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, text);
        BuildId {
            flavour: BuildIdFlavour::TextSha1,
            data: digest.as_ref().to_vec(),
        }
    }

    /// The canonical rendering used everywhere a build id travels: lowercase
    /// hex of the raw bytes, with no flavour prefix.
    pub fn hex(&self) -> String {
        HEXLOWER.encode(&self.data)
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl Debug for BuildId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let flavour = match self.flavour {
            BuildIdFlavour::Gnu => "gnu",
            BuildIdFlavour::TextSha1 => "text-sha1",
        };
        write!(f, "BuildId({}-{})", flavour, self.hex())
    }
}
