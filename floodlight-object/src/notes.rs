use std::fs::File;
use std::io::BufReader;
use std::io::Read;

use object::elf::{FileHeader32, ELF_NOTE_GNU, NT_GNU_BUILD_ID};
use object::read::elf::NoteIterator;
use object::Endianness;

use crate::buildid::{BuildId, BuildIdError};

const KERNEL_NOTES_PATH: &str = "/sys/kernel/notes";

fn host_endianness() -> Endianness {
    if cfg!(target_endian = "little") {
        Endianness::Little
    } else {
        Endianness::Big
    }
}

/// Parse the GNU build id out of a raw ELF notes section. The kernel exposes
/// its notes with 4-byte alignment in host endianness.
pub fn parse_gnu_build_id_from_notes(data: &[u8]) -> Result<BuildId, BuildIdError> {
    let endian = host_endianness();
    let notes: NoteIterator<'_, FileHeader32<Endianness>> = NoteIterator::new(endian, 4, data)
        .map_err(|e| BuildIdError::MalformedNotes(e.to_string()))?;

    for note in notes {
        let Ok(note) = note else {
            continue;
        };

        if note.name() != ELF_NOTE_GNU || note.n_type(endian) != NT_GNU_BUILD_ID {
            continue;
        }

        return Ok(BuildId::gnu_from_bytes(note.desc()));
    }

    Err(BuildIdError::NotFound)
}

/// Read and parse the build id of the running kernel image.
/// This can also be done using `perf` with `perf buildid-list --kernel`.
pub fn kernel_build_id() -> Result<BuildId, anyhow::Error> {
    let mut file = BufReader::new(File::open(KERNEL_NOTES_PATH)?);
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    Ok(parse_gnu_build_id_from_notes(&data)?)
}
