use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use memmap2::Mmap;
use object::elf::SHF_ALLOC;
use object::Object;
use object::ObjectSection;
use object::SectionFlags;

use crate::buildid::BuildId;

/// An allocated ELF section with file data, used to translate file offsets
/// back into the virtual addresses the symbolizer expects.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionRange {
    pub file_offset: u64,
    pub size: u64,
    pub virtual_address: u64,
}

/// The slice of an ELF file floodlight cares about: its build id, whether it
/// carries debug info, and the section layout needed for normalization. All
/// of it is derived eagerly so the backing file can be closed right away,
/// minimising open file descriptors and races with short-lived processes.
#[derive(Debug, Clone)]
pub struct ObjectFile {
    path: PathBuf,
    build_id: BuildId,
    sections: Vec<SectionRange>,
    has_debug_info: bool,
}

impl ObjectFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let object = object::File::parse(&*mmap)?;

        let build_id = match object.build_id()? {
            Some(data) => BuildId::gnu_from_bytes(data),
            None => {
                let text = object
                    .section_by_name(".text")
                    .ok_or_else(|| anyhow!("no build id and no .text in {}", path.display()))?;
                BuildId::sha1_of_text(text.data()?)
            }
        };

        let mut sections = Vec::new();
        for section in object.sections() {
            let SectionFlags::Elf { sh_flags } = section.flags() else {
                continue;
            };
            if sh_flags & u64::from(SHF_ALLOC) == 0 {
                continue;
            }
            // .bss and friends have no file data and can never contain a
            // sampled instruction's file offset.
            let Some((file_offset, size)) = section.file_range() else {
                continue;
            };
            if size == 0 {
                continue;
            }
            sections.push(SectionRange {
                file_offset,
                size,
                virtual_address: section.address(),
            });
        }
        sections.sort_by_key(|section| section.file_offset);

        let has_debug_info = object.section_by_name(".debug_info").is_some();

        Ok(ObjectFile {
            path: path.to_path_buf(),
            build_id,
            sections,
            has_debug_info,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    pub fn has_debug_info(&self) -> bool {
        self.has_debug_info
    }

    pub fn sections(&self) -> &[SectionRange] {
        &self.sections
    }

    /// For a file offset, return the virtual address it occupies inside the
    /// ELF, by way of the section that contains it. This undoes whatever
    /// placement the loader chose for the mapping.
    pub fn virtual_address_for_file_offset(&self, file_offset: u64) -> Option<u64> {
        let section = self
            .sections
            .iter()
            .find(|s| (s.file_offset..s.file_offset + s.size).contains(&file_offset))?;
        Some(file_offset - section.file_offset + section.virtual_address)
    }
}
