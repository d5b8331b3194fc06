mod buildid;
mod notes;
mod object_file;

pub use buildid::{BuildId, BuildIdError, BuildIdFlavour};
pub use notes::{kernel_build_id, parse_gnu_build_id_from_notes};
pub use object_file::{ObjectFile, SectionRange};
