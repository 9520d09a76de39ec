mod collection_kind;
mod imported_file;
mod tracked_record;

pub use collection_kind::CollectionKind;
pub use imported_file::ImportedFileRecord;
pub use tracked_record::{as_flag, TrackedRecord};
