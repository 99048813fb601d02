//! Archive extraction and binary-diff patching for the game install
//! pipeline
//!
//! This crate covers everything between a verified download and a playable
//! file tree:
//!
//! - [`CombinedStream`] / [`FileSliceStream`] — seekable views over
//!   multi-volume archives and packed diff blobs
//! - [`extract_package`] — zip / 7z extraction with compressed-byte
//!   progress and zip-slip protection
//! - delete-list and hdiff-list application with an external merge tool
//!   driven through [`HpatchTool`]
//!
//! The merge path deliberately never patches a file in place: diffs are
//! merged into a temp file that replaces the target by rename only after
//! the tool succeeds.

#![warn(missing_docs)]

mod archive;
mod error;
mod hdiff;
mod slice;

pub use archive::{detect_kind, extract_package, ArchiveKind};
pub use error::{Error, Result};
pub use hdiff::{
    apply_delete_list, apply_hdiff_entry, clear_hdiff_list, read_delete_list, read_hdiff_list,
    HdiffEntry, HpatchTool, DELETE_LIST_NAME, HDIFF_LIST_NAME,
};
pub use slice::{CombinedStream, FileSliceStream};
