//! Content addressing for deployable directory trees.
//!
//! Produces the checksum the remote platform uses to identify an asset:
//! a git tree hash computed over one directory, or over several directories
//! layered on top of each other without materializing the merge.
//!
//! # Pipeline
//!
//! 1. **Ignore**: [`IgnoreRuleSet`] drops paths by glob, matched against the
//!    whole relative path and against every single segment
//! 2. **Resolve**: [`Overlay`] lists the merged view of the roots, later
//!    roots shadowing earlier ones entry by entry
//! 3. **Hash**: files become blobs, directories become trees, folded in git
//!    tree order into one [`ContentHash`]

use std::io;
use std::path::{Path, PathBuf};

mod hasher;
mod ignore;
mod object;
mod order;
mod overlay;

pub use hasher::{hash_directory, hash_overlay};
pub use ignore::{IgnoreRuleSet, should_ignore};
pub use object::{
    BlobHasher, ContentHash, FileMode, TreeEntry, blob_hash, hash_file, sort_tree_entries,
    tree_hash,
};
pub use order::tree_name_cmp;
pub use overlay::{
    EntryKind, MergedEntry, MergedKind, Overlay, OverlayDir, PathEntry, VCS_DIR, list_dir,
    list_merged_entries,
};

/// Errors produced while hashing or resolving a tree.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("overlay needs at least one root")]
    NoRoots,

    #[error("invalid ignore pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("file name is not valid UTF-8: {}", .0.display())]
    NonUtf8Name(PathBuf),

    #[error("file changed while it was being read: {}", .0.display())]
    FileChanged(PathBuf),

    #[error("invalid content hash: {0}")]
    InvalidHash(String),
}

impl ContentError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> ContentError + '_ {
        move |source| ContentError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
