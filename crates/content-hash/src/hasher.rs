//! Tree hashing over the merged view.
//!
//! Every file is recorded as a regular `100644` blob, whatever its
//! permission bits on disk, so the checksum depends only on names and bytes.
//! Directories left with no files after ignore rules and symlink
//! exclusion are omitted, the same way git cannot represent them.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::object::{TreeEntry, tree_hash};
use crate::overlay::{MergedKind, Overlay, OverlayDir};
use crate::{ContentError, ContentHash, FileMode, IgnoreRuleSet, hash_file};

impl Overlay {
    /// Hash of the whole merged view.
    pub fn hash(&self) -> Result<ContentHash, ContentError> {
        let hash = self
            .hash_dir(&self.root_dir())?
            .unwrap_or(ContentHash::EMPTY_TREE);
        debug!(roots = self.roots().len(), %hash, "computed overlay hash");
        Ok(hash)
    }

    /// Hash of one merged directory, or `None` if it holds no files.
    pub fn hash_dir(&self, dir: &OverlayDir) -> Result<Option<ContentHash>, ContentError> {
        let mut entries = Vec::new();
        for entry in self.list(dir)? {
            match entry.kind {
                MergedKind::File { path, .. } => {
                    entries.push(TreeEntry::new(FileMode::Regular, entry.name, hash_file(&path)?));
                }
                MergedKind::Directory(child) => {
                    if let Some(hash) = self.hash_dir(&child)? {
                        entries.push(TreeEntry::new(FileMode::Directory, entry.name, hash));
                    }
                }
            }
        }

        if entries.is_empty() {
            return Ok(None);
        }
        // `list` already yields git tree order, and dropping entries keeps it.
        Ok(Some(tree_hash(&entries)))
    }
}

/// Hash of the directory at `relative_path` below `root` (`""` for `root` itself).
///
/// `relative_path` is also the prefix ignore rules see, so a rule like
/// `web/dist` applies when hashing `web` from the project root.
pub fn hash_directory(
    root: &Path,
    relative_path: &str,
    ignore: &IgnoreRuleSet,
) -> Result<ContentHash, ContentError> {
    let overlay = Overlay::new(vec![root.to_path_buf()], ignore.clone())?;
    let dir = overlay
        .dir_at(relative_path)?
        .ok_or_else(|| ContentError::NotADirectory(root.join(relative_path)))?;
    Ok(overlay.hash_dir(&dir)?.unwrap_or(ContentHash::EMPTY_TREE))
}

/// Hash of `roots` layered in order, later roots overriding earlier ones.
pub fn hash_overlay(roots: &[PathBuf], ignore: &IgnoreRuleSet) -> Result<ContentHash, ContentError> {
    Overlay::new(roots.to_vec(), ignore.clone())?.hash()
}
