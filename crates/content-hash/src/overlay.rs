use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::order::tree_name_cmp;
use crate::{ContentError, FileMode, IgnoreRuleSet};

/// Version-control metadata directory, never part of a tree.
pub const VCS_DIR: &str = ".git";

/// Kind of a directory entry. Symlinks and special files never get one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
}

/// A single real entry of one on-disk directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: FileMode,
}

/// Lists the files and directories directly inside `dir`.
///
/// Symlinks are skipped without being followed, as are sockets, fifos and
/// device nodes. The result is unsorted.
pub fn list_dir(dir: &Path) -> Result<Vec<PathEntry>, ContentError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(ContentError::io(dir))? {
        let entry = entry.map_err(ContentError::io(dir))?;
        let path = entry.path();
        // file_type() does not follow symlinks.
        let file_type = entry.file_type().map_err(ContentError::io(&path))?;
        if file_type.is_symlink() {
            trace!(path = %path.display(), "skipping symlink");
            continue;
        }

        let (kind, mode) = if file_type.is_dir() {
            (EntryKind::Directory, FileMode::Directory)
        } else if file_type.is_file() {
            let metadata = entry.metadata().map_err(ContentError::io(&path))?;
            (EntryKind::File, file_mode(&metadata))
        } else {
            continue;
        };

        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| ContentError::NonUtf8Name(path.clone()))?;
        entries.push(PathEntry { name, kind, mode });
    }
    Ok(entries)
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> FileMode {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        FileMode::Executable
    } else {
        FileMode::Regular
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> FileMode {
    FileMode::Regular
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

/// A directory of the merged view.
///
/// Besides its path it remembers which roots have a real directory at that
/// path. Children are only ever looked up in those roots, so a symlinked
/// directory in one root can never smuggle in content from elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDir {
    relative_path: String,
    roots: Vec<usize>,
}

impl OverlayDir {
    /// Forward-slash path relative to the overlay root; empty for the root itself.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Indices of the roots contributing to this directory, in layer order.
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergedKind {
    File { path: PathBuf, mode: FileMode },
    Directory(OverlayDir),
}

/// An entry of the merged view, resolved to the root that wins it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntry {
    pub name: String,
    pub relative_path: String,
    /// Index of the winning root.
    pub root: usize,
    pub kind: MergedKind,
}

impl MergedEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, MergedKind::Directory(_))
    }
}

/// An ordered stack of directories viewed as one tree.
///
/// For every relative path the last root that has an entry of that name
/// wins, whatever its kind. Directories are not merged wholesale: the
/// contents of a directory are resolved again, name by name, across all
/// roots where that directory exists.
#[derive(Debug, Clone)]
pub struct Overlay {
    roots: Vec<PathBuf>,
    ignore: IgnoreRuleSet,
}

impl Overlay {
    /// Creates an overlay. Every root must be an existing directory.
    pub fn new(roots: Vec<PathBuf>, ignore: IgnoreRuleSet) -> Result<Self, ContentError> {
        if roots.is_empty() {
            return Err(ContentError::NoRoots);
        }
        for root in &roots {
            match fs::metadata(root) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(ContentError::NotADirectory(root.clone())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ContentError::NotADirectory(root.clone()));
                }
                Err(e) => return Err(ContentError::io(root)(e)),
            }
        }
        Ok(Self { roots, ignore })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn ignore(&self) -> &IgnoreRuleSet {
        &self.ignore
    }

    /// The top of the merged view, backed by every root.
    pub fn root_dir(&self) -> OverlayDir {
        OverlayDir {
            relative_path: String::new(),
            roots: (0..self.roots.len()).collect(),
        }
    }

    /// Finds the merged directory at `relative_path`, if the view has one.
    pub fn dir_at(&self, relative_path: &str) -> Result<Option<OverlayDir>, ContentError> {
        let mut current = self.root_dir();
        for segment in relative_path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            let next = self
                .list(&current)?
                .into_iter()
                .find(|e| e.name == segment)
                .and_then(|e| match e.kind {
                    MergedKind::Directory(dir) => Some(dir),
                    MergedKind::File { .. } => None,
                });
            match next {
                Some(dir) => current = dir,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Lists the merged, non-ignored entries of `dir` in git tree order.
    pub fn list(&self, dir: &OverlayDir) -> Result<Vec<MergedEntry>, ContentError> {
        let mut winners: BTreeMap<String, (usize, PathEntry)> = BTreeMap::new();
        let mut dir_roots: HashMap<String, Vec<usize>> = HashMap::new();

        for &index in &dir.roots {
            let base = self.disk_path(index, &dir.relative_path);
            for entry in list_dir(&base)? {
                if entry.name == VCS_DIR {
                    continue;
                }
                let relative = child_path(&dir.relative_path, &entry.name);
                if self.ignore.should_ignore(&relative) {
                    trace!(path = %relative, "ignored");
                    continue;
                }
                if entry.kind == EntryKind::Directory {
                    dir_roots.entry(entry.name.clone()).or_default().push(index);
                }
                winners.insert(entry.name.clone(), (index, entry));
            }
        }

        let mut merged: Vec<MergedEntry> = winners
            .into_iter()
            .map(|(name, (root, entry))| {
                let relative_path = child_path(&dir.relative_path, &name);
                let kind = match entry.kind {
                    EntryKind::Directory => MergedKind::Directory(OverlayDir {
                        relative_path: relative_path.clone(),
                        roots: dir_roots.remove(&name).unwrap_or_default(),
                    }),
                    EntryKind::File => MergedKind::File {
                        path: self.disk_path(root, &relative_path),
                        mode: entry.mode,
                    },
                };
                MergedEntry {
                    name,
                    relative_path,
                    root,
                    kind,
                }
            })
            .collect();

        merged.sort_by(|a, b| {
            tree_name_cmp(a.name.as_bytes(), a.is_dir(), b.name.as_bytes(), b.is_dir())
        });
        Ok(merged)
    }

    fn disk_path(&self, root: usize, relative_path: &str) -> PathBuf {
        let mut path = self.roots[root].clone();
        for segment in relative_path.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Merged entries of `relative_path` across `roots`, keyed by name.
///
/// Returns an empty map when no root has a directory at that path.
pub fn list_merged_entries(
    roots: &[PathBuf],
    relative_path: &str,
    ignore: &IgnoreRuleSet,
) -> Result<BTreeMap<String, MergedEntry>, ContentError> {
    let overlay = Overlay::new(roots.to_vec(), ignore.clone())?;
    let Some(dir) = overlay.dir_at(relative_path)? else {
        return Ok(BTreeMap::new());
    };
    Ok(overlay
        .list(&dir)?
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect())
}
