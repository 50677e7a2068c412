use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::ContentError;
use crate::order::tree_name_cmp;

const READ_BUF_SIZE: usize = 8192;

// ---------------------------------------------------------------------------
// ContentHash
// ---------------------------------------------------------------------------

/// A 20-byte git object id, rendered as 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 20]);

impl ContentHash {
    /// Hash of the tree with no entries (`git hash-object -t tree /dev/null`).
    pub const EMPTY_TREE: ContentHash = ContentHash([
        0x4b, 0x82, 0x5d, 0xc6, 0x42, 0xcb, 0x6e, 0xb9, 0xa0, 0x60, 0xe5, 0x4b, 0xf8, 0xd6, 0x92,
        0x88, 0xfb, 0xee, 0x49, 0x04,
    ]);

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ContentError::InvalidHash(s.into()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

/// Incremental blob hasher for content whose length is known up front.
///
/// Git prefixes the content with `blob <len>\0`, so the length has to be
/// fixed before the first byte is fed in.
pub struct BlobHasher {
    inner: Sha1,
    expected: u64,
    written: u64,
}

impl BlobHasher {
    pub fn new(len: u64) -> Self {
        let mut inner = Sha1::new();
        inner.update(format!("blob {len}\0").as_bytes());
        Self {
            inner,
            expected: len,
            written: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.written += data.len() as u64;
        self.inner.update(data);
    }

    /// Returns `None` when the number of bytes fed differs from the declared length.
    pub fn finish(self) -> Option<ContentHash> {
        if self.written != self.expected {
            return None;
        }
        Some(ContentHash(self.inner.finalize().into()))
    }
}

/// Git blob id of `data`.
pub fn blob_hash(data: &[u8]) -> ContentHash {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", data.len()).as_bytes());
    hasher.update(data);
    ContentHash(hasher.finalize().into())
}

/// Streams a file into its git blob id without loading it into memory.
///
/// The length comes from the file metadata; if the bytes actually read
/// disagree, the file changed underneath and [`ContentError::FileChanged`]
/// is returned.
pub fn hash_file(path: &Path) -> Result<ContentHash, ContentError> {
    let file = File::open(path).map_err(ContentError::io(path))?;
    let len = file.metadata().map_err(ContentError::io(path))?.len();

    let mut hasher = BlobHasher::new(len);
    // Read one byte past the declared length so growth is detected too.
    let mut reader = file.take(len + 1);
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).map_err(ContentError::io(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    hasher
        .finish()
        .ok_or_else(|| ContentError::FileChanged(path.to_path_buf()))
}

// ---------------------------------------------------------------------------
// Trees
// ---------------------------------------------------------------------------

/// Mode recorded for a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMode {
    Regular,
    Executable,
    Directory,
}

impl FileMode {
    /// The octal mode string git writes into the tree object.
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
            FileMode::Directory => "40000",
        }
    }

    pub fn is_dir(self) -> bool {
        self == FileMode::Directory
    }
}

/// One `mode name hash` record of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub name: String,
    pub hash: ContentHash,
}

impl TreeEntry {
    pub fn new(mode: FileMode, name: impl Into<String>, hash: ContentHash) -> Self {
        Self {
            mode,
            name: name.into(),
            hash,
        }
    }
}

/// Sorts entries into git tree order.
pub fn sort_tree_entries(entries: &mut [TreeEntry]) {
    entries.sort_by(|a, b| {
        tree_name_cmp(
            a.name.as_bytes(),
            a.mode.is_dir(),
            b.name.as_bytes(),
            b.mode.is_dir(),
        )
    });
}

/// Git tree id of `entries`, which must already be in git tree order.
pub fn tree_hash(entries: &[TreeEntry]) -> ContentHash {
    let mut body = Vec::with_capacity(entries.len() * 48);
    for entry in entries {
        body.extend_from_slice(entry.mode.as_str().as_bytes());
        body.push(b' ');
        body.extend_from_slice(entry.name.as_bytes());
        body.push(0);
        body.extend_from_slice(entry.hash.as_bytes());
    }

    let mut hasher = Sha1::new();
    hasher.update(format!("tree {}\0", body.len()).as_bytes());
    hasher.update(&body);
    ContentHash(hasher.finalize().into())
}
