use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use shipyard_content_hash::{IgnoreRuleSet, MergedEntry, MergedKind, Overlay};
use tar::{EntryType, Header};
use tracing::{debug, trace};

use crate::TransferError;

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

/// One open directory of the depth-first walk.
struct Frame {
    /// Relative path; `None` for the root.
    dir: Option<String>,
    /// Whether the directory header is already in the archive.
    written: bool,
    entries: std::vec::IntoIter<MergedEntry>,
}

/// Pull-based tar.gz producer over an [`Overlay`].
///
/// Each `read` advances the walk by as little as it can (one directory
/// listing or one file) and hands out whatever compressed bytes that
/// produced. Only one file is ever open, and the in-memory buffer holds at
/// most the compressed output of that file.
///
/// The archive mirrors the tree the content hash describes: overlay
/// resolution, ignore rules and symlink exclusion are the same, and
/// directories without files are left out. Headers are normalized (fixed
/// modes, zero mtime and owner) so equal trees give equal archives.
pub struct ArchiveReader {
    overlay: Overlay,
    builder: Option<tar::Builder<GzEncoder<Vec<u8>>>>,
    stack: Vec<Frame>,
    ready: Vec<u8>,
    pos: usize,
    started: bool,
    files_written: usize,
    bytes_out: u64,
}

impl ArchiveReader {
    pub fn new(overlay: Overlay) -> Self {
        let builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        Self {
            overlay,
            builder: Some(builder),
            stack: Vec::new(),
            ready: Vec::new(),
            pos: 0,
            started: false,
            files_written: 0,
            bytes_out: 0,
        }
    }

    /// Validates `roots` and prepares a reader over them.
    pub fn open(roots: Vec<PathBuf>, ignore: IgnoreRuleSet) -> Result<Self, TransferError> {
        Ok(Self::new(Overlay::new(roots, ignore)?))
    }

    /// Compressed bytes produced but not yet read.
    pub fn buffered_len(&self) -> usize {
        let encoder = self
            .builder
            .as_ref()
            .map(|b| b.get_ref().get_ref().len())
            .unwrap_or(0);
        self.ready.len() - self.pos + encoder
    }

    pub fn files_written(&self) -> usize {
        self.files_written
    }

    /// Compressed bytes handed out so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Advances the walk by one unit. Returns `false` once the archive is complete.
    fn step(&mut self) -> Result<bool, TransferError> {
        if !self.started {
            self.started = true;
            let root = self.overlay.root_dir();
            let entries = self.overlay.list(&root)?;
            self.stack.push(Frame {
                dir: None,
                written: true,
                entries: entries.into_iter(),
            });
            return Ok(true);
        }

        let Some(next) = self.stack.last_mut().map(|frame| frame.entries.next()) else {
            return self.finish();
        };

        match next {
            None => {
                self.stack.pop();
            }
            Some(entry) => match entry.kind {
                MergedKind::Directory(dir) => {
                    let children = self.overlay.list(&dir)?;
                    self.stack.push(Frame {
                        dir: Some(entry.relative_path),
                        written: false,
                        entries: children.into_iter(),
                    });
                }
                MergedKind::File { path, .. } => {
                    self.write_pending_dirs()?;
                    self.append_file(&entry.relative_path, &path)?;
                }
            },
        }

        self.drain_encoder();
        Ok(true)
    }

    fn finish(&mut self) -> Result<bool, TransferError> {
        let Some(builder) = self.builder.take() else {
            return Ok(false);
        };
        let encoder = builder.into_inner().map_err(archive_io("<trailer>"))?;
        let tail = encoder.finish().map_err(archive_io("<trailer>"))?;
        self.ready.extend_from_slice(&tail);
        debug!(files = self.files_written, "archive complete");
        Ok(true)
    }

    fn write_pending_dirs(&mut self) -> Result<(), TransferError> {
        let Some(builder) = self.builder.as_mut() else {
            return Ok(());
        };
        for frame in self.stack.iter_mut().filter(|f| !f.written) {
            frame.written = true;
            let Some(dir) = frame.dir.as_deref() else {
                continue;
            };
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(DIR_MODE);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            let name = format!("{dir}/");
            builder
                .append_data(&mut header, &name, io::empty())
                .map_err(archive_io(&name))?;
            trace!(dir = %name, "wrote directory header");
        }
        Ok(())
    }

    fn append_file(&mut self, relative_path: &str, path: &Path) -> Result<(), TransferError> {
        let Some(builder) = self.builder.as_mut() else {
            return Ok(());
        };
        let file = File::open(path).map_err(archive_io(relative_path))?;
        let len = file.metadata().map_err(archive_io(relative_path))?.len();

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(len);
        header.set_mode(FILE_MODE);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        let mut reader = CountingReader {
            inner: file.take(len),
            count: 0,
        };
        builder
            .append_data(&mut header, relative_path, &mut reader)
            .map_err(|e| {
                if reader.count < len && e.kind() == io::ErrorKind::UnexpectedEof {
                    TransferError::FileChanged(relative_path.to_string())
                } else {
                    archive_io(relative_path)(e)
                }
            })?;
        if reader.count != len {
            return Err(TransferError::FileChanged(relative_path.to_string()));
        }
        ensure_exhausted(&mut reader.inner.into_inner(), relative_path)?;

        self.files_written += 1;
        trace!(path = relative_path, bytes = len, "packaged file");
        Ok(())
    }

    fn drain_encoder(&mut self) {
        if let Some(builder) = self.builder.as_mut() {
            let out = builder.get_mut().get_mut();
            if !out.is_empty() {
                self.ready.extend_from_slice(out);
                out.clear();
            }
        }
    }
}

impl Read for ArchiveReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.ready.len() {
                let n = buf.len().min(self.ready.len() - self.pos);
                buf[..n].copy_from_slice(&self.ready[self.pos..self.pos + n]);
                self.pos += n;
                self.bytes_out += n as u64;
                return Ok(n);
            }
            self.ready.clear();
            self.pos = 0;
            if !self.step()? {
                return Ok(0);
            }
        }
    }
}

fn archive_io(path: &str) -> impl FnOnce(io::Error) -> TransferError + '_ {
    move |source| TransferError::Io {
        path: path.to_string(),
        source,
    }
}

/// Fails if `reader` still has data, i.e. the file grew past its stat'ed length.
fn ensure_exhausted<R: Read>(reader: &mut R, relative_path: &str) -> Result<(), TransferError> {
    let mut extra = [0u8; 1];
    if reader.read(&mut extra).map_err(archive_io(relative_path))? != 0 {
        return Err(TransferError::FileChanged(relative_path.to_string()));
    }
    Ok(())
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
