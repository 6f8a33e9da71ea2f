//! File identities and position-tracking file handles.

use std::cell::Cell;
use std::env;
use std::fs;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log;
use tempfile;

use crate::error::{Error, Result};

/// Something that identifies a file on disk, as opposed to an open file.
///
/// Shared via [`Rc`]; when the last reference drops and the auto-unlink
/// flag is set, the path is removed from the filesystem. The driver flips
/// the flag off on the destination only after a successful sort, so a
/// failure never leaves a half-written output behind. Transient run files
/// keep the flag set for their whole life.
#[derive(Debug)]
pub struct FileId {
    path: PathBuf,
    auto_unlink: Cell<bool>,
}

impl FileId {
    /// A file identity for an ordinary path, not unlinked on drop.
    pub fn with_path(path: impl Into<PathBuf>) -> Rc<FileId> {
        Rc::new(FileId {
            path: path.into(),
            auto_unlink: Cell::new(false),
        })
    }

    /// Creates a uniquely named empty file in `dir` and returns its
    /// identity with auto-unlink set.
    pub fn temporary_in(dir: &Path, prefix: &str) -> Result<Rc<FileId>> {
        let named = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(dir)
            .map_err(|e| Error::io("Creating temporary file in", dir, e))?;

        // The descriptor tempfile opened is not reused; the handles below
        // open the path themselves, as every other file in the crate.
        let (file, path) = named
            .keep()
            .map_err(|e| Error::io("Creating temporary file in", dir, e.error))?;
        drop(file);

        Ok(Rc::new(FileId {
            path,
            auto_unlink: Cell::new(true),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_auto_unlink(&self, auto_unlink: bool) {
        self.auto_unlink.set(auto_unlink);
    }
}

impl Drop for FileId {
    fn drop(&mut self) {
        if self.auto_unlink.get() {
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    log::warn!("unlinking {}: {}", self.path.display(), err);
                }
            }
        }
    }
}

/// The directory transient files are created in: `TMP`, `TEMP` and
/// `TMPDIR` in that order, `/tmp` when none is set.
pub fn env_tmp_dir() -> PathBuf {
    ["TMP", "TEMP", "TMPDIR"]
        .iter()
        .find_map(|var| env::var_os(var).filter(|v| !v.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// A file opened for reading, with a logical byte position.
#[derive(Debug)]
pub struct InputFile {
    id: Rc<FileId>,
    file: fs::File,
    pos: u64,
}

impl InputFile {
    pub fn open(id: &Rc<FileId>) -> Result<InputFile> {
        let file = fs::File::open(id.path())
            .map_err(|e| Error::io("Error opening", id.path(), e))?;
        Ok(InputFile {
            id: Rc::clone(id),
            file,
            pos: 0,
        })
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Whether setting the position is possible. Pipes and sockets are not
    /// seekable; regular files are.
    pub fn is_seekable(&self) -> bool {
        match self.file.metadata() {
            Ok(meta) => meta.is_file(),
            Err(err) => {
                log::warn!("stat {}: {}", self.id.path().display(), err);
                false
            }
        }
    }

    pub fn set_pos(&mut self, new_pos: u64) -> Result<()> {
        if self.pos == new_pos {
            return Ok(());
        }
        self.pos = new_pos;
        self.file
            .seek(SeekFrom::Start(new_pos))
            .map_err(|e| Error::io("Seeking in", self.id.path(), e))?;
        Ok(())
    }

    /// Reads until `buf` is full or EOF. Returns the number of bytes
    /// obtained; zero means EOF. EINTR continues the loop.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    self.pos += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("Reading from", self.id.path(), e)),
            }
        }
        Ok(filled)
    }
}

/// A file opened for writing (created, truncated), with a logical position.
pub struct OutputFile {
    id: Rc<FileId>,
    file: fs::File,
    pos: u64,
}

impl OutputFile {
    pub fn create(id: &Rc<FileId>) -> Result<OutputFile> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(id.path())
            .map_err(|e| Error::io("Error opening", id.path(), e))?;
        Ok(OutputFile {
            id: Rc::clone(id),
            file,
            pos: 0,
        })
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        // write_all already restarts on EINTR
        self.file
            .write_all(data)
            .map_err(|e| Error::io("Writing to", self.id.path(), e))?;
        self.pos += data.len() as u64;
        Ok(())
    }

    /// Pushes written data to stable storage. EINVAL means the sink is a
    /// pipe or socket and is tolerated; EINTR restarts the call.
    pub fn sync(&mut self) -> Result<()> {
        loop {
            match self.file.sync_all() {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => return Ok(()),
                Err(e) => return Err(Error::io("Flushing", self.id.path(), e)),
            }
        }
    }
}
