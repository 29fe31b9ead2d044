//! Storage backend abstraction: `Reader`/`Writer` are the seam between the
//! session state machine and whatever actually holds the bytes. The only
//! implementation shipped here is a sandboxed filesystem backend, but the
//! traits are intentionally free of filesystem-specific concepts so an
//! in-memory double can stand in for tests.

use std::fs::{self, File};
use std::io::{self, Read as _, Write as _};
use std::path::{Component, Path, PathBuf};

#[derive(Debug)]
pub enum BackendError {
    FileNotFound,
    FileExists,
    AccessViolation,
    /// The backend does not support the requested direction (e.g. a
    /// read-only backend asked for a writer).
    Unsupported,
    Io(io::Error),
}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => BackendError::FileNotFound,
            io::ErrorKind::AlreadyExists => BackendError::FileExists,
            _ => BackendError::Io(e),
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BackendError::FileNotFound => write!(f, "file not found"),
            BackendError::FileExists => write!(f, "file already exists"),
            BackendError::AccessViolation => write!(f, "access violation"),
            BackendError::Unsupported => write!(f, "unsupported operation"),
            BackendError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Source of DATA bytes for a read request.
///
/// `Debug` is a supertrait so that session types generic over `Reader`
/// (and `Writer`, below) can derive `Debug` without each concrete backend
/// needing to remember to do so itself.
pub trait Reader: std::fmt::Debug {
    /// Reads up to `len` bytes. A return shorter than `len` signals the
    /// final block of the transfer.
    fn read(&mut self, len: usize) -> io::Result<Vec<u8>>;
    /// Total size in bytes, when known up front.
    fn size(&self) -> Option<u64>;
    /// Called once the transfer completed successfully. Idempotent.
    fn finish(&mut self);
    /// Called if the transfer is aborted before completion. Idempotent.
    /// Default behavior is the same as a normal finish.
    fn cancel(&mut self) {
        self.finish();
    }
}

/// Sink for DATA bytes from a write request.
pub trait Writer: std::fmt::Debug {
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Called once every block has been written successfully. Idempotent.
    fn finish(&mut self);
    /// Called if the transfer is aborted before completion: any partial
    /// data written so far is discarded. Idempotent.
    fn cancel(&mut self);
}

/// Produces `Reader`/`Writer` instances for named resources, and decides
/// whether reads/writes are permitted at all.
pub trait Backend {
    type R: Reader;
    type W: Writer;

    fn can_read(&self) -> bool;
    fn can_write(&self) -> bool;

    fn get_reader(&self, name: &str) -> Result<Self::R>;
    fn get_writer(&self, name: &str) -> Result<Self::W>;
}

/// Rejects absolute paths and `..` components, and strips leading/trailing
/// separators, mirroring how clients commonly send `/foo/bar` or `bar/`
/// rather than a bare relative name.
fn sanitize(name: &str) -> Result<PathBuf> {
    let trimmed = name.trim_matches('/');
    let candidate = Path::new(trimmed);

    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => return Err(BackendError::AccessViolation),
        }
    }

    Ok(candidate.to_path_buf())
}

#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    can_read: bool,
    can_write: bool,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>, can_read: bool, can_write: bool) -> Self {
        FsBackend {
            root: root.into(),
            can_read,
            can_write,
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let rel = sanitize(name)?;
        Ok(self.root.join(rel))
    }
}

impl Backend for FsBackend {
    type R = FsReader;
    type W = FsWriter;

    fn can_read(&self) -> bool {
        self.can_read
    }

    fn can_write(&self) -> bool {
        self.can_write
    }

    fn get_reader(&self, name: &str) -> Result<FsReader> {
        if !self.can_read {
            return Err(BackendError::Unsupported);
        }
        let path = self.resolve(name)?;
        let file = File::open(&path)?;
        let size = file.metadata().ok().map(|m| m.len());
        Ok(FsReader {
            file,
            size,
            done: false,
        })
    }

    fn get_writer(&self, name: &str) -> Result<FsWriter> {
        if !self.can_write {
            return Err(BackendError::Unsupported);
        }
        let path = self.resolve(name)?;
        if path.exists() {
            return Err(BackendError::FileExists);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(FsWriter {
            file,
            path,
            done: false,
        })
    }
}

#[derive(Debug)]
pub struct FsReader {
    file: File,
    size: Option<u64>,
    done: bool,
}

impl Reader for FsReader {
    fn read(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut total = 0;
        while total < len {
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn finish(&mut self) {
        self.done = true;
    }
}

#[derive(Debug)]
pub struct FsWriter {
    file: File,
    path: PathBuf,
    done: bool,
}

impl Writer for FsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let _ = self.file.flush();
    }

    fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let _ = fs::remove_file(&self.path);
    }
}
