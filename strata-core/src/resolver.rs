//! Resolving event sources into readable handles.

use std::{
    fmt,
    fs::File,
    io::{self, BufReader, Read, Seek},
    path::PathBuf,
};

use strata_model::{EventSource, SourceKind};
use thiserror::Error;

/// A readable, seekable input handed to parsers.
pub trait SourceRead: Read + Seek + Send {}

impl<T: Read + Seek + Send> SourceRead for T {}

pub type SourceHandle = Box<dyn SourceRead>;

/// Failure to open one source. Always a per-source warning, never fatal to
/// the task.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{path} not found")]
    NotFound { path: String },

    #[error("permission denied for {path}")]
    PermissionDenied { path: String },

    #[error("{path} is unreadable: {reason}")]
    Corrupt { path: String, reason: String },
}

impl ResolveError {
    pub fn from_io(source: &EventSource, err: io::Error) -> Self {
        let path = source.display_name();
        match err.kind() {
            io::ErrorKind::NotFound => ResolveError::NotFound { path },
            io::ErrorKind::PermissionDenied => {
                ResolveError::PermissionDenied { path }
            }
            _ => ResolveError::Corrupt {
                path,
                reason: err.to_string(),
            },
        }
    }
}

pub trait SourceResolver: Send + Sync {
    fn open(&self, source: &EventSource) -> Result<SourceHandle, ResolveError>;
}

/// Resolves plain files on a mounted filesystem, optionally relative to a
/// root directory. Container chains need an image/archive collaborator and
/// are reported as unreadable here.
#[derive(Clone, Default)]
pub struct FsResolver {
    root: Option<PathBuf>,
}

impl fmt::Debug for FsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsResolver").field("root", &self.root).finish()
    }
}

impl FsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl SourceResolver for FsResolver {
    fn open(&self, source: &EventSource) -> Result<SourceHandle, ResolveError> {
        if source.kind() == SourceKind::ArchiveMember {
            return Err(ResolveError::Corrupt {
                path: source.display_name(),
                reason: "container extraction is not available on this host"
                    .into(),
            });
        }

        let path = match &self.root {
            Some(root) => {
                let location = source.location();
                root.join(location.strip_prefix("/").unwrap_or(location))
            }
            None => source.location().to_path_buf(),
        };

        let file = File::open(&path)
            .map_err(|err| ResolveError::from_io(source, err))?;
        let metadata = file
            .metadata()
            .map_err(|err| ResolveError::from_io(source, err))?;
        if !metadata.is_file() {
            return Err(ResolveError::Corrupt {
                path: source.display_name(),
                reason: "not a regular file".into(),
            });
        }

        Ok(Box::new(BufReader::new(file)))
    }
}
