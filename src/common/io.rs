//! Common, IO-related code.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use flate2::{bufread::MultiGzDecoder, write::GzEncoder, Compression};

use crate::err::AppError;

/// Transparently open a file with gzip decoder.
///
/// Files ending in `.gz` or `.bgz` are decoded, which includes BGZF files.
pub fn open_read_maybe_gz<P>(path: P) -> Result<Box<dyn BufRead>, anyhow::Error>
where
    P: AsRef<Path>,
{
    let ext = path.as_ref().extension().and_then(|s| s.to_str());
    if matches!(ext, Some("gz") | Some("bgz")) {
        tracing::trace!("Opening {:?} as gzip for reading", path.as_ref());
        let file = File::open(path)?;
        let bufreader = BufReader::new(file);
        let decoder = MultiGzDecoder::new(bufreader);
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        tracing::trace!("Opening {:?} as plain text for reading", path.as_ref());
        let file = File::open(path)?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Transparently open a file with gzip encoder.
pub fn open_write_maybe_gz<P>(path: P) -> Result<Box<dyn Write>, anyhow::Error>
where
    P: AsRef<Path>,
{
    if path.as_ref().extension().map(|s| s.to_str()) == Some(Some("gz")) {
        tracing::trace!("Opening {:?} as gzip for writing", path.as_ref());
        let file = File::create(path)?;
        let bufwriter = BufWriter::new(file);
        let encoder = GzEncoder::new(bufwriter, Compression::default());
        Ok(Box::new(encoder))
    } else {
        tracing::trace!("Opening {:?} as plain text for writing", path.as_ref());
        let file = File::create(path)?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Expand `~` and environment variables in a path given on the command line.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(
        shellexpand::full(raw)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw.to_string()),
    )
}

/// An optional external resource, validated once when constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// The resource was given and exists.
    Configured(PathBuf),
    /// The resource was not given.
    Absent,
}

impl Source {
    /// Build from an optional command line value; empty strings count as absent.
    ///
    /// # Errors
    ///
    /// If a path was given but does not exist.
    pub fn new(raw: Option<&str>, what: &str) -> Result<Self, AppError> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(Source::Absent),
            Some(raw) => {
                let path = expand_path(raw);
                if path.exists() {
                    Ok(Source::Configured(path))
                } else {
                    Err(AppError::MissingResource {
                        path,
                        hint: format!("{} not found: does the file exist?", what),
                    })
                }
            }
        }
    }

    /// Return the path if configured.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Source::Configured(path) => Some(path.as_path()),
            Source::Absent => None,
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Source::Configured(_))
    }
}

/// Require that the file at `path` exists.
///
/// # Errors
///
/// `AppError::MissingResource` naming the path and the given hint.
pub fn require_file(path: &Path, hint: &str) -> Result<(), AppError> {
    if path.exists() {
        Ok(())
    } else {
        Err(AppError::MissingResource {
            path: path.to_path_buf(),
            hint: hint.to_string(),
        })
    }
}
