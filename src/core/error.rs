use std::fmt;

/// Failures raised by the segment log and its on-disk files.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// A segment or record failed validation.
    Corrupt(&'static str),
    /// `cursor.meta` is unreadable; the log falls back to full replay.
    CorruptMetadata(&'static str),
    Unsupported(&'static str),
    /// Segment written by a newer format revision.
    UnsupportedVersion(u32),
    /// A record that cannot fit in one segment, whatever its fill level.
    PayloadTooLarge { len: usize, max: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "segment log i/o: {err}"),
            Error::Corrupt(msg) => write!(f, "damaged segment: {msg}"),
            Error::CorruptMetadata(msg) => write!(f, "damaged cursor checkpoint: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::UnsupportedVersion(version) => {
                write!(f, "segment format version {version} is not supported")
            }
            Error::PayloadTooLarge { len, max } => {
                write!(f, "record of {len} bytes exceeds the {max}-byte segment capacity")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
