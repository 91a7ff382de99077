//! Error related business logic of `dagon`.
//!
//! Contains the `ErrorKind` enum generated by the `build.rs` build
//! script, with one variant per module of the crate. An `Error` pairs
//! a kind with an optional detail line and, when a foreign error is
//! being surfaced, the underlying cause; the cause stays reachable
//! through `std::error::Error::source`, so log lines show the whole
//! chain.

use std::error;
use std::fmt;
use std::result;

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

type Cause = Box<dyn error::Error + Send + Sync>;

/// The error type used throughout this crate.
pub struct Error {
    kind: ErrorKind,
    detail: Option<String>,
    source: Option<Cause>,
}

impl Error {
    /// An error carrying nothing but its kind.
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            detail: None,
            source: None,
        }
    }

    /// An error with a human readable detail line.
    pub fn detailed<D: Into<String>>(kind: ErrorKind, detail: D) -> Self {
        Error {
            kind,
            detail: Some(detail.into()),
            source: None,
        }
    }

    /// Surfaces a foreign error under one of our kinds, keeping it as
    /// the source of the chain.
    pub fn caused<E>(kind: ErrorKind, cause: E) -> Self
    where
        E: Into<Cause>,
    {
        Error {
            kind,
            detail: None,
            source: Some(cause.into()),
        }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the detail line, when one was attached.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

/// Extension of the standard library's `Result` type, attaching one of
/// our kinds to whatever error is inside.
pub trait ErrorKindExt {
    type T;

    /// Reclassifies the error under `kind`; the original becomes the
    /// source.
    fn with_kind(self, kind: ErrorKind) -> Result<Self::T>;

    /// Like `with_kind`, with a detail line for the log.
    fn with_kind_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ErrorKindExt for result::Result<T, E>
where
    E: Into<Cause>,
{
    type T = T;

    fn with_kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::caused(kind, e))
    }

    fn with_kind_msg(self, kind: ErrorKind, msg: &str) -> Result<T> {
        self.map_err(|e| Error {
            kind,
            detail: Some(msg.to_string()),
            source: Some(e.into()),
        })
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("kind", &self.kind);
        if let Some(detail) = &self.detail {
            d.field("detail", detail);
        }
        if let Some(source) = &self.source {
            d.field("source", source);
        }
        d.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn error::Error + 'static))
    }
}

pub use error_kind::ErrorKind;

mod error_kind {
    include!(concat!(env!("OUT_DIR"), "/error_kind.rs"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_display_shows_the_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = Err::<(), _>(io)
            .with_kind_msg(ErrorKind::Listener, "binding listener socket")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Listener);
        assert_eq!(err.detail(), Some("binding listener socket"));
        assert_eq!(
            err.to_string(),
            "Listener: binding listener socket: address in use"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_detailed_has_no_source() {
        let err = Error::detailed(ErrorKind::Config, "Invalid server name");
        assert_eq!(err.to_string(), "Config: Invalid server name");
        assert!(err.source().is_none());
    }
}
