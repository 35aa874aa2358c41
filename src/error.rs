use derive_more::Display;
use thiserror::Error;

use crate::parser::{ParseError, ParseErrorKind};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error returned by every fallible operation on an [`crate::Mp4File`].
#[derive(Debug, Error)]
#[error(
    "{kind}: {context}{}",
    self.source.as_ref().map(|e| format!(" ({e})")).unwrap_or_default()
)]
pub struct Error {
    kind: ErrorKind,
    /// Where the error happened, e.g. the property path or operation name.
    context: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("malformed input")]
    Malformed,
    #[display("no such property")]
    NotFound,
    #[display("type mismatch")]
    TypeMismatch,
    #[display("operation not permitted in read mode")]
    WriteProtected,
    #[display("resource exhausted")]
    ResourceExhausted,
    #[display("invalid argument")]
    InvalidArgument,
    #[display("I/O error")]
    Io,
}

impl Error {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            source: None,
        }
    }

    pub fn malformed(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, context)
    }

    pub fn not_found(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, context)
    }

    pub fn type_mismatch(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, context)
    }

    pub fn write_protected(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::WriteProtected, context)
    }

    pub fn exhausted(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, context)
    }

    pub fn invalid(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, context)
    }

    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            context: context.into(),
            source: Some(Box::new(err)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// OS error code of the underlying I/O failure, if any.
    pub fn errno(&self) -> Option<i32> {
        let mut source = self
            .source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                return io.raw_os_error();
            }
            source = err.source();
        }
        None
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        let kind = match err.kind() {
            ParseErrorKind::Io => ErrorKind::Io,
            _ => ErrorKind::Malformed,
        };
        Self {
            kind,
            context: "failed to parse atom tree".to_string(),
            source: Some(Box::new(err)),
        }
    }
}
