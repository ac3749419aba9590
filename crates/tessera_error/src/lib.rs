//! Error type and result helpers shared across the workspace.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

pub type Result<T, E = TesseraError> = std::result::Result<T, E>;

/// The error type used throughout the engine.
#[derive(Debug)]
pub struct TesseraError {
    inner: Box<ErrorInner>,
}

#[derive(Debug)]
struct ErrorInner {
    msg: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    backtrace: Backtrace,
}

impl TesseraError {
    pub fn new(msg: impl Into<String>) -> Self {
        TesseraError {
            inner: Box::new(ErrorInner {
                msg: msg.into(),
                source: None,
                backtrace: Backtrace::capture(),
            }),
        }
    }

    pub fn with_source(
        msg: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TesseraError {
            inner: Box::new(ErrorInner {
                msg: msg.into(),
                source: Some(source),
                backtrace: Backtrace::capture(),
            }),
        }
    }

    pub fn msg(&self) -> &str {
        &self.inner.msg
    }
}

impl fmt::Display for TesseraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;
        if let Some(source) = &self.inner.source {
            write!(f, ": {source}")?;
        }
        if self.inner.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nbacktrace: {}", self.inner.backtrace)?;
        }
        Ok(())
    }
}

impl std::error::Error for TesseraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for TesseraError {
    fn from(err: std::io::Error) -> Self {
        TesseraError::with_source("io error", Box::new(err))
    }
}

impl From<std::string::FromUtf8Error> for TesseraError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        TesseraError::with_source("invalid utf8", Box::new(err))
    }
}

pub trait ResultExt<T> {
    /// Wrap an error with additional context.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap an error with additional lazily computed context.
    fn context_fn(self, f: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(TesseraError::with_source(msg, Box::new(e))),
        }
    }

    fn context_fn(self, f: impl FnOnce() -> String) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(TesseraError::with_source(f(), Box::new(e))),
        }
    }
}

pub trait OptionExt<T> {
    /// Convert a None into an error with the given message.
    fn required(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(TesseraError::new(msg)),
        }
    }
}

#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        return Err($crate::TesseraError::new(format!("not implemented: {msg}")));
    }};
}
