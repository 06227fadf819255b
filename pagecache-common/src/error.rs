// Copyright 2025 foyer Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// ErrorKind is all kinds of Error of pagecache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// I/O error.
    Io,
    /// External error, e.g. raised by the loader supplied on a cache miss.
    External,
    /// Config error.
    Config,
    /// The page is not resident.
    ///
    /// Not a real failure. Indicates a miss, including a miss caused by a concurrent eviction.
    PageNotFound,
    /// The metadata claims the page is resident but the page store disagrees.
    Inconsistent,
    /// The caller violated an operation contract, e.g. a non-contiguous append.
    InvalidArgument,
    /// No space.
    NoSpace,
    /// Channel closed.
    ChannelClosed,
    /// Closed.
    Closed,
    /// Unsupported operation.
    Unsupported,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::Io => "I/O error",
            ErrorKind::External => "External error",
            ErrorKind::Config => "Config error",
            ErrorKind::PageNotFound => "Page not found",
            ErrorKind::Inconsistent => "Inconsistent state",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::NoSpace => "No space",
            ErrorKind::ChannelClosed => "Channel closed",
            ErrorKind::Closed => "Closed",
            ErrorKind::Unsupported => "Unsupported operation",
        }
    }
}

/// Error is the error struct returned by all pagecache functions.
///
/// Displayed in a single line via `Display`:
///
/// ```shell
/// Inconsistent state, context: { page: file-1:3 } => page is resident in metadata but missing in page store
/// ```
///
/// `Debug` prints context, source and the captured backtrace on separate lines. `{:#?}` falls back to the
/// conventional struct representation.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {k}: {v}")?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{k}: {v}")?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, please use `with_source` method.
    ///
    /// ```rust
    /// # use pagecache_common::error::{Error, ErrorKind};
    /// let io_error = std::io::Error::other("disk is gone");
    /// Error::new(ErrorKind::Io, "write page failed").with_source(io_error);
    /// ```
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, we will raise a panic here.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &Vec<(&'static str, String)> {
        &self.context
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if the error only reports a missing page.
    pub fn is_page_not_found(&self) -> bool {
        self.kind == ErrorKind::PageNotFound
    }
}

/// Result type for pagecache.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating an [`ErrorKind::Io`] error from [`std::io::Error`].
    ///
    /// [`std::io::ErrorKind::NotFound`] is reported as [`ErrorKind::PageNotFound`].
    pub fn io_error(source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Error::new(ErrorKind::PageNotFound, "page file not found").with_source(source),
            _ => Error::new(ErrorKind::Io, "page store I/O failed").with_source(source),
        }
    }

    /// Helper for creating a [`ErrorKind::PageNotFound`] error for the given page.
    pub fn page_not_found(page: impl ToString) -> Self {
        Error::new(ErrorKind::PageNotFound, "page is not resident").with_context("page", page)
    }

    /// Helper for creating a [`ErrorKind::NoSpace`] error with context.
    pub fn no_space(capacity: u64, used: u64, required: u64) -> Self {
        Error::new(ErrorKind::NoSpace, "not enough space left")
            .with_context("capacity", capacity)
            .with_context("used", used)
            .with_context("required", required)
    }

    /// Helper for wrapping an error raised by a caller-supplied loader.
    pub fn external(source: impl Into<anyhow::Error>) -> Self {
        Error::new(ErrorKind::External, "external data supplier failed").with_source(source)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Error>();
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct LoaderError(String);

    impl std::fmt::Display for LoaderError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "LoaderError: {}", self.0)
        }
    }

    impl std::error::Error for LoaderError {}

    #[test]
    fn test_error_display() {
        let err = Error::new(ErrorKind::Inconsistent, "page missing in page store")
            .with_context("page", "f:1")
            .with_context("offset", 0);

        assert_eq!(
            "Inconsistent state, context: { page: f:1, offset: 0 } => page missing in page store",
            err.to_string()
        );
    }

    #[test]
    fn test_io_not_found_is_page_not_found() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_page_not_found());

        let err: Error = std::io::Error::other("broken disk").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_external_downcast() {
        let inner = LoaderError("remote read timed out".to_string());
        let err = Error::external(inner.clone());

        assert_eq!(err.kind(), ErrorKind::External);
        assert_eq!(err.downcast_ref::<LoaderError>().unwrap(), &inner);
    }
}
