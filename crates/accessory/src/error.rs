//! Error taxonomy shared by the pool, task and queue layers

use std::fmt;

use crate::storage::StoreError;

/// Errors returned by pool, task and queue operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid tag name or value, invalid option, missing required filter
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// No matching task or record
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation attempted on a closed or not-yet-ready resource
    #[error("out of order: {0}")]
    OutOfOrder(String),

    /// No pooled connection available; retry later
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An invariant was violated
    #[error("internal error: {0}")]
    InternalAppError(String),

    /// Storage adapter error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Several independent failures
    #[error("{0}")]
    Multiple(Errors),
}

impl Error {
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Self::BadParameter(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalAppError(msg.into())
    }

    /// True when the caller should simply retry later
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

/// An ordered collection of errors, reported together
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

impl Errors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: impl Into<Error>) {
        self.0.push(err.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }

    /// Ok when nothing was collected, the error itself when exactly one was,
    /// otherwise `Error::Multiple`
    pub fn into_result(mut self) -> Result<(), Error> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(Error::Multiple(self)),
        }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl IntoIterator for Errors {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
