//! Crate error type.

/// Errors raised by the crate itself.
///
/// Factory failures are never wrapped in this type: they reach callers as the
/// factory's own error value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   #[error("invalid loader configuration: {0}")]
   Config(#[from] config::ConfigError),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
