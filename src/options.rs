//! Loader configuration.

use std::path::Path;

use config::{Config as ConfigLoader, Environment, File, Source};
use serde::Deserialize;

use crate::error::Result;

/// Base name of the optional configuration file picked up by [`LoaderOptions::load`].
pub const CONFIG_FILE: &str = "lazy-router";

/// Prefix of environment overrides, e.g. `LAZY_ROUTER__PRELOAD=true`.
pub const ENV_PREFIX: &str = "LAZY_ROUTER";

/// Options shared by every gate created from one loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
   /// Start constructing the handler at mount time instead of on first request.
   pub preload: bool,
}

impl LoaderOptions {
   #[inline]
   #[must_use]
   pub const fn new() -> Self {
      Self { preload: false }
   }

   #[inline]
   #[must_use]
   pub const fn with_preload(mut self, preload: bool) -> Self {
      self.preload = preload;
      self
   }

   /// Loads options from `lazy-router.{toml,yaml,json,...}` in the working
   /// directory if present, then applies `LAZY_ROUTER__*` environment overrides.
   pub fn load() -> Result<Self> {
      Self::build(
         File::with_name(CONFIG_FILE).required(false),
         Self::environment(),
      )
   }

   /// Like [`LoaderOptions::load`], but the file at `path` must exist.
   pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
      Self::build(File::from(path.as_ref()).required(true), Self::environment())
   }

   fn environment() -> Environment {
      Environment::with_prefix(ENV_PREFIX)
         .separator("__")
         .try_parsing(true)
   }

   fn build<S>(file: S, env: Environment) -> Result<Self>
   where
      S: Source + Send + Sync + 'static,
   {
      let options = ConfigLoader::builder()
         .set_default("preload", false)?
         .add_source(file)
         .add_source(env)
         .build()?
         .try_deserialize()?;
      Ok(options)
   }
}
