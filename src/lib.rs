//! Deferred, single-flight construction of request handlers.
//!
//! Some handlers are expensive to build: they load plugins, open connections,
//! or compile templates. This crate lets such a handler be mounted right away
//! while its construction waits until a request actually needs it.
//!
//! - [`Gate<H, E>`]: the core cell. It runs an async factory at most once at a
//!   time, parks concurrent callers on that one attempt, installs the handler on
//!   success and hands the factory's error to every waiter on failure without
//!   remembering it, so the next caller retries.
//! - [`LazyLoader`] / [`LazyRouter`] (feature `axum`, on by default): wrap a
//!   factory producing an [`axum::Router`] into a [`tower::Service`] that can be
//!   mounted with [`axum::Router::nest_service`].
//! - [`LoaderOptions`]: the `preload` switch, loadable from a config file or
//!   `LAZY_ROUTER__*` environment variables.
//!
//! # Examples
//!
//! ## Gate
//!
//! ```rust
//! use lazy_router::{Gate, LoaderOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let gate = Gate::<String, String>::new("greeter", LoaderOptions::new(), || async {
//!    Ok::<_, String>("hello".to_string())
//! });
//! assert!(!gate.is_loaded());
//!
//! assert_eq!(gate.load().await.unwrap(), "hello");
//! assert_eq!(gate.get().map(String::as_str), Some("hello"));
//! # }
//! ```
//!
//! ## Router
//!
//! ```rust,no_run
//! use axum::error_handling::HandleError;
//! use axum::http::StatusCode;
//! use axum::routing::get;
//! use axum::Router;
//! use lazy_router::{LazyLoader, LoaderOptions};
//!
//! async fn escalate(err: String) -> (StatusCode, String) {
//!    (StatusCode::SERVICE_UNAVAILABLE, err)
//! }
//!
//! let loader = LazyLoader::new(LoaderOptions::new());
//! let reports = loader.lazy("reports", || async {
//!    // Expensive setup happens here, on first request only.
//!    Ok::<_, String>(Router::new().route("/daily", get(|| async { "ok" })))
//! });
//!
//! let app: Router = Router::new().nest_service("/reports", HandleError::new(reports, escalate));
//! ```

mod error;
mod export;
mod gate;
mod options;
mod state;

/// Axum integration.
#[cfg(feature = "axum")]
mod router;

pub use error::{Error, Result};
pub use export::{Export, Module};
pub use gate::Gate;
pub use options::{LoaderOptions, CONFIG_FILE, ENV_PREFIX};
#[cfg(feature = "axum")]
pub use router::{LazyLoader, LazyRouter};
pub use state::GateState;
