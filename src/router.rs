//! Mounting lazily built axum routers.
//!
//! [`LazyLoader`] carries the options shared by a group of lazy mounts and
//! turns each factory into a [`LazyRouter`]. A `LazyRouter` is a plain
//! [`tower::Service`]: once its gate is loaded it forwards every request to the
//! installed router untouched, and before that it waits on the gate.
//!
//! A failed construction resolves the service future with the factory's error
//! as the service error. Mount points decide how that error is rendered,
//! typically with [`axum::error_handling::HandleError`]:
//!
//! ```rust,ignore
//! Router::new().nest_service("/api", HandleError::new(lazy, render_error))
//! ```
//!
//! A factory that panics is not an error value and never reaches the error
//! handler: the panic is re-raised in every request waiting on that attempt
//! (see [`Gate::load`]), which ends the request task. The gate stays usable and
//! the next request retries. To answer such requests with a 500 instead, wrap
//! the mount in a catch-panic layer, e.g. tower-http's `CatchPanicLayer`.

use core::fmt;
use core::future::Future;
use core::task::{Context, Poll};
use std::sync::Arc;

use axum::extract::Request;
use axum::response::Response;
use axum::Router;
use futures_util::future::BoxFuture;
use tower::{Service, ServiceExt};

use crate::export::Export;
use crate::gate::Gate;
use crate::options::LoaderOptions;

/// Creates [`LazyRouter`]s that share one set of [`LoaderOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LazyLoader {
   options: LoaderOptions,
}

impl LazyLoader {
   #[inline]
   #[must_use]
   pub const fn new(options: LoaderOptions) -> Self {
      Self { options }
   }

   #[inline]
   pub const fn options(&self) -> LoaderOptions {
      self.options
   }

   /// Wraps `factory` in its own gate.
   ///
   /// `name` identifies the mount in diagnostics. The factory may resolve to a
   /// [`Router`] or to a [`Module`](crate::Module) holding one as `default`.
   /// With `preload` enabled this must be called inside a tokio runtime for the
   /// preload to start.
   pub fn lazy<F, Fut, M, E>(&self, name: impl Into<String>, factory: F) -> LazyRouter<E>
   where
      F: Fn() -> Fut + Send + Sync + 'static,
      Fut: Future<Output = Result<M, E>> + Send + 'static,
      M: Into<Export<Router>> + Send + 'static,
      E: Clone + fmt::Display + Send + Sync + 'static,
   {
      LazyRouter {
         gate: Gate::new(name, self.options, factory),
      }
   }
}

/// A [`Router`] that is built on first use.
pub struct LazyRouter<E> {
   gate: Arc<Gate<Router, E>>,
}

impl<E> LazyRouter<E> {
   /// The gate guarding the inner router.
   #[inline]
   pub fn gate(&self) -> &Arc<Gate<Router, E>> {
      &self.gate
   }
}

impl<E> Clone for LazyRouter<E> {
   fn clone(&self) -> Self {
      Self {
         gate: Arc::clone(&self.gate),
      }
   }
}

impl<E> fmt::Debug for LazyRouter<E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("LazyRouter")
         .field("name", &self.gate.name())
         .field("state", &self.gate.state())
         .finish()
   }
}

impl<E> Service<Request> for LazyRouter<E>
where
   E: Clone + fmt::Display + Send + Sync + 'static,
{
   type Response = Response;
   type Error = E;
   type Future = BoxFuture<'static, Result<Response, E>>;

   #[inline]
   fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), E>> {
      Poll::Ready(Ok(()))
   }

   fn call(&mut self, request: Request) -> Self::Future {
      // Loaded: straight through, no waiting.
      if let Some(router) = self.gate.get() {
         let router = router.clone();
         return Box::pin(async move { Ok(forward(router, request).await) });
      }

      let gate = Arc::clone(&self.gate);
      Box::pin(async move {
         let router = gate.load().await?.clone();
         Ok(forward(router, request).await)
      })
   }
}

async fn forward(router: Router, request: Request) -> Response {
   match router.oneshot(request).await {
      Ok(response) => response,
      Err(never) => match never {},
   }
}
