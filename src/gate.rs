//! Deferred handler gate.
//!
//! A [`Gate<H, E>`] owns a factory that asynchronously builds a handler `H`,
//! and hands that handler out to callers. The factory is not invoked until the
//! first call to [`Gate::load`] (or at construction time with `preload`), and
//! no matter how many callers race, at most one invocation is in flight.
//!
//! Every caller that arrives while an attempt is in flight waits on that same
//! attempt and observes its outcome: the installed handler on success, a clone
//! of the factory's error on failure. Failures are not remembered; the next
//! caller starts a fresh attempt. Success is permanent, and from then on
//! [`Gate::get`] and [`Gate::load`] return the handler without locking.

use core::cell::UnsafeCell;
use core::future::Future;
use core::panic::AssertUnwindSafe;
use core::sync::atomic::Ordering;
use core::{fmt, mem};
use std::any::Any;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::export::Export;
use crate::options::LoaderOptions;
use crate::state::{GateLock, GateState};

type Factory<H, E> = Box<dyn Fn() -> BoxFuture<'static, Result<H, E>> + Send + Sync>;

/// Outcome of one attempt, broadcast to its waiters.
#[derive(Clone)]
enum Resolution<E> {
   Loaded,
   Failed(E),
   Panicked(Arc<str>),
}

type Outcome<E> = Option<Resolution<E>>;

/// What a caller should do after consulting the slot.
enum Ticket<E> {
   Loaded,
   Join(watch::Receiver<Outcome<E>>),
   Lead(watch::Receiver<Outcome<E>>, watch::Sender<Outcome<E>>),
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
   Request,
   Preload,
}

/// Lazily constructed, single-flight handler cell.
pub struct Gate<H, E> {
   name: String,
   lock: GateLock,
   handler: UnsafeCell<mem::MaybeUninit<H>>,
   /// Broadcast of the in-flight attempt, if any. Guarded by the slot lock.
   flight: UnsafeCell<Option<watch::Receiver<Outcome<E>>>>,
   factory: Factory<H, E>,
}

impl<H, E> Gate<H, E> {
   /// Name used to identify this gate in diagnostics.
   #[inline]
   pub fn name(&self) -> &str {
      &self.name
   }

   /// Current lifecycle state. Never blocks.
   #[inline]
   pub fn state(&self) -> GateState {
      self.lock.snapshot()
   }

   #[inline]
   pub fn is_loaded(&self) -> bool {
      self.lock.is_loaded(Ordering::Acquire)
   }

   /// Returns the installed handler, or `None` if not loaded yet. Never blocks.
   #[inline]
   pub fn get(&self) -> Option<&H> {
      if self.lock.is_loaded(Ordering::Acquire) {
         // SAFETY: LOADED is published with Release after the handler write and
         // the cell is never written again.
         Some(unsafe { (*self.handler.get()).assume_init_ref() })
      } else {
         None
      }
   }
}

impl<H, E> Gate<H, E>
where
   H: Send + Sync + 'static,
   E: Clone + fmt::Display + Send + Sync + 'static,
{
   /// Creates a gate around `factory`.
   ///
   /// The factory may resolve to the handler itself or to a
   /// [`Module`](crate::Module) exposing it as `default`. With
   /// `options.preload` set, construction starts right away; see
   /// [`Gate::preload`].
   pub fn new<F, Fut, M>(name: impl Into<String>, options: LoaderOptions, factory: F) -> Arc<Self>
   where
      F: Fn() -> Fut + Send + Sync + 'static,
      Fut: Future<Output = Result<M, E>> + Send + 'static,
      M: Into<Export<H>> + Send + 'static,
   {
      let factory: Factory<H, E> = Box::new(move || {
         let pending = factory();
         async move {
            let export = pending.await?;
            Ok::<H, E>(Into::<Export<H>>::into(export).into_handler())
         }
         .boxed()
      });
      let gate = Arc::new(Self {
         name: name.into(),
         lock: GateLock::new(),
         handler: UnsafeCell::new(mem::MaybeUninit::uninit()),
         flight: UnsafeCell::new(None),
         factory,
      });
      if options.preload {
         gate.preload();
      }
      gate
   }

   /// Starts constructing the handler in the background without waiting for it.
   ///
   /// Does nothing if the gate is loaded or an attempt is already in flight.
   /// A failure is logged and leaves the gate unloaded, so a later request
   /// retries. Outside a tokio runtime there is nothing to run the attempt on;
   /// the preload is skipped with a warning and loading stays deferred.
   pub fn preload(self: &Arc<Self>) {
      let Ok(runtime) = Handle::try_current() else {
         tracing::warn!(gate = %self.name, "no tokio runtime, preload skipped");
         return;
      };
      if let Ticket::Lead(_, sender) = self.enter() {
         runtime.spawn(Arc::clone(self).attempt(sender, Trigger::Preload));
      }
   }

   /// Returns the handler, constructing it first if needed.
   ///
   /// If an attempt is already in flight this waits for it rather than
   /// starting another; its failure is returned here as well. The attempt runs
   /// on its own task, so dropping this future does not abandon other waiters.
   ///
   /// # Panics
   ///
   /// If the factory panics, every caller waiting on that attempt panics with
   /// the gate name and the panic message. The gate itself stays usable.
   pub async fn load(self: &Arc<Self>) -> Result<&H, E> {
      loop {
         if let Some(handler) = self.get() {
            return Ok(handler);
         }

         let mut receiver = match self.enter() {
            Ticket::Loaded => continue,
            Ticket::Join(receiver) => receiver,
            Ticket::Lead(receiver, sender) => {
               let attempt = Arc::clone(self).attempt(sender, Trigger::Request);
               match Handle::try_current() {
                  Ok(runtime) => drop(runtime.spawn(attempt)),
                  Err(_) => attempt.await,
               }
               receiver
            }
         };

         let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .map(|resolution| Option::clone(&resolution));
         match outcome {
            Ok(Some(Resolution::Failed(err))) => return Err(err),
            Ok(Some(Resolution::Panicked(message))) => {
               panic!("handler factory for gate `{}` panicked: {message}", self.name)
            }
            // Loaded: picked up by `get` on the next turn.
            Ok(Some(Resolution::Loaded)) | Ok(None) => continue,
            // The attempt vanished without resolving (its runtime shut down).
            Err(_) => continue,
         }
      }
   }

   /// Joins the in-flight attempt or registers a new one.
   ///
   /// Runs entirely under the slot lock, so of any number of concurrent callers
   /// exactly one gets `Lead` for a given attempt.
   fn enter(&self) -> Ticket<E> {
      let Some(guard) = self.lock.lock() else {
         return Ticket::Loaded;
      };
      // SAFETY: the slot lock is held.
      let flight = unsafe { &mut *self.flight.get() };
      // A closed channel here means the attempt's task died before resolving.
      if let Some(receiver) = flight.as_ref().filter(|rx| rx.has_changed().is_ok()) {
         return Ticket::Join(receiver.clone());
      }
      let (sender, receiver) = watch::channel(None);
      *flight = Some(receiver.clone());
      guard.begin_loading();
      Ticket::Lead(receiver, sender)
   }

   /// Invokes the factory once and resolves the attempt.
   async fn attempt(self: Arc<Self>, sender: watch::Sender<Outcome<E>>, trigger: Trigger) {
      tracing::debug!(gate = %self.name, ?trigger, "invoking handler factory");
      let abandoned = Abandoned { gate: &*self };
      let result = AssertUnwindSafe(async { (self.factory)().await })
         .catch_unwind()
         .await;
      mem::forget(abandoned);

      let Some(guard) = self.lock.lock() else {
         return;
      };
      // SAFETY: the slot lock is held.
      unsafe { *self.flight.get() = None };

      let resolution = match result {
         Ok(Ok(handler)) => {
            // SAFETY: the slot lock is held and LOADED is not set yet, so no
            // reader can reach the cell.
            unsafe { (*self.handler.get()).write(handler) };
            guard.publish();
            tracing::debug!(gate = %self.name, "handler installed");
            Resolution::Loaded
         }
         Ok(Err(err)) => {
            guard.reset();
            match trigger {
               Trigger::Preload => {
                  tracing::error!(gate = %self.name, error = %err, "failed to preload handler")
               }
               Trigger::Request => {
                  tracing::debug!(gate = %self.name, error = %err, "handler factory failed")
               }
            }
            Resolution::Failed(err)
         }
         Err(payload) => {
            guard.reset();
            let message = panic_message(payload.as_ref());
            tracing::error!(gate = %self.name, ?trigger, panic = %message, "handler factory panicked");
            Resolution::Panicked(message)
         }
      };
      sender.send_replace(Some(resolution));
   }
}

/// Returns the gate to `Unloaded` if an attempt is dropped before it resolves,
/// e.g. an inline attempt whose caller went away or a task torn down with its
/// runtime. The attempt's sender is still alive while this runs, so the flight
/// slot cannot have been taken over by a newer attempt.
struct Abandoned<'a, H, E> {
   gate: &'a Gate<H, E>,
}

impl<H, E> Drop for Abandoned<'_, H, E> {
   fn drop(&mut self) {
      let Some(guard) = self.gate.lock.lock() else {
         return;
      };
      // SAFETY: the slot lock is held.
      unsafe { *self.gate.flight.get() = None };
      guard.reset();
      tracing::debug!(gate = %self.gate.name, "handler factory abandoned before resolving");
   }
}

fn panic_message(payload: &(dyn Any + Send)) -> Arc<str> {
   if let Some(message) = payload.downcast_ref::<&'static str>() {
      Arc::from(*message)
   } else if let Some(message) = payload.downcast_ref::<String>() {
      Arc::from(message.as_str())
   } else {
      Arc::from("Box<dyn Any>")
   }
}

// SAFETY: the handler cell is written once, under the slot lock, before LOADED
// is published, and only read after observing LOADED. The flight slot is only
// touched under the slot lock. Handlers are shared by reference across threads
// (`H: Sync`) and may be dropped on any thread (`H: Send`).
unsafe impl<H: Send + Sync, E: Send + Sync> Sync for Gate<H, E> {}

impl<H, E> Drop for Gate<H, E> {
   fn drop(&mut self) {
      if self.lock.is_loaded(Ordering::Acquire) {
         // SAFETY: loaded, and `&mut self` rules out concurrent readers.
         unsafe { self.handler.get_mut().assume_init_drop() };
      }
   }
}

impl<H: fmt::Debug, E> fmt::Debug for Gate<H, E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_struct("Gate");
      d.field("name", &self.name).field("state", &self.state());
      match self.get() {
         Some(handler) => d.field("handler", handler),
         None => d.field("handler", &format_args!("<unloaded>")),
      };
      d.finish()
   }
}
