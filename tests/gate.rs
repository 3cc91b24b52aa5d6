use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lazy_router::{Gate, GateState, LoaderOptions, Module};
use tokio::sync::Notify;

type SharedError = Arc<io::Error>;

fn failure(message: &str) -> SharedError {
   Arc::new(io::Error::new(io::ErrorKind::Other, message.to_string()))
}

/// A factory that counts invocations and blocks until `release` is notified.
fn gated_factory(
   calls: &Arc<AtomicUsize>,
   release: &Arc<Notify>,
   value: &'static str,
) -> impl Fn() -> futures_util::future::BoxFuture<'static, Result<&'static str, SharedError>>
       + Send
       + Sync
       + 'static {
   let calls = Arc::clone(calls);
   let release = Arc::clone(release);
   move || {
      let calls = Arc::clone(&calls);
      let release = Arc::clone(&release);
      Box::pin(async move {
         calls.fetch_add(1, Ordering::SeqCst);
         release.notified().await;
         Ok(value)
      })
   }
}

async fn wait_for_state<H, E>(gate: &Gate<H, E>, state: GateState) {
   let reached = tokio::time::timeout(Duration::from_secs(5), async {
      while gate.state() != state {
         tokio::task::yield_now().await;
      }
   })
   .await;
   if reached.is_err() {
      panic!("gate never reached {state:?}, stuck at {:?}", gate.state());
   }
}

#[tokio::test(start_paused = true)]
async fn test_deferred_until_first_load() {
   let calls = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&calls);
   let gate = Gate::<&str, SharedError>::new("deferred", LoaderOptions::new(), move || {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Ok::<_, SharedError>("ready") }
   });

   tokio::time::sleep(Duration::from_millis(100)).await;
   assert_eq!(calls.load(Ordering::SeqCst), 0);
   assert_eq!(gate.state(), GateState::Unloaded);
   assert!(gate.get().is_none());

   assert_eq!(gate.load().await.unwrap(), &"ready");
   assert_eq!(calls.load(Ordering::SeqCst), 1);
   assert_eq!(gate.state(), GateState::Loaded);

   // Loaded gates never call the factory again.
   assert_eq!(gate.load().await.unwrap(), &"ready");
   assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_preload_without_request() {
   let calls = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&calls);
   let gate = Gate::<&str, SharedError>::new(
      "preloaded",
      LoaderOptions::new().with_preload(true),
      move || {
         counter.fetch_add(1, Ordering::SeqCst);
         async { Ok::<_, SharedError>("ready") }
      },
   );

   tokio::time::sleep(Duration::from_millis(100)).await;
   assert_eq!(calls.load(Ordering::SeqCst), 1);
   assert!(gate.is_loaded());

   assert_eq!(gate.load().await.unwrap(), &"ready");
   assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_explicit_preload_is_idempotent() {
   let calls = Arc::new(AtomicUsize::new(0));
   let release = Arc::new(Notify::new());
   let gate = Gate::<&str, SharedError>::new(
      "manual",
      LoaderOptions::new(),
      gated_factory(&calls, &release, "ready"),
   );

   gate.preload();
   wait_for_state(&gate, GateState::Loading).await;
   gate.preload();
   gate.preload();

   release.notify_one();
   assert_eq!(gate.load().await.unwrap(), &"ready");
   assert_eq!(calls.load(Ordering::SeqCst), 1);

   gate.preload();
   assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_share_one_invocation() {
   let calls = Arc::new(AtomicUsize::new(0));
   let release = Arc::new(Notify::new());
   let gate = Gate::<&str, SharedError>::new(
      "shared",
      LoaderOptions::new(),
      gated_factory(&calls, &release, "ready"),
   );

   let tasks: Vec<_> = (0..16)
      .map(|_| {
         let gate = Arc::clone(&gate);
         tokio::spawn(async move { *gate.load().await.unwrap() })
      })
      .collect();

   wait_for_state(&gate, GateState::Loading).await;
   tokio::time::sleep(Duration::from_millis(20)).await;
   release.notify_one();

   for task in tasks {
      assert_eq!(task.await.unwrap(), "ready");
   }
   assert_eq!(calls.load(Ordering::SeqCst), 1);
   assert_eq!(gate.state(), GateState::Loaded);
}

#[tokio::test]
async fn test_waiters_receive_identical_error() {
   let calls = Arc::new(AtomicUsize::new(0));
   let release = Arc::new(Notify::new());
   let error = failure("plugin missing");

   let gate = {
      let calls = Arc::clone(&calls);
      let release = Arc::clone(&release);
      let error = Arc::clone(&error);
      Gate::<&str, SharedError>::new("failing", LoaderOptions::new(), move || {
         let calls = Arc::clone(&calls);
         let release = Arc::clone(&release);
         let error = Arc::clone(&error);
         async move {
            calls.fetch_add(1, Ordering::SeqCst);
            release.notified().await;
            Err::<&str, _>(error)
         }
      })
   };

   let tasks: Vec<_> = (0..8)
      .map(|_| {
         let gate = Arc::clone(&gate);
         tokio::spawn(async move { gate.load().await.map(|handler| *handler) })
      })
      .collect();

   // Let every task park on the attempt before it resolves.
   for _ in 0..32 {
      tokio::task::yield_now().await;
   }
   assert_eq!(gate.state(), GateState::Loading);
   release.notify_one();

   for task in tasks {
      let err = task.await.unwrap().unwrap_err();
      assert!(Arc::ptr_eq(&err, &error));
      assert_eq!(err.to_string(), "plugin missing");
   }
   assert_eq!(calls.load(Ordering::SeqCst), 1);
   assert_eq!(gate.state(), GateState::Unloaded);
}

#[tokio::test]
async fn test_failure_is_retried_not_cached() {
   let calls = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&calls);
   let gate = Gate::<u32, SharedError>::new("flaky", LoaderOptions::new(), move || {
      let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
      async move {
         if attempt == 1 {
            Err(failure("first attempt fails"))
         } else {
            Ok(attempt as u32)
         }
      }
   });

   let err = gate.load().await.unwrap_err();
   assert_eq!(err.to_string(), "first attempt fails");
   assert_eq!(gate.state(), GateState::Unloaded);
   assert!(gate.get().is_none());

   assert_eq!(gate.load().await.unwrap(), &2);
   assert_eq!(calls.load(Ordering::SeqCst), 2);
   assert_eq!(gate.state(), GateState::Loaded);
}

#[tokio::test(start_paused = true)]
async fn test_failed_preload_leaves_gate_retryable() {
   let calls = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&calls);
   let gate = Gate::<&str, SharedError>::new(
      "preload-fails",
      LoaderOptions::new().with_preload(true),
      move || {
         let attempt = counter.fetch_add(1, Ordering::SeqCst);
         async move {
            if attempt == 0 {
               Err(failure("not yet"))
            } else {
               Ok("ready")
            }
         }
      },
   );

   tokio::time::sleep(Duration::from_millis(100)).await;
   assert_eq!(calls.load(Ordering::SeqCst), 1);
   assert_eq!(gate.state(), GateState::Unloaded);

   assert_eq!(gate.load().await.unwrap(), &"ready");
   assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_module_and_bare_handlers_are_equivalent() {
   let bare = Gate::<&str, SharedError>::new("bare", LoaderOptions::new(), || async {
      Ok::<_, SharedError>("status")
   });
   let wrapped = Gate::<&str, SharedError>::new("wrapped", LoaderOptions::new(), || async {
      Ok::<_, SharedError>(Module { default: "status" })
   });

   assert_eq!(bare.load().await.unwrap(), wrapped.load().await.unwrap());
   assert_eq!(bare.state(), wrapped.state());
}

#[tokio::test]
async fn test_cancelled_trigger_does_not_abandon_waiters() {
   let calls = Arc::new(AtomicUsize::new(0));
   let release = Arc::new(Notify::new());
   let gate = Gate::<&str, SharedError>::new(
      "cancel",
      LoaderOptions::new(),
      gated_factory(&calls, &release, "ready"),
   );

   let trigger = {
      let gate = Arc::clone(&gate);
      tokio::spawn(async move { *gate.load().await.unwrap() })
   };
   wait_for_state(&gate, GateState::Loading).await;
   trigger.abort();
   assert!(trigger.await.unwrap_err().is_cancelled());

   let waiter = {
      let gate = Arc::clone(&gate);
      tokio::spawn(async move { *gate.load().await.unwrap() })
   };
   tokio::task::yield_now().await;
   release.notify_one();

   assert_eq!(waiter.await.unwrap(), "ready");
   assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_factory_does_not_poison_gate() {
   let calls = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&calls);
   let gate = Gate::<&str, SharedError>::new("panics", LoaderOptions::new(), move || {
      let attempt = counter.fetch_add(1, Ordering::SeqCst);
      async move {
         if attempt == 0 {
            panic!("loader exploded");
         }
         Ok("ready")
      }
   });

   let first = {
      let gate = Arc::clone(&gate);
      tokio::spawn(async move { gate.load().await.map(|handler| *handler) })
   };
   let err = first.await.unwrap_err();
   assert!(err.is_panic());
   let message = err.into_panic();
   let message = message
      .downcast_ref::<String>()
      .expect("formatted panic message");
   assert!(message.contains("panics"));
   assert!(message.contains("loader exploded"));
   assert_eq!(gate.state(), GateState::Unloaded);

   assert_eq!(gate.load().await.unwrap(), &"ready");
   assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_gate_is_send_and_sync() {
   fn assert_send_sync<T: Send + Sync>() {}
   assert_send_sync::<Gate<String, SharedError>>();
   assert_send_sync::<Arc<Gate<Vec<u8>, String>>>();
}
