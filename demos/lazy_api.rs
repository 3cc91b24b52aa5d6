//! Serves two lazily built routers.
//!
//! `/reports` is built on its first request, `/admin` is preloaded when
//! `LAZY_ROUTER__PRELOAD=true`. Try:
//!
//! ```sh
//! RUST_LOG=lazy_router=debug cargo run --example lazy_api
//! curl localhost:3000/reports/daily
//! ```

use std::time::Duration;

use axum::error_handling::HandleError;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use lazy_router::{LazyLoader, LoaderOptions, Module};
use serde_json::json;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type LoadError = std::sync::Arc<str>;

async fn load_failed(err: LoadError) -> (StatusCode, Json<serde_json::Value>) {
   (
      StatusCode::SERVICE_UNAVAILABLE,
      Json(json!({ "ok": false, "error": err.to_string() })),
   )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
   tracing_subscriber::registry()
      .with(
         tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,lazy_router=debug".into()),
      )
      .with(tracing_subscriber::fmt::layer())
      .init();

   let loader = LazyLoader::new(LoaderOptions::load()?);
   tracing::info!(preload = loader.options().preload, "mounting lazy routers");

   let reports = LazyLoader::new(LoaderOptions::new()).lazy("reports", || async {
      // Stands in for loading a plugin or warming a cache.
      tokio::time::sleep(Duration::from_millis(500)).await;
      Ok::<_, LoadError>(Router::new().route("/daily", get(|| async { Json(json!({ "ok": true })) })))
   });

   let admin = loader.lazy("admin", || async {
      tokio::time::sleep(Duration::from_millis(200)).await;
      Ok::<_, LoadError>(Module {
         default: Router::new().route("/status", get(|| async { Json(json!({ "ok": true })) })),
      })
   });

   let app = Router::new()
      .route("/health", get(|| async { "ok" }))
      .nest_service("/reports", HandleError::new(reports, load_failed))
      .nest_service("/admin", HandleError::new(admin, load_failed));

   let listener = TcpListener::bind("127.0.0.1:3000").await?;
   tracing::info!(addr = %listener.local_addr()?, "listening");
   axum::serve(listener, app).await?;
   Ok(())
}
