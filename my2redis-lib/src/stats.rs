//! Sync counters and the stats HTTP endpoint
//!
//! The counters are owned by the `River` aggregate and shared by reference;
//! there is no global registry. The HTTP server exposes them as plain text
//! on `GET /stat` plus a `/health` probe.

use crate::error::{Result, RiverError};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Monotone counters of applied row operations
#[derive(Debug, Default)]
pub struct Stats {
    insert_num: AtomicU64,
    update_num: AtomicU64,
    delete_num: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr_insert(&self) {
        self.insert_num.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_update(&self) {
        self.update_num.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_delete(&self) {
        self.delete_num.fetch_add(1, Ordering::Relaxed);
    }

    pub fn insert_num(&self) -> u64 {
        self.insert_num.load(Ordering::Relaxed)
    }

    pub fn update_num(&self) -> u64 {
        self.update_num.load(Ordering::Relaxed)
    }

    pub fn delete_num(&self) -> u64 {
        self.delete_num.load(Ordering::Relaxed)
    }

    /// Plain-text rendering served on the stat endpoint.
    pub fn render(&self) -> String {
        format!(
            "insert_num: {}\nupdate_num: {}\ndelete_num: {}\n",
            self.insert_num(),
            self.update_num(),
            self.delete_num()
        )
    }
}

/// HTTP server exposing the counters
pub struct StatServer {
    addr: String,
    stats: Arc<Stats>,
    token: CancellationToken,
}

impl StatServer {
    pub fn new<S: Into<String>>(addr: S, stats: Arc<Stats>, token: CancellationToken) -> Self {
        Self {
            addr: addr.into(),
            stats,
            token,
        }
    }

    /// Serve until the pipeline is cancelled.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| RiverError::config(format!("failed to bind stat_addr {}: {}", self.addr, e)))?;

        info!("stat server listening on http://{}", self.addr);

        loop {
            let (stream, _) = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };

            let io = TokioIo::new(stream);
            let stats = self.stats.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| stat_handler(req, stats.clone()));
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    if !err.is_incomplete_message() {
                        error!("error serving stat connection: {:?}", err);
                    }
                }
            });
        }
    }
}

async fn stat_handler(
    req: Request<hyper::body::Incoming>,
    stats: Arc<Stats>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/stat") => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(stats.render())))
            .unwrap()),

        (&hyper::Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(r#"{"status":"healthy"}"#)))
            .unwrap()),

        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap()),
    }
}
