//! File uploads and streaming downloads.
//!
//! ```bash
//! cargo run --example uploads
//! curl -F "report=@notes.txt" http://127.0.0.1:8080/upload
//! curl http://127.0.0.1:8080/events
//! ```

use std::sync::Arc;
use std::time::Duration;
use trellis::{App, AppConfig, Method, Middleware, Next, Request, Response, Result};

/// Logs every request with its latency.
struct AccessLog;

impl Middleware for AccessLog {
    fn handle(&self, request: &Request, next: Next<'_>) -> Result<Response> {
        let started = std::time::Instant::now();
        let response = next.run(request)?;
        tracing::info!(
            method = %request.method(),
            uri = request.uri(),
            status = response.status,
            elapsed_us = started.elapsed().as_micros() as u64,
            "request served"
        );
        Ok(response)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app = App::new();
    app.add_middleware(Arc::new(AccessLog)).expect("middleware");

    app.route(Method::Post, "/upload", |mut ctx| {
        match ctx.file("report") {
            Some(file) => Response::json(serde_json::json!({
                "name": file.name(),
                "content_type": file.content_type(),
                "size": file.size(),
                "spilled_to_disk": !file.in_memory_storage(),
            })),
            None => Response::plain("expected a \"report\" file field").with_status(400),
        }
    })
    .expect("register /upload");

    // runs on its own coroutine, free to pace itself
    app.route_async(Method::Get, "/events", |_| {
        Response::stream_with_content_type(
            |writer| {
                for i in 0..5 {
                    writer.send_chunk(format!("event {i}\n").as_bytes())?;
                    may::coroutine::sleep(Duration::from_millis(200));
                }
                Ok(())
            },
            "text/plain",
        )
    })
    .expect("register /events");

    app.start(AppConfig::default()).expect("server start");
    app.wait();
}
