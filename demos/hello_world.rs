//! Minimal server: a static route, a parameterized route and a JSON route.
//!
//! ```bash
//! cargo run --example hello_world
//! curl http://127.0.0.1:8080/ping
//! curl http://127.0.0.1:8080/user/42
//! ```

use trellis::{App, AppConfig, Method, Response};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app = App::new();

    app.route(Method::Get, "/ping", |_| Response::plain("pong"))
        .expect("register /ping");

    app.route(Method::Get, "/user/{id}", |ctx| {
        Response::json(serde_json::json!({
            "id": ctx.param("id"),
            "from": ctx.request().client().remote_addr(),
        }))
    })
    .expect("register /user/{id}");

    app.dump_routes();

    app.start(AppConfig::default()).expect("server start");
    app.wait();
}
