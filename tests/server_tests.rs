mod common;

use common::{connect, round_trip, start_app, test_config};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trellis::{App, Cookie, Method, Middleware, Next, Request, Response, ResponseClass, Result};

#[test]
fn test_static_route_get() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Get, "/ping", |_| Response::plain("pong"))
        .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n");

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Type").as_deref(), Some("text/plain"));
    assert_eq!(response.body_text(), "pong");
    assert_eq!(response.header("Connection").as_deref(), Some("keep-alive"));
    assert_eq!(response.header("Keep-Alive").as_deref(), Some("timeout=30"));

    app.stop();
}

#[test]
fn test_dynamic_route_binds_params() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Get, "/user/{id}/post/{post_id}", |ctx| {
        Response::plain(format!(
            "{}:{}",
            ctx.param("id").unwrap_or("?"),
            ctx.param("post_id").unwrap_or("?")
        ))
    })
    .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(
        &mut stream,
        b"GET /user/123/post/456 HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "123:456");

    app.stop();
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    app.route(Method::Get, "/count", move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Response::plain(n.to_string())
    })
    .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let first = round_trip(&mut stream, b"GET /count HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(first.body_text(), "1");
    let second = round_trip(&mut stream, b"GET /count HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(second.body_text(), "2");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    app.stop();
}

#[test]
fn test_connection_close_shuts_down_socket() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Get, "/bye", |_| Response::plain("bye"))
        .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(
        &mut stream,
        b"GET /bye HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.header("Connection").as_deref(), Some("close"));
    assert!(response.header("Keep-Alive").is_none());

    // the server closed its write half, so the next read reports EOF
    let mut tail = Vec::new();
    stream.read_to_end(&mut tail).unwrap();
    assert!(tail.is_empty());

    app.stop();
}

#[test]
fn test_not_found_plain_body() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Get, "/known", |_| Response::plain("ok"))
        .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 404);
    assert_eq!(response.body_text(), "Not found");
    assert_eq!(response.header("Content-Type").as_deref(), Some("text/plain"));

    // method mismatch is a 404 too
    let response = round_trip(&mut stream, b"POST /known HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 404);

    app.stop();
}

#[test]
fn test_not_found_json_body() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    let mut cfg = test_config(tmp.path());
    cfg.http.response_class = ResponseClass::Json;
    let addr = start_app(&app, cfg);

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /nothing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 404);
    assert_eq!(
        response.header("Content-Type").as_deref(),
        Some("application/json")
    );
    assert_eq!(response.body_text(), r#"{"message":"Not found"}"#);

    app.stop();
}

#[test]
fn test_redirect_coerces_status() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Get, "/old", |_| {
        Response::redirect_with_status("/other", 200)
    })
    .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /old HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 302);
    assert_eq!(response.header("Location").as_deref(), Some("/other"));
    assert_eq!(response.header("Content-Type").as_deref(), Some("text/plain"));
    assert!(response.body.is_empty());

    app.stop();
}

#[test]
fn test_chunked_streaming_response() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Get, "/events", |_| {
        Response::stream_with_content_type(
            |writer| {
                writer.send_chunk(b"first ")?;
                writer.send_chunk(b"second ")?;
                writer.send_chunk(b"third")
            },
            "text/event-stream",
        )
    })
    .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /events HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 200);
    assert_eq!(
        response.header("Transfer-Encoding").as_deref(),
        Some("chunked")
    );
    assert_eq!(
        response.header("Content-Type").as_deref(),
        Some("text/event-stream")
    );
    assert_eq!(response.header("Cache-Control").as_deref(), Some("no-cache"));
    assert_eq!(response.body_text(), "first second third");

    // the connection stays usable after a streamed response
    let again = round_trip(&mut stream, b"GET /events HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(again.body_text(), "first second third");

    app.stop();
}

#[test]
fn test_file_response_streams_with_etag() {
    let tmp = tempfile::tempdir().unwrap();
    let doc_root = tempfile::tempdir().unwrap();
    let path = doc_root.path().join("hello.txt");
    std::fs::write(&path, b"hello from disk").unwrap();

    let app = App::new();
    let served = path.clone();
    app.route(Method::Get, "/download", move |_| Response::file(&served))
        .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /download HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Type").as_deref(), Some("text/plain"));
    assert_eq!(
        response.header("Transfer-Encoding").as_deref(),
        Some("chunked")
    );
    let etag = response.header("ETag").expect("ETag header");
    assert!(etag.starts_with('"') && etag.ends_with('"'));
    assert_eq!(response.body_text(), "hello from disk");

    // missing file maps to a 404 from the same route shape
    std::fs::remove_file(&path).unwrap();
    let response = round_trip(&mut stream, b"GET /download HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 404);
    assert_eq!(response.body_text(), "File not found");

    app.stop();
}

#[test]
fn test_async_handler_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route_async(Method::Get, "/slow", |_| {
        // runs on its own coroutine, so a coroutine sleep suspends
        // without holding a worker thread
        may::coroutine::sleep(Duration::from_millis(10));
        Response::plain("done")
    })
    .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "done");

    app.stop();
}

#[test]
fn test_handler_panic_is_internal_error() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Get, "/boom", |_| panic!("secret detail"))
        .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 500);
    assert_eq!(response.body_text(), "Internal server error");

    // the connection survives the failed request
    let response = round_trip(&mut stream, b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 500);

    app.stop();
}

#[test]
fn test_response_cookies_on_the_wire() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Get, "/login", |_| {
        let mut response = Response::plain("ok");
        response
            .set_cookie(Cookie::new("session", "abc").http_only(true))
            .unwrap();
        response
            .set_cookie(Cookie::new("__Host-id", "1").secure(true))
            .unwrap();
        response
    })
    .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /login HTTP/1.1\r\nHost: x\r\n\r\n");

    let set_cookie_lines: Vec<&str> = response
        .head
        .lines()
        .filter(|l| l.to_ascii_lowercase().starts_with("set-cookie:"))
        .collect();
    assert_eq!(set_cookie_lines.len(), 2);
    assert!(set_cookie_lines[0].contains("session=abc"));
    assert!(set_cookie_lines[0].contains("; HttpOnly"));
    let host_line = set_cookie_lines[1];
    assert!(host_line.contains("__Host-id=1"));
    assert!(host_line.contains("; Secure"));
    assert!(host_line.contains("; Path=/"));
    assert!(!host_line.contains("; Domain="));

    app.stop();
}

#[test]
fn test_multipart_upload_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Post, "/upload", |mut ctx| {
        match ctx.file("f") {
            Some(file) => Response::json(serde_json::json!({
                "name": file.name(),
                "size": file.size(),
                "in_memory": file.in_memory_storage(),
            })),
            None => Response::plain("no file").with_status(400),
        }
    })
    .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let body = b"--b\r\n\
        Content-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        hello\r\n\
        --b--\r\n";
    let request = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=b\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut raw = request.into_bytes();
    raw.extend_from_slice(body);

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, &raw);
    assert_eq!(response.status, 200);
    let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(parsed["name"], "a.txt");
    assert_eq!(parsed["size"], 5);

    app.stop();

    // both spill kinds are request-scoped and must be gone afterwards
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("upload-") || n.starts_with("trellis_tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");
}

#[test]
fn test_multipart_without_content_length_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Post, "/upload", |_| Response::plain("unreachable"))
        .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(
        &mut stream,
        b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=b\r\n\r\n",
    );
    assert_eq!(response.status, 400);
    assert_eq!(response.body_text(), "Bad request");

    app.stop();
}

struct TagMiddleware {
    log: Arc<std::sync::Mutex<Vec<String>>>,
    label: &'static str,
}

impl Middleware for TagMiddleware {
    fn handle(&self, request: &Request, next: Next<'_>) -> Result<Response> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}>{}", self.label, request.path()));
        let mut response = next.run(request)?;
        response.headers.insert("X-Tag", self.label);
        Ok(response)
    }
}

#[test]
fn test_middleware_runs_and_freezes_at_start() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    app.route(Method::Get, "/mw", |_| Response::plain("inner"))
        .unwrap();
    app.add_middleware(Arc::new(TagMiddleware {
        log: Arc::clone(&log),
        label: "outer",
    }))
    .unwrap();
    app.add_middleware(Arc::new(TagMiddleware {
        log: Arc::clone(&log),
        label: "inner",
    }))
    .unwrap();

    let addr = start_app(&app, test_config(tmp.path()));

    // the order froze at start
    assert!(app
        .add_middleware(Arc::new(TagMiddleware {
            log: Arc::clone(&log),
            label: "late",
        }))
        .is_err());
    assert!(app.route(Method::Get, "/late", |_| Response::plain("no")).is_err());

    let mut stream = connect(addr);
    let response = round_trip(&mut stream, b"GET /mw HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.body_text(), "inner");
    // the last middleware to touch the response is the outermost one
    assert_eq!(response.header("X-Tag").as_deref(), Some("outer"));
    assert_eq!(*log.lock().unwrap(), vec!["outer>/mw", "inner>/mw"]);

    app.stop();
}

#[test]
fn test_request_body_reaches_handler() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Post, "/echo", |ctx| {
        Response::plain(format!(
            "{}:{}",
            ctx.request().body().len(),
            String::from_utf8_lossy(ctx.request().body())
        ))
    })
    .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "11:hello world");

    // the connection is reusable right after a request with a body
    let response = round_trip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nok",
    );
    assert_eq!(response.body_text(), "2:ok");

    app.stop();
}

#[test]
fn test_request_body_split_across_writes() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Post, "/echo", |ctx| {
        Response::plain(String::from_utf8_lossy(ctx.request().body()).into_owned())
    })
    .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nCon")
        .unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    stream.write_all(b"tent-Length: 8\r\n\r\nfour").unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    stream.write_all(b"four").unwrap();
    stream.flush().unwrap();

    let response = common::read_response(&mut stream);
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "fourfour");

    app.stop();
}

#[test]
fn test_oversized_body_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Post, "/echo", |_| Response::plain("unreachable"))
        .unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.server.max_request_size = 64;
    let addr = start_app(&app, cfg);

    let mut stream = connect(addr);
    let response = round_trip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 1000\r\n\r\n",
    );
    assert_eq!(response.status, 400);
    assert_eq!(response.body_text(), "Bad request");

    app.stop();
}

#[test]
fn test_invalid_content_length_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Post, "/echo", |_| Response::plain("unreachable"))
        .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    let response = round_trip(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: banana\r\n\r\n",
    );
    assert_eq!(response.status, 400);

    app.stop();
}

#[test]
fn test_graceful_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    app.route(Method::Get, "/ping", |_| Response::plain("pong"))
        .unwrap();
    let addr = start_app(&app, test_config(tmp.path()));
    assert!(app.is_running());

    let stopper = app.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        stopper.stop();
        // a second stop is a no-op
        stopper.stop();
    });

    app.wait();
    handle.join().unwrap();

    assert!(!app.is_running());
    assert!(app.local_addr().is_none());

    // the listening socket is gone
    std::thread::sleep(Duration::from_millis(50));
    assert!(TcpStream::connect(addr).is_err());

    // no spill files remain under the temp dir
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("upload-") || n.starts_with("trellis_tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_wait_returns_only_after_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    let _addr = start_app(&app, test_config(tmp.path()));

    let waiter = app.clone();
    let waited = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&waited);
    let handle = std::thread::spawn(move || {
        waiter.wait();
        flag.store(1, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(waited.load(Ordering::SeqCst), 0, "wait returned early");

    app.stop();
    handle.join().unwrap();
    assert_eq!(waited.load(Ordering::SeqCst), 1);
}

#[test]
fn test_malformed_request_gets_bad_request() {
    let tmp = tempfile::tempdir().unwrap();
    let app = App::new();
    let addr = start_app(&app, test_config(tmp.path()));

    let mut stream = connect(addr);
    stream
        .write_all(b"NOT A REQUEST AT ALL\r\n\r\n")
        .unwrap();
    let response = common::read_response(&mut stream);
    assert_eq!(response.status, 400);
    assert_eq!(response.body_text(), "Bad request");

    app.stop();
}
