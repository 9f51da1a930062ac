//! Status/admin HTTP server (synchronous, own thread)
//!
//! Serves liveness/readiness probes and the Prometheus scrape endpoint on a
//! separate listener so operational traffic never competes with the RESP
//! port. The protocol surface is three GET paths; anything fancier belongs
//! behind a real reverse proxy.

use crate::config::StatusConfig;
use crate::metrics;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};

/// Grace period for in-flight requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
/// Accept-poll interval while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Status server state
pub struct StatusServer {
    ready: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
}

/// One rendered HTTP response.
struct HttpReply {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl HttpReply {
    fn json(status: u16, body: &str) -> HttpReply {
        HttpReply {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    fn text(status: u16, body: &str) -> HttpReply {
        HttpReply {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }

    fn write_to(self, stream: &mut TcpStream) -> std::io::Result<()> {
        write!(
            stream,
            "HTTP/1.1 {} {}\r\n",
            self.status,
            reason_phrase(self.status)
        )?;
        write!(stream, "Content-Type: {}\r\n", self.content_type)?;
        write!(stream, "Content-Length: {}\r\n", self.body.len())?;
        stream.write_all(b"Connection: close\r\n\r\n")?;
        stream.write_all(self.body.as_bytes())?;
        stream.flush()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        503 => "Service Unavailable",
        _ => "",
    }
}

impl StatusServer {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            running: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Set the ready state
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Immediate stop: the accept loop exits on its next pass.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Graceful stop: signal the loop, then wait up to the grace deadline
    /// for it to finish its in-flight request before giving up.
    pub fn graceful_stop(&self) {
        self.stop();
        let deadline = std::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.stopped.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if !self.stopped.load(Ordering::SeqCst) {
            info!("status server did not stop within grace period, abandoning");
        }
    }

    /// Run the status listener (blocking; call from a dedicated thread).
    pub fn run(&self, config: &StatusConfig) -> std::io::Result<()> {
        let listener = TcpListener::bind(&config.listen)?;
        listener.set_nonblocking(true)?;
        info!(addr = %config.listen, "status server listening");

        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.handle_request(stream) {
                        error!(error = %err, "status request failed");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => error!(error = %err, "status accept failed"),
            }
        }

        self.stopped.store(true, Ordering::SeqCst);
        info!("status server stopped");
        Ok(())
    }

    /// Read the request line and answer it. Headers and body, if any, are
    /// irrelevant to every endpoint served here and are not read.
    fn handle_request(&self, mut stream: TcpStream) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;

        let mut request_line = String::new();
        BufReader::new(&stream).read_line(&mut request_line)?;

        let mut parts = request_line.split_whitespace();
        let reply = match (parts.next(), parts.next()) {
            (Some("GET"), Some(path)) => self.route(path),
            (Some(_), Some(_)) => HttpReply::text(405, "only GET is served here"),
            _ => HttpReply::text(400, "malformed request line"),
        };
        reply.write_to(&mut stream)
    }

    fn route(&self, path: &str) -> HttpReply {
        match path {
            "/health" => HttpReply::json(200, r#"{"status":"up"}"#),
            "/ready" if self.is_ready() => HttpReply::json(200, r#"{"ready":true}"#),
            "/ready" => HttpReply::json(503, r#"{"ready":false}"#),
            "/metrics" => HttpReply {
                status: 200,
                content_type: "text/plain; version=0.0.4",
                body: metrics::global().gather(),
            },
            _ => HttpReply::text(404, "no such endpoint"),
        }
    }
}

impl Default for StatusServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state() {
        let server = StatusServer::new();
        assert!(!server.is_ready());
        server.set_ready(true);
        assert!(server.is_ready());
        server.set_ready(false);
        assert!(!server.is_ready());
    }

    #[test]
    fn test_route_status_codes() {
        let server = StatusServer::new();
        assert_eq!(server.route("/health").status, 200);
        assert_eq!(server.route("/ready").status, 503);
        server.set_ready(true);
        assert_eq!(server.route("/ready").status, 200);
        assert_eq!(server.route("/metrics").status, 200);
        assert_eq!(server.route("/nope").status, 404);
    }

    #[test]
    fn test_reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(503), "Service Unavailable");
        assert_eq!(reason_phrase(599), "");
    }

    #[test]
    fn test_graceful_stop_without_run() {
        let server = StatusServer::new();
        // never started; the grace loop just times out
        server.graceful_stop();
        assert!(!server.running.load(Ordering::SeqCst));
    }
}
