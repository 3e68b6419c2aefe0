//! C7 — the HTTP façade.
//!
//! Hand-rolled HTTP/1.1 over a raw `tokio::net::TcpListener`, grounded on
//! `original_source/consensus_server.py`'s own hand-rolled
//! `handle_http_request` (read request line, read headers for
//! `Content-Length`, read exactly that many body bytes, dispatch by
//! method+path). `josefine-core`'s declared `iron`/`router` dependency is
//! not used here — see DESIGN.md for why.

use slog::Logger;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use concord_consensus::engine::ProposeAck;
use concord_consensus::raft::ProposeOutcome;
use concord_core::config::Algorithm;

use crate::NodeHandle;

struct Request {
    method: String,
    path: String,
    body: String,
}

pub async fn run_http_loop(listener: TcpListener, handle: NodeHandle, logger: Logger) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(logger, "http accept failed"; "error" => e.to_string());
                continue;
            }
        };
        let handle = handle.clone();
        let conn_logger = logger.new(slog::o!("http_peer" => peer_addr.to_string()));
        tokio::spawn(async move {
            if let Err(e) = serve(stream, handle).await {
                debug!(conn_logger, "http connection ended"; "error" => e.to_string());
            }
        });
    }
}

async fn serve(stream: TcpStream, handle: NodeHandle) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let request = match read_request(&mut reader).await? {
        Some(r) => r,
        None => return Ok(()),
    };

    let (status, content_type, body) = route(&request, &handle).await;
    let stream = reader.into_inner();
    write_response(stream, status, content_type, &body).await
}

async fn read_request<S: tokio::io::AsyncRead + Unpin>(reader: &mut BufReader<S>) -> std::io::Result<Option<Request>> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("/").to_string();
    if method.is_empty() {
        return Ok(None);
    }

    let mut content_length: usize = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(Some(Request {
        method,
        path,
        body: String::from_utf8_lossy(&body).to_string(),
    }))
}

/// Dispatches a parsed request to the node runtime via `NodeHandle`, per
/// the route table in spec.md §6.
async fn route(request: &Request, handle: &NodeHandle) -> (u16, &'static str, String) {
    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => (204, "text/plain", String::new()),
        ("GET", "/status") => match handle.status().await {
            Some(status) => (200, "application/json", serde_json::to_string(&status).unwrap_or_default()),
            None => (503, "text/plain", "node actor unavailable".to_string()),
        },
        ("GET", "/log") => match handle.log().await {
            Some(log) => (200, "application/json", serde_json::to_string(&log).unwrap_or_default()),
            None => (503, "text/plain", "node actor unavailable".to_string()),
        },
        ("GET", "/accounts") => match handle.accounts().await {
            Some(accounts) => (200, "application/json", serde_json::to_string(&accounts).unwrap_or_default()),
            None => (503, "text/plain", "node actor unavailable".to_string()),
        },
        ("POST", "/propose") => {
            let payload = request.body.trim().to_string();
            if payload.is_empty() {
                return (400, "text/plain", "empty proposal body".to_string());
            }
            match handle.propose(payload).await {
                Some(ack) => propose_response(ack),
                None => (503, "text/plain", "node actor unavailable".to_string()),
            }
        }
        ("POST", "/switch_algorithm") => {
            let requested: Result<Algorithm, _> = request.body.trim().parse();
            match requested {
                Ok(algorithm) => match handle.switch_algorithm(algorithm).await {
                    Some(()) => (200, "application/json", serde_json::json!({ "algorithm": algorithm.to_string() }).to_string()),
                    None => (503, "text/plain", "node actor unavailable".to_string()),
                },
                Err(e) => (400, "text/plain", e.to_string()),
            }
        }
        ("POST", "/reset") => match handle.reset().await {
            Some(()) => (200, "application/json", serde_json::json!({ "reset": true }).to_string()),
            None => (503, "text/plain", "node actor unavailable".to_string()),
        },
        _ => (404, "text/plain", "not found".to_string()),
    }
}

/// Shapes a propose acknowledgement into spec.md §6's exact response
/// contract: `{success, new_state}` once committed locally, or
/// `{success: false, leader}` when a Raft node redirects the caller
/// to the node it believes holds leadership.
fn propose_response(ack: ProposeAck) -> (u16, &'static str, String) {
    match ack {
        ProposeAck::Raft(ProposeOutcome::Appended { index, term }) => (
            202,
            "application/json",
            serde_json::json!({ "success": true, "new_state": { "index": index, "term": term } }).to_string(),
        ),
        ProposeAck::Raft(ProposeOutcome::NotLeader { leader_hint }) => (
            409,
            "application/json",
            serde_json::json!({ "success": false, "leader": leader_hint }).to_string(),
        ),
        ProposeAck::Paxos => (202, "application/json", serde_json::json!({ "success": true }).to_string()),
    }
}

async fn write_response(mut stream: TcpStream, status: u16, content_type: &str, body: &str) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        503 => "Service Unavailable",
        _ => "Unknown",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        reason,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
