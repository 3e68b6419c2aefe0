//! C7 — peer-to-peer transport.
//!
//! Wire framing is a 4-byte big-endian length prefix plus a JSON body, via
//! `tokio_util::codec::LengthDelimitedCodec` + `tokio_serde`'s JSON codec,
//! per spec.md §6. One outbound TCP connection is opened per send (no
//! connection pooling) and one task accepts inbound connections, matching
//! `josefine-broker/src/server.rs`'s accept-loop shape.

use std::pin::Pin;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_serde::formats::Json;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use concord_consensus::message::Envelope;
use concord_core::error::Result;

use slog::Logger;

type InFramed = tokio_serde::Framed<
    FramedRead<TcpStream, LengthDelimitedCodec>,
    Envelope,
    Envelope,
    Json<Envelope, Envelope>,
>;

type OutFramed = tokio_serde::Framed<
    FramedWrite<TcpStream, LengthDelimitedCodec>,
    Envelope,
    Envelope,
    Json<Envelope, Envelope>,
>;

/// Opens a fresh connection to `address`, writes one envelope, and drops
/// the connection. Connection failures (peer down, network partition) are
/// logged and swallowed — a dropped message is exactly what spec.md §7's
/// Non-goals say to expect from an unreliable link.
pub async fn send_envelope(address: &str, envelope: Envelope, logger: &Logger) {
    match try_send(address, envelope).await {
        Ok(()) => {}
        Err(e) => debug!(logger, "send failed, dropping envelope"; "to" => address, "error" => e.to_string()),
    }
}

async fn try_send(address: &str, envelope: Envelope) -> Result<()> {
    let stream = TcpStream::connect(address).await?;
    let framed_writer = FramedWrite::new(stream, LengthDelimitedCodec::new());
    let mut framed: OutFramed = tokio_serde::Framed::new(framed_writer, Json::default());
    Pin::new(&mut framed).send(envelope).await.map_err(|e| {
        concord_core::error::ConcordError::Protocol(format!("write failed: {}", e))
    })?;
    Ok(())
}

/// Runs the inbound accept loop forever, handing every successfully
/// decoded envelope to `inbound_tx`. Each connection is served on its own
/// task; a malformed frame on one connection never affects another.
pub async fn run_accept_loop(listener: TcpListener, inbound_tx: mpsc::Sender<Envelope>, logger: Logger) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(logger, "accept failed"; "error" => e.to_string());
                continue;
            }
        };
        let tx = inbound_tx.clone();
        let conn_logger = logger.new(slog::o!("peer" => peer_addr.to_string()));
        tokio::spawn(async move {
            serve_connection(stream, tx, conn_logger).await;
        });
    }
}

async fn serve_connection(stream: TcpStream, inbound_tx: mpsc::Sender<Envelope>, logger: Logger) {
    let framed_reader = FramedRead::new(stream, LengthDelimitedCodec::new());
    let mut framed: InFramed = tokio_serde::Framed::new(framed_reader, Json::default());
    while let Some(result) = framed.next().await {
        match result {
            Ok(envelope) => {
                if inbound_tx.send(envelope).await.is_err() {
                    debug!(logger, "runtime channel closed, dropping connection");
                    break;
                }
            }
            Err(e) => {
                warn!(logger, "malformed frame, closing connection"; "error" => e.to_string());
                break;
            }
        }
    }
}
