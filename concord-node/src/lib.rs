//! C7 — the node binary's library half: wires the transport-agnostic
//! consensus engines (`concord-consensus`) to a TCP peer transport and an
//! HTTP façade, and owns the single actor task that drives the runtime.
//!
//! The actor shape — one task owning all mutable state, driven by an
//! `mpsc` command channel inside `tokio::select!` — is grounded on
//! `josefine-raft/src/fsm.rs`'s `Driver` and `josefine-broker/src/server.rs`'s
//! accept-loop-plus-actor split.

#[macro_use]
extern crate slog;

pub mod http;
pub mod tcp;

use std::time::{Duration, Instant};

use slog::Logger;
use tokio::sync::{mpsc, oneshot};

use concord_consensus::clock::{heartbeat_interval, ElectionTimer};
use concord_consensus::engine::{EngineStatus, ProposeAck};
use concord_consensus::log::LogEntry;
use concord_consensus::message::Envelope;
use concord_consensus::runtime::NodeRuntime;
use concord_consensus::transaction::Accounts;
use concord_core::config::{Algorithm, NodeConfig};

/// Commands the HTTP façade and TCP transport send into the runtime
/// actor. Every variant that needs a reply carries a `oneshot::Sender`.
pub enum Command {
    Inbound(Envelope),
    Propose(String, oneshot::Sender<ProposeAck>),
    Status(oneshot::Sender<EngineStatus>),
    Log(oneshot::Sender<Vec<LogEntry>>),
    Accounts(oneshot::Sender<Accounts>),
    SwitchAlgorithm(Algorithm, oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
}

/// A cheaply-cloneable front door onto the runtime actor. Both the HTTP
/// façade and the TCP accept loop hold one of these; neither ever touches
/// `NodeRuntime` directly.
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    pub async fn deliver_inbound(&self, envelope: Envelope) {
        let _ = self.cmd_tx.send(Command::Inbound(envelope)).await;
    }

    pub async fn propose(&self, payload: String) -> Option<ProposeAck> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Propose(payload, tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn status(&self) -> Option<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Status(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn log(&self) -> Option<Vec<LogEntry>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Log(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn accounts(&self) -> Option<Accounts> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Accounts(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn switch_algorithm(&self, algorithm: Algorithm) -> Option<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::SwitchAlgorithm(algorithm, tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn reset(&self) -> Option<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Reset(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// Builds the runtime, its command channel, and the handle, but does not
/// yet spawn anything — the caller (`main`) decides how to spawn the
/// returned future alongside the transport tasks.
pub fn build_node(config: &NodeConfig, logger: Logger) -> (NodeHandle, impl std::future::Future<Output = ()>) {
    let peers: Vec<String> = config.peers.iter().map(|p| p.address()).collect();
    let election_timer = ElectionTimer::new(Duration::from_millis(2000), Duration::from_millis(1000));
    let runtime = NodeRuntime::new(
        config.node_id,
        format!("{}:{}", config.node_ip, config.tcp_port),
        peers,
        config.algorithm,
        election_timer,
        logger.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let handle = NodeHandle { cmd_tx };
    let task = run_actor(runtime, cmd_rx, logger);
    (handle, task)
}

/// The runtime actor: owns `NodeRuntime` exclusively, drains every
/// outbound envelope it produces onto the TCP transport, and ticks
/// election/heartbeat/retry timers.
async fn run_actor(mut runtime: NodeRuntime, mut cmd_rx: mpsc::Receiver<Command>, logger: Logger) {
    let election_tick_period = Duration::from_millis(50);
    let heartbeat_period = heartbeat_interval(Duration::from_millis(2000));

    let mut election_ticker = tokio::time::interval(election_tick_period);
    let mut heartbeat_ticker = tokio::time::interval(heartbeat_period);
    let mut retry_ticker = tokio::time::interval(Duration::from_millis(150));

    loop {
        let wire_out = tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(Command::Inbound(envelope)) => runtime.receive(envelope),
                    Some(Command::Propose(payload, reply)) => {
                        let (wire, ack) = runtime.propose(payload);
                        let _ = reply.send(ack);
                        wire
                    }
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(runtime.status());
                        Vec::new()
                    }
                    Some(Command::Log(reply)) => {
                        let _ = reply.send(runtime.log().entries.clone());
                        Vec::new()
                    }
                    Some(Command::Accounts(reply)) => {
                        let _ = reply.send(runtime.accounts().clone());
                        Vec::new()
                    }
                    Some(Command::SwitchAlgorithm(algorithm, reply)) => {
                        runtime.switch_algorithm(algorithm);
                        let _ = reply.send(());
                        Vec::new()
                    }
                    Some(Command::Reset(reply)) => {
                        runtime.reset();
                        let _ = reply.send(());
                        Vec::new()
                    }
                    None => {
                        info!(logger, "command channel closed, shutting down node actor");
                        return;
                    }
                }
            }
            _ = election_ticker.tick() => runtime.election_tick(Instant::now()),
            _ = heartbeat_ticker.tick() => runtime.heartbeat_tick(),
            _ = retry_ticker.tick() => runtime.retry_tick(Instant::now()),
        };

        for out in wire_out {
            let to = out.envelope.to_ip.clone();
            let logger = logger.clone();
            tokio::spawn(async move {
                tcp::send_envelope(&to, out.envelope, &logger).await;
            });
        }
    }
}
