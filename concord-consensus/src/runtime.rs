//! C6 — the node runtime.
//!
//! Owns the live `ConsensusEngine`, drains its outbound messages, and
//! re-enters the dispatcher directly for any message addressed to this
//! node itself rather than round-tripping it through the network —
//! grounded on `original_source/consensus_server.py::_deliver_outgoing`,
//! which special-cases `to_ip == self.ip`.

use std::time::Instant;

use slog::Logger;

use concord_core::clock::ElectionTimer;
use concord_core::config::Algorithm;

use crate::engine::{ConsensusEngine, EngineStatus, Outbound, ProposeAck};
use crate::log::Log;
use crate::message::{Address, Envelope, NodeId};
use crate::transaction::Accounts;

/// A message the runtime could not hand to anything local — the caller
/// (the transport layer, C7) is responsible for actually sending it over
/// the wire.
pub struct WireOut {
    pub envelope: Envelope,
}

pub struct NodeRuntime {
    pub id: NodeId,
    pub address: Address,
    pub peers: Vec<Address>,
    pub election_timer: ElectionTimer,
    engine: ConsensusEngine,
    logger: Logger,
}

impl NodeRuntime {
    pub fn new(
        id: NodeId,
        address: Address,
        peers: Vec<Address>,
        algorithm: Algorithm,
        election_timer: ElectionTimer,
        logger: Logger,
    ) -> NodeRuntime {
        let engine = ConsensusEngine::new(algorithm, id, address.clone(), peers.clone(), election_timer.clone(), logger.clone());
        NodeRuntime { id, address, peers, election_timer, engine, logger }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.engine.algorithm()
    }

    pub fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    pub fn log(&self) -> &Log {
        self.engine.log()
    }

    pub fn accounts(&self) -> &Accounts {
        self.engine.accounts()
    }

    /// Drains a batch of locally-produced outbound envelopes: anything
    /// addressed to `self.address` is re-fed into the engine immediately
    /// (and may itself produce further outbound messages, which are
    /// drained the same way); everything else is returned for the
    /// transport layer to actually send.
    fn drain(&mut self, mut pending: Outbound) -> Vec<WireOut> {
        let mut wire_out = Vec::new();
        while let Some(envelope) = pending.pop() {
            if envelope.to_ip == self.address {
                debug!(self.logger, "self-delivering envelope"; "message_type" => format!("{:?}", envelope.message_type));
                let more = self.engine.deliver(envelope);
                pending.extend(more);
            } else {
                wire_out.push(WireOut { envelope });
            }
        }
        wire_out
    }

    pub fn receive(&mut self, envelope: Envelope) -> Vec<WireOut> {
        if !self.engine.expects_messages_of(envelope.message_type) {
            warn!(self.logger, "dropping wrong-family frame"; "message_type" => format!("{:?}", envelope.message_type));
            return Vec::new();
        }
        let out = self.engine.deliver(envelope);
        self.drain(out)
    }

    pub fn propose(&mut self, payload: String) -> (Vec<WireOut>, ProposeAck) {
        let (out, ack) = self.engine.propose(payload);
        (self.drain(out), ack)
    }

    pub fn election_tick(&mut self, now: Instant) -> Vec<WireOut> {
        let out = self.engine.election_timeout(now);
        self.drain(out)
    }

    pub fn heartbeat_tick(&mut self) -> Vec<WireOut> {
        let out = self.engine.heartbeat_tick();
        self.drain(out)
    }

    pub fn retry_tick(&mut self, now: Instant) -> Vec<WireOut> {
        let out = self.engine.retry_tick(now);
        self.drain(out)
    }

    /// Swaps the live algorithm, discarding all in-memory consensus
    /// state (log, accounts, term, locks) per spec.md §5 — the two
    /// algorithms do not share state across a switch.
    pub fn switch_algorithm(&mut self, algorithm: Algorithm) {
        info!(self.logger, "switching algorithm"; "to" => algorithm.to_string());
        self.engine = ConsensusEngine::new(
            algorithm,
            self.id,
            self.address.clone(),
            self.peers.clone(),
            self.election_timer.clone(),
            self.logger.clone(),
        );
    }

    /// Resets the current algorithm's state to a fresh node, without
    /// changing which algorithm is active.
    pub fn reset(&mut self) {
        let algorithm = self.engine.algorithm();
        self.switch_algorithm(algorithm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::logger::get_root_logger;
    use std::time::Duration;

    fn runtime(algorithm: Algorithm) -> NodeRuntime {
        NodeRuntime::new(
            1,
            "node-1".to_string(),
            Vec::new(),
            algorithm,
            ElectionTimer::new(Duration::from_millis(50), Duration::from_millis(0)),
            get_root_logger(),
        )
    }

    #[test]
    fn single_node_raft_cluster_self_elects_and_commits() {
        let mut rt = runtime(Algorithm::Raft);
        let wire = rt.election_tick(Instant::now() + Duration::from_secs(1));
        assert!(wire.is_empty());
        let (wire, _ack) = rt.propose("DEPOSIT;A;25.00".to_string());
        assert!(wire.is_empty());
        assert_eq!(rt.accounts().balance("A"), crate::transaction::Amount(1_002_500));
    }

    #[test]
    fn switch_algorithm_resets_state() {
        let mut rt = runtime(Algorithm::Raft);
        rt.election_tick(Instant::now() + Duration::from_secs(1));
        rt.propose("DEPOSIT;A;25.00".to_string());
        rt.switch_algorithm(Algorithm::Paxos);
        assert_eq!(rt.accounts().balance("A"), crate::transaction::Amount(1_000_000));
        assert_eq!(rt.algorithm(), Algorithm::Paxos);
    }
}
