//! C6 (algorithm half) — a single dispatch surface over whichever
//! consensus algorithm a node is currently configured to run, per
//! spec.md §5. Grounded on `original_source/consensus_server.py`'s
//! `_initialize_node`, which picks one of the two node classes by
//! config and treats them uniformly from then on.

use std::time::Instant;

use slog::Logger;

use concord_core::clock::ElectionTimer;
use concord_core::config::Algorithm;

use crate::log::Log;
use crate::message::{Address, Envelope, MessageType, NodeId};
use crate::paxos::{Paxos, PaxosInput, PaxosStatus};
use crate::raft::{ProposeOutcome, RaftHandle, RaftInput, RaftStatus};
use crate::transaction::Accounts;

pub type Outbound = Vec<Envelope>;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum EngineStatus {
    Raft(RaftStatus),
    Paxos(PaxosStatus),
}

/// Unifies `RaftHandle` and `Paxos` behind one surface the node runtime
/// drives without caring which algorithm is live.
pub enum ConsensusEngine {
    Raft(RaftHandle),
    Paxos(Paxos),
}

impl ConsensusEngine {
    pub fn new(
        algorithm: Algorithm,
        id: NodeId,
        address: Address,
        peers: Vec<Address>,
        election_timer: ElectionTimer,
        logger: Logger,
    ) -> ConsensusEngine {
        match algorithm {
            Algorithm::Raft => ConsensusEngine::Raft(RaftHandle::new(id, address, peers, election_timer, logger)),
            Algorithm::Paxos => ConsensusEngine::Paxos(Paxos::new(id, address, peers, logger)),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            ConsensusEngine::Raft(_) => Algorithm::Raft,
            ConsensusEngine::Paxos(_) => Algorithm::Paxos,
        }
    }

    pub fn status(&self) -> EngineStatus {
        match self {
            ConsensusEngine::Raft(r) => EngineStatus::Raft(r.status()),
            ConsensusEngine::Paxos(p) => EngineStatus::Paxos(p.status()),
        }
    }

    pub fn log(&self) -> &Log {
        match self {
            ConsensusEngine::Raft(r) => r.log(),
            ConsensusEngine::Paxos(p) => &p.log,
        }
    }

    pub fn accounts(&self) -> &Accounts {
        match self {
            ConsensusEngine::Raft(r) => r.accounts(),
            ConsensusEngine::Paxos(p) => &p.accounts,
        }
    }

    /// Drops frames from the wrong message family rather than feeding them
    /// to an engine that wouldn't understand them, per spec.md §5's
    /// cross-family isolation requirement.
    pub fn deliver(&mut self, msg: Envelope) -> Outbound {
        match self {
            ConsensusEngine::Raft(_) if msg.message_type.is_paxos() => Vec::new(),
            ConsensusEngine::Paxos(_) if msg.message_type.is_raft() => Vec::new(),
            ConsensusEngine::Raft(handle) => {
                let (next, out) = std::mem::replace(handle, placeholder_raft()).apply(RaftInput::Message(msg));
                *handle = next;
                out
            }
            ConsensusEngine::Paxos(p) => p.apply(PaxosInput::Message(msg)),
        }
    }

    pub fn propose(&mut self, payload: String) -> (Outbound, ProposeAck) {
        match self {
            ConsensusEngine::Raft(handle) => {
                let (next, out, outcome) = std::mem::replace(handle, placeholder_raft()).propose(payload);
                *handle = next;
                (out, ProposeAck::Raft(outcome))
            }
            ConsensusEngine::Paxos(p) => {
                let out = p.apply(PaxosInput::ClientPropose(payload));
                (out, ProposeAck::Paxos)
            }
        }
    }

    pub fn election_timeout(&mut self, now: Instant) -> Outbound {
        match self {
            ConsensusEngine::Raft(handle) if handle.needs_election(now) => {
                let (next, out) = std::mem::replace(handle, placeholder_raft()).apply(RaftInput::ElectionTimeout);
                *handle = next;
                out
            }
            _ => Vec::new(),
        }
    }

    pub fn heartbeat_tick(&mut self) -> Outbound {
        match self {
            ConsensusEngine::Raft(handle) => {
                let (next, out) = std::mem::replace(handle, placeholder_raft()).apply(RaftInput::HeartbeatTick);
                *handle = next;
                out
            }
            ConsensusEngine::Paxos(_) => Vec::new(),
        }
    }

    /// Paxos's analogue of a heartbeat tick: retries proposals queued
    /// behind a local resource lock or a lock-conflict backoff whose
    /// randomised delay (spec.md §4.2) has now elapsed.
    pub fn retry_tick(&mut self, now: Instant) -> Outbound {
        match self {
            ConsensusEngine::Paxos(p) => p.apply(PaxosInput::RetryTick(now)),
            ConsensusEngine::Raft(_) => Vec::new(),
        }
    }

    pub fn expects_messages_of(&self, message_type: MessageType) -> bool {
        match self {
            ConsensusEngine::Raft(_) => message_type.is_raft(),
            ConsensusEngine::Paxos(_) => message_type.is_paxos(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProposeAck {
    Raft(ProposeOutcome),
    Paxos,
}

/// A transient placeholder used only for the instant between
/// `mem::replace` taking a `RaftHandle` out of the engine and putting the
/// post-`apply` handle back — never observed from outside this module.
fn placeholder_raft() -> RaftHandle {
    RaftHandle::new(0, String::new(), Vec::new(), ElectionTimer::new(std::time::Duration::from_secs(3600), std::time::Duration::from_secs(0)), slog::Logger::root(slog::Discard, slog::o!()))
}
