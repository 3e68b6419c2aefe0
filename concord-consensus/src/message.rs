//! Wire message types shared by the Raft and Paxos engines.
//!
//! Grounded on `original_source/Raft/raft_messages.py` (`RaftMessage`,
//! `RaftMessageType`), `original_source/Paxos/paxos_messages.py`, and the
//! JSON envelope shape fixed by spec.md §6. Per spec.md §9's redesign
//! flag, the string-encoded round id (`"seq.nodeId"`) is kept on the wire
//! via custom `Serialize`/`Deserialize` but is a plain `(u64, NodeId)` pair
//! everywhere in engine code — it is never passed around as a raw string.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use concord_core::error::{ConcordError, Result};

/// Unique, cluster-wide, stable node identifier. Also used as the
/// tiebreaker component of a Paxos round id.
pub type NodeId = u32;

/// Routing key for a node: its IP address (or "ip:whatever" the cluster
/// uses consistently), matching spec.md §3's "string address".
pub type Address = String;

/// Raft election term. Strictly monotone.
pub type Term = u64;

/// Log position. `-1` is the sentinel for "log is empty" / "no entry yet",
/// matching `original_source`'s `get_last_log_index` returning `-1` for an
/// empty log and `commit_index`/`last_applied` both initialised to `-1`.
pub type LogIndex = i64;

/// Paxos round identifier: `(sequence, proposer_id)` compared
/// lexicographically (sequence first), globally monotone per proposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RoundId {
    pub sequence: u64,
    pub proposer_id: NodeId,
}

impl RoundId {
    pub const ZERO: RoundId = RoundId { sequence: 0, proposer_id: 0 };

    pub fn new(sequence: u64, proposer_id: NodeId) -> Self {
        RoundId { sequence, proposer_id }
    }

    /// The next round this proposer may use, strictly greater than both
    /// `self` and any round it has observed.
    pub fn next_for(&self, proposer_id: NodeId) -> RoundId {
        RoundId { sequence: self.sequence + 1, proposer_id }
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sequence, self.proposer_id)
    }
}

impl FromStr for RoundId {
    type Err = ConcordError;

    fn from_str(s: &str) -> Result<Self> {
        let (seq, node) = s
            .split_once('.')
            .ok_or_else(|| ConcordError::Protocol(format!("malformed round id: {}", s)))?;
        let sequence = seq
            .parse()
            .map_err(|_| ConcordError::Protocol(format!("malformed round id: {}", s)))?;
        let proposer_id = node
            .parse()
            .map_err(|_| ConcordError::Protocol(format!("malformed round id: {}", s)))?;
        Ok(RoundId { sequence, proposer_id })
    }
}

impl Serialize for RoundId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RoundId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

/// The eight message families carried over the wire, exactly as listed in
/// spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "REQUEST_VOTE")]
    RequestVote,
    #[serde(rename = "VOTE")]
    Vote,
    #[serde(rename = "APPEND_ENTRIES")]
    AppendEntries,
    #[serde(rename = "APPEND_RESPONSE")]
    AppendResponse,
    #[serde(rename = "PREPARE")]
    Prepare,
    #[serde(rename = "PROMISE")]
    Promise,
    #[serde(rename = "ACCEPT")]
    Accept,
    #[serde(rename = "ACCEPTED")]
    Accepted,
}

impl MessageType {
    pub fn is_raft(self) -> bool {
        matches!(
            self,
            MessageType::RequestVote
                | MessageType::Vote
                | MessageType::AppendEntries
                | MessageType::AppendResponse
        )
    }

    pub fn is_paxos(self) -> bool {
        !self.is_raft()
    }
}

/// A length-framed inter-node message, as specified in spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from_ip: Address,
    pub to_ip: Address,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub term: Option<Term>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub round_identifier: Option<RoundId>,
    pub message_content: serde_json::Value,
}

impl Envelope {
    pub fn raft(
        from: Address,
        to: Address,
        message_type: MessageType,
        term: Term,
        content: impl Serialize,
    ) -> Envelope {
        Envelope {
            from_ip: from,
            to_ip: to,
            message_type,
            term: Some(term),
            round_identifier: None,
            message_content: serde_json::to_value(content)
                .expect("content types here are always representable as JSON"),
        }
    }

    pub fn paxos(
        from: Address,
        to: Address,
        message_type: MessageType,
        round_identifier: RoundId,
        content: impl Serialize,
    ) -> Envelope {
        Envelope {
            from_ip: from,
            to_ip: to,
            message_type,
            term: None,
            round_identifier: Some(round_identifier),
            message_content: serde_json::to_value(content)
                .expect("content types here are always representable as JSON"),
        }
    }

    /// Parses the generic content payload into a protocol-specific,
    /// structured type. This is the boundary spec.md §9 requires: raw
    /// strings/JSON never cross into engine logic unparsed.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.message_content.clone()).map_err(ConcordError::from)
    }
}

/// `RequestVote(term, candidateId, lastLogIndex, lastLogTerm)` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteContent {
    pub candidate_id: Address,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// `VoteResponse(term, granted)` content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoteContent {
    pub granted: bool,
}

/// `AppendEntries(term, leaderId, prevLogIndex, prevLogTerm, entries, leaderCommit)` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesContent {
    pub leader_id: Address,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<crate::log::LogEntry>,
    pub leader_commit: LogIndex,
}

/// `AppendResponse(term, success, matchIndex)` content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AppendResponseContent {
    pub success: bool,
    pub index: LogIndex,
}

/// Paxos Prepare/Accept/Accepted all carry the raw operation text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContent {
    pub operation: String,
}

/// A previously-accepted value reported in a Promise, per spec.md §4.2.
/// Replaces the original's `(0,0)`/empty-string sentinel pair with an
/// explicit option, per spec.md §9.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorAccept {
    pub accepted_id: RoundId,
    pub value: String,
}

/// `Promise(roundId, payload)` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromiseContent {
    pub prior_accept: Option<PriorAccept>,
    /// Echoed back so the proposer has a fallback value when nobody has
    /// accepted anything yet (mirrors the original's `f"0.0;{tentative}"`).
    pub tentative_value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_id_round_trips_through_string() {
        let r = RoundId::new(12, 3);
        assert_eq!(r.to_string(), "12.3");
        assert_eq!("12.3".parse::<RoundId>().unwrap(), r);
    }

    #[test]
    fn round_id_orders_lexicographically() {
        assert!(RoundId::new(1, 9) < RoundId::new(2, 0));
        assert!(RoundId::new(2, 0) < RoundId::new(2, 1));
    }

    #[test]
    fn envelope_round_trips_raft_content() {
        let content = RequestVoteContent {
            candidate_id: "10.0.0.1".into(),
            last_log_index: 4,
            last_log_term: 2,
        };
        let env = Envelope::raft(
            "10.0.0.1".into(),
            "10.0.0.2".into(),
            MessageType::RequestVote,
            2,
            content.clone(),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.decode::<RequestVoteContent>().unwrap(), content);
        assert_eq!(back.term, Some(2));
    }

    #[test]
    fn message_type_family_split() {
        assert!(MessageType::RequestVote.is_raft());
        assert!(!MessageType::RequestVote.is_paxos());
        assert!(MessageType::Prepare.is_paxos());
    }
}
