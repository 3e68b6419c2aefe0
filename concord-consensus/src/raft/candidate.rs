//! The candidate role.
//!
//! Grounded on `original_source/Raft/raft_nodes.py`'s election handling:
//! on timeout, bump the term, vote for self, broadcast `RequestVote` to
//! every peer, and count the self-vote immediately — with a one-node
//! cluster (no peers) that alone reaches quorum and becomes leader
//! without waiting on a reply.

use std::collections::HashMap;
use std::collections::HashSet;

use crate::message::{Address, MessageType, RequestVoteContent, VoteContent};

use super::follower::Follower;
use super::leader::Leader;
use super::{quorum_for, Outbound, Raft, RaftHandle};

pub struct Candidate {
    pub votes_received: HashSet<Address>,
}

impl Raft<Follower> {
    pub fn into_candidate(self) -> Raft<Candidate> {
        Raft {
            id: self.id,
            address: self.address,
            peers: self.peers,
            log: self.log,
            accounts: self.accounts,
            state: self.state,
            election_timer: self.election_timer,
            logger: self.logger.new(slog::o!("role" => "candidate")),
            role: Candidate { votes_received: HashSet::new() },
        }
    }
}

/// Starts (or restarts, after a split-vote timeout) an election: bumps
/// the term, votes for self, resets the deadline, and broadcasts
/// `RequestVote` to every peer.
pub fn seek_election(mut raft: Raft<Candidate>) -> (RaftHandle, Outbound) {
    raft.state.current_term += 1;
    raft.state.voted_for = Some(raft.address.clone());
    raft.state.leader_id = None;
    raft.role.votes_received = HashSet::new();
    raft.role.votes_received.insert(raft.address.clone());
    raft.reset_election_deadline();

    info!(raft.logger, "starting election"; "term" => raft.state.current_term);

    let content = RequestVoteContent {
        candidate_id: raft.address.clone(),
        last_log_index: raft.last_log_index(),
        last_log_term: raft.last_log_term(),
    };
    let mut out = Vec::new();
    raft.broadcast(&mut out, MessageType::RequestVote, content);

    if raft.role.votes_received.len() >= raft.quorum() {
        return become_leader(raft, out);
    }
    (RaftHandle::Candidate(raft), out)
}

pub fn handle_vote_response(mut raft: Raft<Candidate>, msg: &crate::message::Envelope) -> (RaftHandle, Outbound) {
    let content: VoteContent = match msg.decode() {
        Ok(c) => c,
        Err(_) => return (RaftHandle::Candidate(raft), Vec::new()),
    };
    if content.granted {
        raft.role.votes_received.insert(msg.from_ip.clone());
    }
    if raft.role.votes_received.len() >= raft.quorum() {
        return become_leader(raft, Vec::new());
    }
    (RaftHandle::Candidate(raft), Vec::new())
}

fn become_leader(raft: Raft<Candidate>, mut out: Outbound) -> (RaftHandle, Outbound) {
    let next_index_default = raft.last_log_index() + 1;
    let mut next_index = HashMap::new();
    let mut match_index = HashMap::new();
    for peer in &raft.peers {
        next_index.insert(peer.clone(), next_index_default);
        match_index.insert(peer.clone(), -1);
    }

    let mut leader = Raft {
        id: raft.id,
        address: raft.address,
        peers: raft.peers,
        log: raft.log,
        accounts: raft.accounts,
        state: raft.state,
        election_timer: raft.election_timer,
        logger: raft.logger.new(slog::o!("role" => "leader")),
        role: Leader { next_index, match_index },
    };
    leader.state.leader_id = Some(leader.address.clone());

    info!(leader.logger, "elected leader"; "term" => leader.state.current_term);

    let (handle, heartbeat_out) = super::leader::broadcast_heartbeat(leader);
    out.extend(heartbeat_out);
    (handle, out)
}
