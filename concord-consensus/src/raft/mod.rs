//! C4 — the Raft engine.
//!
//! Typestate shape (`Raft<Follower>` / `Raft<Candidate>` / `Raft<Leader>`
//! wrapped in a `RaftHandle`, an `Apply`-style dispatch) is grounded on
//! `josefine-raft/src/raft.rs` and `josefine-raft/src/candidate.rs`. Exact
//! receiver rules (log matching, commit-index median, next/match index
//! bookkeeping) are grounded on `original_source/Raft/raft_nodes.py`.

mod candidate;
mod follower;
mod leader;

pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::Leader;

use std::collections::HashMap;
use std::time::Instant;

use slog::Logger;

use concord_core::clock::ElectionTimer;

use crate::log::{Log, LogEntry};
use crate::message::{
    Address, AppendEntriesContent, AppendResponseContent, Envelope, LogIndex, MessageType,
    NodeId, RequestVoteContent, Term, VoteContent,
};
use crate::transaction::{apply_operation, parse_operation, Accounts, ApplyOutcome};

pub type Outbound = Vec<Envelope>;

/// Quorum size for a cluster of `n` total nodes: `floor(n/2) + 1`.
pub fn quorum_for(n: usize) -> usize {
    n / 2 + 1
}

/// Volatile + persistent-in-spirit state common to every role, per
/// spec.md §3.
#[derive(Debug, Clone)]
pub struct RaftState {
    pub current_term: Term,
    pub voted_for: Option<Address>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_id: Option<Address>,
    pub election_deadline: Instant,
}

impl RaftState {
    pub fn new(now: Instant) -> Self {
        RaftState {
            current_term: 0,
            voted_for: None,
            commit_index: -1,
            last_applied: -1,
            leader_id: None,
            election_deadline: now,
        }
    }
}

/// What a client proposal, inbound wire message or timer tick drives
/// through the engine. Mirrors spec.md §4.1's public contract.
#[derive(Debug)]
pub enum RaftInput {
    ClientPropose(String),
    Message(Envelope),
    ElectionTimeout,
    HeartbeatTick,
}

/// Outcome surfaced to the façade for a client proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposeOutcome {
    Appended { index: LogIndex, term: Term },
    NotLeader { leader_hint: Option<Address> },
}

/// `/status` projection, per spec.md §6.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RaftStatus {
    pub role: &'static str,
    pub term: Term,
    pub leader: Option<Address>,
    pub log_size: usize,
    pub commit_index: LogIndex,
}

/// Fields shared by every role. Kept flat on `Raft<S>` (not nested) to
/// match the teacher's `Raft<T: Role>` shape.
pub struct Raft<S> {
    pub id: NodeId,
    pub address: Address,
    pub peers: Vec<Address>,
    pub log: Log,
    pub accounts: Accounts,
    pub state: RaftState,
    pub election_timer: ElectionTimer,
    pub logger: Logger,
    pub role: S,
}

impl<S> Raft<S> {
    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn quorum(&self) -> usize {
        quorum_for(self.peers.len() + 1)
    }

    pub fn reset_election_deadline(&mut self) {
        self.state.election_deadline = self.election_timer.next_deadline(Instant::now());
    }

    pub fn needs_election(&self, now: Instant) -> bool {
        now >= self.state.election_deadline
    }

    pub fn send(
        &self,
        out: &mut Outbound,
        to: Address,
        message_type: MessageType,
        content: impl serde::Serialize,
    ) {
        out.push(Envelope::raft(
            self.address.clone(),
            to,
            message_type,
            self.state.current_term,
            content,
        ));
    }

    pub fn broadcast(&self, out: &mut Outbound, message_type: MessageType, content: impl serde::Serialize + Clone) {
        for peer in &self.peers {
            self.send(out, peer.clone(), message_type, content.clone());
        }
    }

    /// Discards role-specific state and returns a fresh `Follower`,
    /// preserving identity, log, accounts and term state. Used both for
    /// the higher-term step-down rule and for "any AppendEntries from a
    /// legitimate leader demotes the receiver."
    pub fn into_follower(self) -> Raft<Follower> {
        Raft {
            id: self.id,
            address: self.address,
            peers: self.peers,
            log: self.log,
            accounts: self.accounts,
            state: self.state,
            election_timer: self.election_timer,
            logger: self.logger.new(slog::o!("role" => "follower")),
            role: Follower,
        }
    }

    pub fn status(&self, role: &'static str) -> RaftStatus {
        RaftStatus {
            role,
            term: self.state.current_term,
            leader: self.state.leader_id.clone(),
            log_size: self.log.len(),
            commit_index: self.state.commit_index,
        }
    }
}

/// Enables `Raft<S>` to be rewrapped into the matching `RaftHandle`
/// variant without the generic term-check helper needing to know which
/// role it started from.
pub trait RoleState: Sized {
    fn wrap(raft: Raft<Self>) -> RaftHandle;
}

impl RoleState for Follower {
    fn wrap(raft: Raft<Follower>) -> RaftHandle {
        RaftHandle::Follower(raft)
    }
}

impl RoleState for Candidate {
    fn wrap(raft: Raft<Candidate>) -> RaftHandle {
        RaftHandle::Candidate(raft)
    }
}

impl RoleState for Leader {
    fn wrap(raft: Raft<Leader>) -> RaftHandle {
        RaftHandle::Leader(raft)
    }
}

/// Since applying a message can result in any state transition, the
/// result is an enum sized to the largest variant — same rationale as
/// `josefine-raft`'s own `RaftHandle`.
pub enum RaftHandle {
    Follower(Raft<Follower>),
    Candidate(Raft<Candidate>),
    Leader(Raft<Leader>),
}

impl RaftHandle {
    pub fn new(
        id: NodeId,
        address: Address,
        peers: Vec<Address>,
        election_timer: ElectionTimer,
        logger: Logger,
    ) -> RaftHandle {
        let now = Instant::now();
        let mut raft = Raft {
            id,
            address,
            peers,
            log: Log::new(),
            accounts: Accounts::default(),
            state: RaftState::new(now),
            election_timer,
            logger,
            role: Follower,
        };
        raft.reset_election_deadline();
        RaftHandle::Follower(raft)
    }

    pub fn status(&self) -> RaftStatus {
        match self {
            RaftHandle::Follower(r) => r.status("follower"),
            RaftHandle::Candidate(r) => r.status("candidate"),
            RaftHandle::Leader(r) => r.status("leader"),
        }
    }

    pub fn log(&self) -> &Log {
        match self {
            RaftHandle::Follower(r) => &r.log,
            RaftHandle::Candidate(r) => &r.log,
            RaftHandle::Leader(r) => &r.log,
        }
    }

    pub fn accounts(&self) -> &Accounts {
        match self {
            RaftHandle::Follower(r) => &r.accounts,
            RaftHandle::Candidate(r) => &r.accounts,
            RaftHandle::Leader(r) => &r.accounts,
        }
    }

    pub fn needs_election(&self, now: Instant) -> bool {
        match self {
            RaftHandle::Follower(r) => r.needs_election(now),
            RaftHandle::Candidate(r) => r.needs_election(now),
            RaftHandle::Leader(_) => false,
        }
    }

    /// Drives the state machine. Produces zero or more outbound messages.
    pub fn apply(self, input: RaftInput) -> (RaftHandle, Outbound) {
        match input {
            RaftInput::Message(msg) => match self {
                RaftHandle::Follower(r) => apply_term_checked(r, msg),
                RaftHandle::Candidate(r) => apply_term_checked(r, msg),
                RaftHandle::Leader(r) => apply_term_checked(r, msg),
            },
            RaftInput::ElectionTimeout => match self {
                RaftHandle::Follower(r) => candidate::seek_election(r.into_candidate()),
                RaftHandle::Candidate(r) => candidate::seek_election(r),
                RaftHandle::Leader(r) => (RaftHandle::Leader(r), Vec::new()),
            },
            RaftInput::HeartbeatTick => match self {
                RaftHandle::Leader(r) => leader::broadcast_heartbeat(r),
                other => (other, Vec::new()),
            },
            RaftInput::ClientPropose(op) => match self {
                RaftHandle::Leader(r) => {
                    let (handle, out, _outcome) = leader::propose(r, op);
                    (handle, out)
                }
                other => (other, Vec::new()),
            },
        }
    }

    /// Like `apply` for a `ClientPropose`, but also reports whether the
    /// proposal was actually accepted — the façade needs this to answer
    /// `/propose` with either the new state or a not-the-leader hint.
    pub fn propose(self, op: String) -> (RaftHandle, Outbound, ProposeOutcome) {
        match self {
            RaftHandle::Leader(r) => leader::propose(r, op),
            RaftHandle::Follower(r) => {
                let hint = r.state.leader_id.clone();
                (RaftHandle::Follower(r), Vec::new(), ProposeOutcome::NotLeader { leader_hint: hint })
            }
            RaftHandle::Candidate(r) => {
                let hint = r.state.leader_id.clone();
                (RaftHandle::Candidate(r), Vec::new(), ProposeOutcome::NotLeader { leader_hint: hint })
            }
        }
    }
}

/// Rejects if the candidate's log is behind ours, per spec.md §4.1's
/// up-to-date rule: higher `lastLogTerm` wins outright; on a tie, the
/// longer log wins.
fn candidate_log_up_to_date<S>(raft: &Raft<S>, cand_last_index: LogIndex, cand_last_term: Term) -> bool {
    let my_term = raft.last_log_term();
    if cand_last_term != my_term {
        return cand_last_term > my_term;
    }
    cand_last_index >= raft.last_log_index()
}

fn handle_request_vote<S>(raft: &mut Raft<S>, from: &Address, content: &RequestVoteContent, out: &mut Outbound) {
    let can_vote = match &raft.state.voted_for {
        None => true,
        Some(voted) => voted == &content.candidate_id,
    };
    let log_ok = candidate_log_up_to_date(raft, content.last_log_index, content.last_log_term);

    if can_vote && log_ok {
        raft.state.voted_for = Some(content.candidate_id.clone());
        info!(raft.logger, "granted vote"; "to" => &content.candidate_id, "term" => raft.state.current_term);
        raft.reset_election_deadline();
        raft.send(out, from.clone(), MessageType::Vote, VoteContent { granted: true });
    } else {
        raft.send(out, from.clone(), MessageType::Vote, VoteContent { granted: false });
    }
}

fn handle_append_entries<S>(raft: &mut Raft<S>, from: &Address, content: &AppendEntriesContent, out: &mut Outbound) {
    let last_index = raft.last_log_index();

    if content.prev_log_index > last_index {
        raft.send(
            out,
            from.clone(),
            MessageType::AppendResponse,
            AppendResponseContent { success: false, index: last_index },
        );
        return;
    }

    if content.prev_log_index >= 0 {
        let term_at_prev = raft.log.term_at(content.prev_log_index).unwrap_or(0);
        if term_at_prev != content.prev_log_term {
            raft.log.truncate_from(content.prev_log_index as u64);
            raft.send(
                out,
                from.clone(),
                MessageType::AppendResponse,
                AppendResponseContent { success: false, index: raft.last_log_index() },
            );
            return;
        }
    }

    for (i, entry) in content.entries.iter().enumerate() {
        let idx = content.prev_log_index + 1 + i as LogIndex;
        if idx <= raft.last_log_index() {
            if raft.log.term_at(idx) != Some(entry.term) {
                raft.log.truncate_from(idx as u64);
                raft.log.append(entry.clone());
            }
        } else {
            raft.log.append(entry.clone());
        }
    }

    if content.leader_commit > raft.state.commit_index {
        raft.state.commit_index = content.leader_commit.min(raft.last_log_index());
        apply_committed(raft);
    }

    raft.send(
        out,
        from.clone(),
        MessageType::AppendResponse,
        AppendResponseContent { success: true, index: raft.last_log_index() },
    );
}

/// Feeds every newly-committed entry, in order, into the transaction
/// engine. Apply monotonicity (`lastApplied` only ever advances and stays
/// `<= commitIndex`) falls directly out of this loop shape.
fn apply_committed<S>(raft: &mut Raft<S>) {
    while raft.state.last_applied < raft.state.commit_index {
        raft.state.last_applied += 1;
        let idx = raft.state.last_applied;
        let payload = match raft.log.get(idx) {
            Some(entry) => entry.payload.clone(),
            None => break,
        };
        match parse_operation(&payload) {
            Ok(op) => match apply_operation(&mut raft.accounts, &op) {
                ApplyOutcome::Applied => {
                    debug!(raft.logger, "applied committed entry"; "index" => idx, "payload" => &payload);
                }
                ApplyOutcome::InsufficientFunds { account } => {
                    warn!(raft.logger, "insufficient funds, no-op apply"; "index" => idx, "account" => account);
                }
            },
            Err(e) => {
                warn!(raft.logger, "unparseable committed payload"; "index" => idx, "error" => e.to_string());
            }
        }
    }
}

fn build_entry(term: Term, index: LogIndex, payload: String) -> LogEntry {
    LogEntry {
        term,
        index: index as u64,
        timestamp_millis: 0,
        payload,
    }
}

/// Steps the term forward if the message carries a higher one, then
/// dispatches by message type. This is the single place cross-role
/// transitions (step-down-on-higher-term, demote-to-follower-on-valid-
/// AppendEntries) happen, matching spec.md §4.1's receiver rules, which
/// apply identically regardless of the receiver's current role.
fn apply_term_checked<S: RoleState>(mut raft: Raft<S>, msg: Envelope) -> (RaftHandle, Outbound) {
    let msg_term = msg.term.unwrap_or(raft.state.current_term);

    if msg_term > raft.state.current_term {
        raft.state.current_term = msg_term;
        raft.state.voted_for = None;
        raft.state.leader_id = None;
        info!(raft.logger, "new term detected"; "term" => msg_term, "from" => &msg.from_ip);
        raft.reset_election_deadline();
        let follower = raft.into_follower();
        return dispatch_message(RaftHandle::Follower(follower), msg);
    }

    if msg_term < raft.state.current_term {
        let mut out = Vec::new();
        match msg.message_type {
            MessageType::RequestVote => raft.send(
                &mut out,
                msg.from_ip.clone(),
                MessageType::Vote,
                VoteContent { granted: false },
            ),
            MessageType::AppendEntries => raft.send(
                &mut out,
                msg.from_ip.clone(),
                MessageType::AppendResponse,
                AppendResponseContent { success: false, index: raft.last_log_index() },
            ),
            _ => {}
        }
        return (S::wrap(raft), out);
    }

    dispatch_message(S::wrap(raft), msg)
}

/// Dispatches a same-term message by type across whichever role the
/// handle currently holds.
fn dispatch_message(handle: RaftHandle, msg: Envelope) -> (RaftHandle, Outbound) {
    match msg.message_type {
        MessageType::RequestVote => {
            let content: RequestVoteContent = match msg.decode() {
                Ok(c) => c,
                Err(_) => return (handle, Vec::new()),
            };
            let mut out = Vec::new();
            let handle = match handle {
                RaftHandle::Follower(mut r) => {
                    handle_request_vote(&mut r, &msg.from_ip, &content, &mut out);
                    RaftHandle::Follower(r)
                }
                RaftHandle::Candidate(mut r) => {
                    handle_request_vote(&mut r, &msg.from_ip, &content, &mut out);
                    RaftHandle::Candidate(r)
                }
                RaftHandle::Leader(mut r) => {
                    handle_request_vote(&mut r, &msg.from_ip, &content, &mut out);
                    RaftHandle::Leader(r)
                }
            };
            (handle, out)
        }
        MessageType::Vote => match handle {
            RaftHandle::Candidate(r) => candidate::handle_vote_response(r, &msg),
            other => (other, Vec::new()),
        },
        MessageType::AppendEntries => {
            let content: AppendEntriesContent = match msg.decode() {
                Ok(c) => c,
                Err(_) => return (handle, Vec::new()),
            };
            let mut follower = match handle {
                RaftHandle::Follower(r) => r,
                RaftHandle::Candidate(r) => r.into_follower(),
                RaftHandle::Leader(r) => r.into_follower(),
            };
            follower.state.leader_id = Some(msg.from_ip.clone());
            follower.reset_election_deadline();
            let mut out = Vec::new();
            handle_append_entries(&mut follower, &msg.from_ip, &content, &mut out);
            (RaftHandle::Follower(follower), out)
        }
        MessageType::AppendResponse => {
            let content: AppendResponseContent = match msg.decode() {
                Ok(c) => c,
                Err(_) => return (handle, Vec::new()),
            };
            match handle {
                RaftHandle::Leader(r) => leader::handle_append_response(r, &msg.from_ip, &content),
                other => (other, Vec::new()),
            }
        }
        MessageType::Prepare | MessageType::Promise | MessageType::Accept | MessageType::Accepted => {
            (handle, Vec::new())
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use concord_core::logger::get_root_logger;

    pub fn make_handle(id: NodeId, address: &str, peers: &[&str]) -> RaftHandle {
        RaftHandle::new(
            id,
            address.to_string(),
            peers.iter().map(|s| s.to_string()).collect(),
            ElectionTimer::new(
                std::time::Duration::from_millis(50),
                std::time::Duration::from_millis(0),
            ),
            get_root_logger(),
        )
    }
}
