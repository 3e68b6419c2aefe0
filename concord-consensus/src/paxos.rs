//! C5 — single-decree multi-Paxos.
//!
//! Grounded on `original_source/Paxos/paxos_nodes.py`: proposer, acceptor
//! and learner sub-state live together on one node (every node can act in
//! all three roles), resources are serialized through a local lock table
//! before a round starts, and a round is only considered committed once a
//! quorum of `ACCEPTED` replies has been observed (learner-driven commit,
//! per spec.md §9's redesign-flag decision) — not merely a quorum of
//! `PROMISE`s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use slog::Logger;

use crate::clock::paxos_retry_backoff;
use crate::log::{Log, LogEntry};
use crate::message::{
    Address, Envelope, MessageType, NodeId, OperationContent, PriorAccept, PromiseContent, RoundId,
};
use crate::raft::quorum_for;
use crate::transaction::{apply_operation, extract_tx_id, parse_operation, Accounts, ApplyOutcome};

pub type Outbound = Vec<Envelope>;

/// A node's acceptor sub-state: the single highest round it has promised,
/// and the value (if any) it has accepted.
#[derive(Debug, Clone, Default)]
pub struct Acceptor {
    pub promised_round: Option<RoundId>,
    pub accepted_round: Option<RoundId>,
    pub accepted_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProposerPhase {
    Preparing,
    Accepting,
}

/// A node's proposer sub-state: at most one round in flight at a time.
#[derive(Debug, Clone)]
pub struct ProposerState {
    pub round: RoundId,
    pub tx_id: String,
    pub accounts: Vec<String>,
    pub value: String,
    phase: ProposerPhase,
    promises: HashMap<Address, PromiseContent>,
}

/// A proposal retried later rather than forcing a held lock to yield —
/// either a client proposal that arrived while this node's own resources
/// were busy, or (per spec.md §4.2) an `ACCEPT` that lost a lock conflict
/// and must come back as a fresh proposer at a higher round after a
/// randomised delay.
#[derive(Debug, Clone)]
pub struct PendingProposal {
    pub tx_id: String,
    pub value: String,
    pub accounts: Vec<String>,
    /// Not eligible to retry before this instant. `None` for proposals
    /// only waiting on a local lock, which may retry on the very next tick.
    pub retry_after: Option<Instant>,
    /// A lock-conflict retry must resume at exactly `(seq+1, selfID)` of
    /// the round that lost, per spec.md §4.2 — not merely "some later
    /// round" — so it's carried explicitly instead of left to the
    /// node's own auto-incrementing round counter.
    pub forced_round: Option<RoundId>,
}

/// Local, per-node resource lock — not a cluster-wide lock. Its job is
/// only to keep one node from running two conflicting rounds at once;
/// cluster-wide safety comes from Paxos itself.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    held: HashMap<String, String>,
}

impl LockTable {
    fn can_lock_all(&self, accounts: &[String], tx_id: &str) -> bool {
        accounts.iter().all(|a| match self.held.get(a) {
            None => true,
            Some(holder) => holder == tx_id,
        })
    }

    pub fn lock_all(&mut self, accounts: &[String], tx_id: &str) {
        for a in accounts {
            self.held.insert(a.clone(), tx_id.to_string());
        }
    }

    pub fn unlock_all(&mut self, accounts: &[String], tx_id: &str) {
        for a in accounts {
            if self.held.get(a).map(String::as_str) == Some(tx_id) {
                self.held.remove(a);
            }
        }
    }

    pub fn locked_accounts(&self) -> Vec<String> {
        self.held.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PaxosStatus {
    pub role: &'static str,
    pub active_round: Option<String>,
    pub locked_accounts: Vec<String>,
    pub log_size: usize,
    pub pending: usize,
}

pub enum PaxosInput {
    ClientPropose(String),
    Message(Envelope),
    RetryTick(Instant),
}

pub struct Paxos {
    pub id: NodeId,
    pub address: Address,
    pub peers: Vec<Address>,
    pub log: Log,
    pub accounts: Accounts,
    pub locks: LockTable,
    pub acceptor: Acceptor,
    pub proposer: Option<ProposerState>,
    pub pending: VecDeque<PendingProposal>,
    learned: HashMap<RoundId, HashSet<Address>>,
    applied_rounds: HashSet<RoundId>,
    applied_tx_ids: HashSet<String>,
    next_tx_seq: u64,
    next_round_seq: u64,
    pub logger: Logger,
}

impl Paxos {
    pub fn new(id: NodeId, address: Address, peers: Vec<Address>, logger: Logger) -> Paxos {
        Paxos {
            id,
            address,
            peers,
            log: Log::new(),
            accounts: Accounts::default(),
            locks: LockTable::default(),
            acceptor: Acceptor::default(),
            proposer: None,
            pending: VecDeque::new(),
            learned: HashMap::new(),
            applied_rounds: HashSet::new(),
            applied_tx_ids: HashSet::new(),
            next_tx_seq: 0,
            next_round_seq: 0,
            logger,
        }
    }

    pub fn quorum(&self) -> usize {
        quorum_for(self.peers.len() + 1)
    }

    pub fn status(&self) -> PaxosStatus {
        PaxosStatus {
            role: "paxos",
            active_round: self.proposer.as_ref().map(|p| p.round.to_string()),
            locked_accounts: self.locks.locked_accounts(),
            log_size: self.log.len(),
            pending: self.pending.len(),
        }
    }

    fn fresh_tx_id(&mut self) -> String {
        self.next_tx_seq += 1;
        format!("{}-{}", self.id, self.next_tx_seq)
    }

    fn send(&self, out: &mut Outbound, to: Address, message_type: MessageType, round: RoundId, content: impl serde::Serialize) {
        out.push(Envelope::paxos(self.address.clone(), to, message_type, round, content));
    }

    fn broadcast(&self, out: &mut Outbound, message_type: MessageType, round: RoundId, content: impl serde::Serialize + Clone) {
        for peer in &self.peers {
            self.send(out, peer.clone(), message_type, round, content.clone());
        }
    }

    pub fn apply(&mut self, input: PaxosInput) -> Outbound {
        match input {
            PaxosInput::ClientPropose(raw) => self.client_propose(raw),
            PaxosInput::Message(env) => self.handle_message(env),
            PaxosInput::RetryTick(now) => self.retry_pending(now),
        }
    }

    fn client_propose(&mut self, raw: String) -> Outbound {
        let op = match parse_operation(&raw) {
            Ok(op) => op,
            Err(e) => {
                warn!(self.logger, "rejected malformed proposal"; "error" => e.to_string());
                return Vec::new();
            }
        };
        let tx_id = extract_tx_id(&raw).unwrap_or_else(|| self.fresh_tx_id());
        let accounts = op.required_accounts();

        if self.proposer.is_none() && self.locks.can_lock_all(&accounts, &tx_id) {
            self.locks.lock_all(&accounts, &tx_id);
            self.start_proposal(tx_id, raw, accounts)
        } else {
            debug!(self.logger, "queueing proposal, resources busy"; "tx_id" => &tx_id);
            self.pending.push_back(PendingProposal { tx_id, value: raw, accounts, retry_after: None, forced_round: None });
            Vec::new()
        }
    }

    /// Attempts to start the next queued proposal once this node is free,
    /// its target round (if any) has arrived, and its accounts are no
    /// longer contended. Never forces out an existing lock holder — it
    /// only ever waits its turn.
    fn retry_pending(&mut self, now: Instant) -> Outbound {
        if self.proposer.is_some() {
            return Vec::new();
        }
        let mut requeue = VecDeque::new();
        let mut out = Vec::new();
        while let Some(candidate) = self.pending.pop_front() {
            let due = candidate.retry_after.map_or(true, |t| now >= t);
            if due && self.proposer.is_none() && self.locks.can_lock_all(&candidate.accounts, &candidate.tx_id) {
                self.locks.lock_all(&candidate.accounts, &candidate.tx_id);
                let round = candidate.forced_round.unwrap_or_else(|| {
                    self.next_round_seq += 1;
                    RoundId::new(self.next_round_seq, self.id)
                });
                if round.sequence > self.next_round_seq {
                    self.next_round_seq = round.sequence;
                }
                out.extend(self.begin_round(round, candidate.tx_id, candidate.value, candidate.accounts));
            } else {
                requeue.push_back(candidate);
            }
        }
        self.pending = requeue;
        out
    }

    fn start_proposal(&mut self, tx_id: String, value: String, accounts: Vec<String>) -> Outbound {
        self.next_round_seq += 1;
        let round = RoundId::new(self.next_round_seq, self.id);
        self.begin_round(round, tx_id, value, accounts)
    }

    /// Shared by a fresh client-initiated proposal and a lock-conflict
    /// retry resuming at an explicit higher round.
    fn begin_round(&mut self, round: RoundId, tx_id: String, value: String, accounts: Vec<String>) -> Outbound {
        info!(self.logger, "starting paxos round"; "round" => round.to_string(), "tx_id" => &tx_id);

        self.proposer = Some(ProposerState {
            round,
            tx_id,
            accounts,
            value,
            phase: ProposerPhase::Preparing,
            promises: HashMap::new(),
        });

        let mut out = Vec::new();
        // Self-promise: a proposer always considers its own acceptor first.
        let self_promise = self.local_prepare(round);
        if let Some(ps) = self.proposer.as_mut() {
            ps.promises.insert(self.address.clone(), self_promise);
        }
        self.broadcast(&mut out, MessageType::Prepare, round, ());

        self.maybe_advance_to_accept(&mut out);
        out
    }

    /// Runs the acceptor's Prepare rule locally (used both for the
    /// proposer's self-promise and for `PREPARE` received over the wire).
    fn local_prepare(&mut self, round: RoundId) -> PromiseContent {
        let grant = self.acceptor.promised_round.map_or(true, |p| round > p);
        if grant {
            self.acceptor.promised_round = Some(round);
        }
        let prior_accept = self.acceptor.accepted_round.map(|accepted_id| PriorAccept {
            accepted_id,
            value: self.acceptor.accepted_value.clone().unwrap_or_default(),
        });
        PromiseContent {
            prior_accept,
            tentative_value: self.acceptor.accepted_value.clone().unwrap_or_default(),
        }
    }

    /// Runs the acceptor's Accept rule locally.
    fn local_accept(&mut self, round: RoundId, value: &str) -> bool {
        let accept = self.acceptor.promised_round.map_or(true, |p| round >= p);
        if accept {
            self.acceptor.promised_round = Some(round);
            self.acceptor.accepted_round = Some(round);
            self.acceptor.accepted_value = Some(value.to_string());
        }
        accept
    }

    fn handle_message(&mut self, msg: Envelope) -> Outbound {
        let round = match msg.round_identifier {
            Some(r) => r,
            None => return Vec::new(),
        };
        match msg.message_type {
            MessageType::Prepare => self.handle_prepare(&msg.from_ip, round),
            MessageType::Promise => self.handle_promise(&msg, round),
            MessageType::Accept => self.handle_accept(&msg, round),
            MessageType::Accepted => self.handle_accepted(&msg.from_ip, round),
            _ => Vec::new(),
        }
    }

    fn handle_prepare(&mut self, from: &Address, round: RoundId) -> Outbound {
        let already_seen = self.acceptor.promised_round.map_or(false, |p| p >= round);
        if already_seen && self.acceptor.promised_round != Some(round) {
            // A strictly higher round has already been promised; stay silent,
            // matching the original's silent-drop behaviour (no NACK type).
            return Vec::new();
        }
        let promise = self.local_prepare(round);
        let mut out = Vec::new();
        self.send(&mut out, from.clone(), MessageType::Promise, round, promise);
        out
    }

    fn handle_promise(&mut self, msg: &Envelope, round: RoundId) -> Outbound {
        let content: PromiseContent = match msg.decode() {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let matches = self.proposer.as_ref().map_or(false, |p| p.round == round);
        if !matches {
            return Vec::new();
        }
        if let Some(ps) = self.proposer.as_mut() {
            ps.promises.insert(msg.from_ip.clone(), content);
        }
        let mut out = Vec::new();
        self.maybe_advance_to_accept(&mut out);
        out
    }

    /// Once a promise quorum is reached, picks the value to propose —
    /// the prior-accepted value carried by the highest round among the
    /// promises if any exists, else the proposer's own value — and
    /// broadcasts `ACCEPT`.
    fn maybe_advance_to_accept(&mut self, out: &mut Outbound) {
        let quorum = self.quorum();
        let ready = self
            .proposer
            .as_ref()
            .map_or(false, |p| p.phase == ProposerPhase::Preparing && p.promises.len() >= quorum);
        if !ready {
            return;
        }

        let (round, chosen_value) = {
            let ps = self.proposer.as_mut().unwrap();
            let mut best: Option<PriorAccept> = None;
            for promise in ps.promises.values() {
                if let Some(prior) = &promise.prior_accept {
                    if best.as_ref().map_or(true, |b| prior.accepted_id > b.accepted_id) {
                        best = Some(prior.clone());
                    }
                }
            }
            let value = best.map(|b| b.value).unwrap_or_else(|| ps.value.clone());
            ps.value = value.clone();
            ps.phase = ProposerPhase::Accepting;
            (ps.round, value)
        };

        info!(self.logger, "moving to accept phase"; "round" => round.to_string());

        self.broadcast(out, MessageType::Accept, round, OperationContent { operation: chosen_value.clone() });
        self.try_accept(round, &chosen_value, out);
    }

    /// The acceptor's Accept rule, per spec.md §4.2: before accepting a
    /// value this node must hold the resource locks its required accounts
    /// need. It first releases any lock it itself still holds for this
    /// same `tx_id` (an earlier round of its own proposal may have grabbed
    /// it), then checks for a conflicting holder. A conflict schedules a
    /// randomised retry as a fresh proposer at `(round.sequence+1,
    /// selfID)` rather than blocking or preempting the other holder —
    /// grounded on `original_source/Paxos/paxos_nodes.py::receive_message`'s
    /// `ACCEPT` branch (`try_lock_all` / `schedule_retry`). Called for
    /// both a wire-received `ACCEPT` and this node's own self-accept of
    /// its proposed value, since the original self-delivers its own
    /// messages through the identical handler.
    fn try_accept(&mut self, round: RoundId, value: &str, out: &mut Outbound) {
        let tx_id = extract_tx_id(value).unwrap_or_default();
        let required = parse_operation(value).map(|op| op.required_accounts()).unwrap_or_default();

        if !tx_id.is_empty() {
            self.locks.unlock_all(&required, &tx_id);
        }

        // A round this acceptor has already moved past is rejected
        // outright — it never gets to contend for the lock at all. The
        // unlock above still runs unconditionally, matching the
        // original's ordering (it releases a stale proposal's own lock
        // even when the proposal itself is about to be turned away).
        let round_is_current = self.acceptor.promised_round.map_or(true, |p| round >= p);
        if !round_is_current {
            debug!(self.logger, "rejected stale accept"; "round" => round.to_string(), "promised" => self.acceptor.promised_round.map(|p| p.to_string()).unwrap_or_default());
            return;
        }

        if !tx_id.is_empty() && !required.is_empty() && !self.locks.can_lock_all(&required, &tx_id) {
            let delay = paxos_retry_backoff(Duration::from_millis(100), Duration::from_millis(500));
            let retry_round = round.next_for(self.id);
            warn!(self.logger, "lock conflict on accept, scheduling retry";
                "round" => round.to_string(), "tx_id" => &tx_id,
                "retry_round" => retry_round.to_string(), "delay_ms" => delay.as_millis() as u64);
            self.pending.push_back(PendingProposal {
                tx_id,
                value: value.to_string(),
                accounts: required,
                retry_after: Some(Instant::now() + delay),
                forced_round: Some(retry_round),
            });
            return;
        }
        if !tx_id.is_empty() {
            self.locks.lock_all(&required, &tx_id);
        }

        if self.local_accept(round, value) {
            self.learned.entry(round).or_default().insert(self.address.clone());
            self.broadcast(out, MessageType::Accepted, round, OperationContent { operation: value.to_string() });
            self.maybe_commit(round, out);
        }
    }

    fn handle_accept(&mut self, msg: &Envelope, round: RoundId) -> Outbound {
        let content: OperationContent = match msg.decode() {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        self.try_accept(round, &content.operation, &mut out);
        out
    }

    fn handle_accepted(&mut self, from: &Address, round: RoundId) -> Outbound {
        self.learned.entry(round).or_default().insert(from.clone());
        let mut out = Vec::new();
        self.maybe_commit(round, &mut out);
        out
    }

    /// Commits `round` once a quorum of `ACCEPTED` observations has been
    /// gathered. Applies the decided value to the local account map and
    /// releases the lock it holds for the value's own tx id, on every
    /// node that held one — not just the proposer — per the original's
    /// ACCEPTED branch (`if tx_id: self.unlock_all(tx_id)`, run
    /// unconditionally once quorum is reached).
    ///
    /// A lock-conflict retry (`try_accept`) reproposes the same tx id at a
    /// fresh, higher round rather than touching the round that lost the
    /// conflict — so that original round can still separately reach
    /// quorum among the acceptors that never conflicted. The original
    /// ties its learner tally to the value's own identity rather than to
    /// a round (`_find_id_by_value`) precisely so a value is executed
    /// once no matter how many rounds end up carrying it; `applied_tx_ids`
    /// is the same guard kept against this port's per-round tally.
    fn maybe_commit(&mut self, round: RoundId, out: &mut Outbound) {
        if self.applied_rounds.contains(&round) {
            return;
        }
        let count = self.learned.get(&round).map(|s| s.len()).unwrap_or(0);
        if count < self.quorum() {
            return;
        }
        let value = match &self.acceptor.accepted_value {
            Some(v) if self.acceptor.accepted_round == Some(round) => v.clone(),
            _ => return,
        };

        self.applied_rounds.insert(round);
        let committed_tx_id = extract_tx_id(&value).unwrap_or_default();
        let already_applied = !committed_tx_id.is_empty() && self.applied_tx_ids.contains(&committed_tx_id);

        if already_applied {
            debug!(self.logger, "retried round reached quorum for an already-applied tx, skipping re-apply";
                "round" => round.to_string(), "tx_id" => &committed_tx_id);
        } else {
            if !committed_tx_id.is_empty() {
                self.applied_tx_ids.insert(committed_tx_id.clone());
            }
            let index = self.log.len() as u64;
            self.log.append(LogEntry { term: 0, index, timestamp_millis: 0, payload: value.clone() });

            match parse_operation(&value) {
                Ok(op) => match apply_operation(&mut self.accounts, &op) {
                    ApplyOutcome::Applied => info!(self.logger, "committed paxos decree"; "round" => round.to_string()),
                    ApplyOutcome::InsufficientFunds { account } => {
                        warn!(self.logger, "insufficient funds, no-op apply"; "round" => round.to_string(), "account" => account)
                    }
                },
                Err(e) => warn!(self.logger, "unparseable committed decree"; "round" => round.to_string(), "error" => e.to_string()),
            }
        }

        if !committed_tx_id.is_empty() {
            let accounts = parse_operation(&value).map(|op| op.required_accounts()).unwrap_or_default();
            self.locks.unlock_all(&accounts, &committed_tx_id);
        }

        if let Some(ps) = self.proposer.take() {
            if ps.round != round {
                self.proposer = Some(ps);
            }
        }

        // A learned decree is done influencing future rounds: the next
        // proposal's Promise must carry no `prior_accept`, or it would be
        // forced to repropose this already-committed value forever.
        // Grounded on the original's `reset_paxos_state`, called from its
        // own ACCEPTED branch once a value reaches quorum.
        self.acceptor.accepted_round = None;
        self.acceptor.accepted_value = None;

        out.extend(self.retry_pending(Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::logger::get_root_logger;

    fn node(id: NodeId, peers: &[&str]) -> Paxos {
        Paxos::new(id, format!("node-{}", id), peers.iter().map(|s| s.to_string()).collect(), get_root_logger())
    }

    #[test]
    fn single_node_cluster_commits_immediately() {
        let mut n = node(1, &[]);
        n.apply(PaxosInput::ClientPropose("DEPOSIT;A;100.00".to_string()));
        assert_eq!(n.accounts.balance("A"), crate::transaction::Amount(1_100_000));
        assert_eq!(n.log.len(), 1);
        assert!(n.locks.locked_accounts().is_empty());
    }

    #[test]
    fn conflicting_proposal_on_same_node_is_queued_until_first_commits() {
        let mut n = node(1, &[]);
        n.apply(PaxosInput::ClientPropose("WITHDRAW;A;10.00;TX_ID:t1".to_string()));
        // t1 committed immediately (single-node quorum of 1), so a second
        // proposal on A should also proceed rather than queue.
        n.apply(PaxosInput::ClientPropose("WITHDRAW;A;10.00;TX_ID:t2".to_string()));
        assert_eq!(n.accounts.balance("A"), crate::transaction::Amount(1_000_000 - 2_000));
        assert!(n.pending.is_empty());
    }

    #[test]
    fn two_node_round_requires_accepted_quorum_before_applying() {
        let mut n1 = node(1, &["node-2"]);
        let out = n1.apply(PaxosInput::ClientPropose("DEPOSIT;A;50.00;TX_ID:t1".to_string()));
        // With only a Prepare broadcast and a self-promise, n1 alone does
        // not yet have a promise quorum of 2, so no ACCEPT is sent and the
        // decree is not committed.
        assert_eq!(n1.accounts.balance("A"), crate::transaction::Amount(1_000_000));
        assert!(out.iter().any(|e| e.message_type == MessageType::Prepare));
    }
}
