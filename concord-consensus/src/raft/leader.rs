//! The leader role.
//!
//! Grounded on `original_source/Raft/raft_nodes.py`'s leader handling:
//! replicate the log via `AppendEntries`, advance `commitIndex` to the
//! median of `matchIndex` once a majority has replicated an entry from
//! the current term, and retry a falling-behind follower by walking
//! `nextIndex` back one slot at a time.

use std::collections::HashMap;

use crate::message::{Address, AppendEntriesContent, AppendResponseContent, LogIndex, MessageType};

use super::{apply_committed, build_entry, quorum_for, Outbound, ProposeOutcome, Raft, RaftHandle};

pub struct Leader {
    pub next_index: HashMap<Address, LogIndex>,
    pub match_index: HashMap<Address, LogIndex>,
}

/// Builds the `AppendEntries` envelope for one peer, using that peer's
/// `nextIndex` to decide how much of the log (if any) to attach.
fn append_entries_for(raft: &Raft<Leader>, peer: &Address) -> crate::message::Envelope {
    let next = *raft.role.next_index.get(peer).unwrap_or(&0);
    let prev_log_index = next - 1;
    let prev_log_term = if prev_log_index >= 0 {
        raft.log.term_at(prev_log_index).unwrap_or(0)
    } else {
        0
    };
    let entries: Vec<_> = raft.log.iterate(next.max(0) as u64).cloned().collect();
    let content = AppendEntriesContent {
        leader_id: raft.address.clone(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit: raft.state.commit_index,
    };
    crate::message::Envelope::raft(
        raft.address.clone(),
        peer.clone(),
        MessageType::AppendEntries,
        raft.state.current_term,
        content,
    )
}

fn broadcast_append_entries(raft: &Raft<Leader>, out: &mut Outbound) {
    for peer in &raft.peers {
        out.push(append_entries_for(raft, peer));
    }
}

pub fn broadcast_heartbeat(raft: Raft<Leader>) -> (RaftHandle, Outbound) {
    let mut out = Vec::new();
    broadcast_append_entries(&raft, &mut out);
    (RaftHandle::Leader(raft), out)
}

/// Appends a new entry for a client proposal and immediately replicates
/// it to every peer.
pub fn propose(mut raft: Raft<Leader>, payload: String) -> (RaftHandle, Outbound, ProposeOutcome) {
    let index = raft.last_log_index() + 1;
    let term = raft.state.current_term;
    raft.log.append(build_entry(term, index, payload));

    let mut out = Vec::new();
    broadcast_append_entries(&raft, &mut out);

    if raft.peers.is_empty() {
        raft.state.commit_index = raft.last_log_index();
        apply_committed(&mut raft);
    }

    (RaftHandle::Leader(raft), out, ProposeOutcome::Appended { index, term })
}

pub fn handle_append_response(
    mut raft: Raft<Leader>,
    from: &Address,
    content: &AppendResponseContent,
) -> (RaftHandle, Outbound) {
    let mut out = Vec::new();

    if content.success {
        raft.role.match_index.insert(from.clone(), content.index);
        raft.role.next_index.insert(from.clone(), content.index + 1);

        let mut matches: Vec<LogIndex> = raft.peers.iter()
            .map(|p| *raft.role.match_index.get(p).unwrap_or(&-1))
            .collect();
        matches.push(raft.last_log_index());
        matches.sort_unstable();

        let quorum = quorum_for(raft.peers.len() + 1);
        let majority_index = matches[matches.len() - quorum];

        if majority_index > raft.state.commit_index {
            if raft.log.term_at(majority_index) == Some(raft.state.current_term) {
                raft.state.commit_index = majority_index;
                apply_committed(&mut raft);
            }
        }
    } else {
        let next = *raft.role.next_index.get(from).unwrap_or(&0);
        raft.role.next_index.insert(from.clone(), (next - 1).max(0));
        out.push(append_entries_for(&raft, from));
    }

    (RaftHandle::Leader(raft), out)
}
