//! The follower role. Followers are passive: they only ever react to
//! `RequestVote`/`AppendEntries` (handled generically in `raft::mod`) or
//! time out into a candidacy.

/// Marker type — a follower carries no role-specific state beyond what's
/// already on `Raft<S>` (`leader_id`, `voted_for`).
pub struct Follower;
