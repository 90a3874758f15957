use serde::Serialize;

use crate::error::InvalidTransition;
use crate::raft::state::{ElectionState, NodeId, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// A replicated log entry. Its payload is opaque to the election core and is
/// handed to the storage layer once replication is in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// An empty AppendEntries, used only to hold off follower elections.
    pub fn heartbeat(term: u64, leader_id: NodeId) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

/// Reply to an RPC together with the role change it caused.
///
/// The receiver rules only touch term/vote/role; the node owning the timers
/// uses `stepped_down_from` and `leader_contact` to cancel or re-arm them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled<R> {
    pub reply: R,
    /// Role this node left because of the RPC, if any
    pub stepped_down_from: Option<Role>,
    /// The RPC came from the legitimate leader of the current term
    pub leader_contact: bool,
}

impl<R> Handled<R> {
    fn reply(reply: R) -> Self {
        Self {
            reply,
            stepped_down_from: None,
            leader_contact: false,
        }
    }
}

/// Handle RequestVote RPC
pub fn handle_request_vote(
    state: &mut ElectionState,
    req: &VoteRequest,
    my_id: NodeId,
) -> Result<Handled<VoteResponse>, InvalidTransition> {
    let reject = |state: &ElectionState| VoteResponse {
        term: state.current_term,
        vote_granted: false,
    };

    if req.term < state.current_term {
        tracing::debug!(
            node_id = my_id,
            candidate = req.candidate_id,
            term = req.term,
            current_term = state.current_term,
            "RequestVote rejected, stale candidate"
        );
        return Ok(Handled::reply(reject(state)));
    }

    if state.voted_for.is_some() && req.term == state.current_term {
        tracing::debug!(
            node_id = my_id,
            candidate = req.candidate_id,
            term = req.term,
            voted_for = ?state.voted_for,
            "RequestVote rejected, already voted this term"
        );
        return Ok(Handled::reply(reject(state)));
    }

    let mut stepped_down_from = None;
    if state.observe_term(req.term) {
        stepped_down_from = state.step_down()?;
    }

    state.voted_for = Some(req.candidate_id);
    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        "RequestVote granted"
    );

    Ok(Handled {
        reply: VoteResponse {
            term: state.current_term,
            vote_granted: true,
        },
        stepped_down_from,
        leader_contact: false,
    })
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut ElectionState,
    req: &AppendEntriesRequest,
    my_id: NodeId,
) -> Result<Handled<AppendEntriesResponse>, InvalidTransition> {
    if req.term < state.current_term {
        tracing::debug!(
            node_id = my_id,
            leader = req.leader_id,
            term = req.term,
            current_term = state.current_term,
            "AppendEntries rejected, stale leader"
        );
        return Ok(Handled::reply(AppendEntriesResponse {
            term: state.current_term,
            success: false,
        }));
    }

    if state.observe_term(req.term) {
        let stepped_down_from = state.step_down()?;
        if stepped_down_from.is_some() {
            // The sender retries on its next heartbeat, now at a matching term.
            tracing::info!(
                node_id = my_id,
                leader = req.leader_id,
                term = req.term,
                "Higher term seen in AppendEntries, stepping down"
            );
            return Ok(Handled {
                reply: AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                },
                stepped_down_from,
                leader_contact: false,
            });
        }
    }

    let mut stepped_down_from = None;
    match state.role() {
        Role::Candidate => {
            // Another node already won this term.
            stepped_down_from = state.step_down()?;
            state.leader_id = Some(req.leader_id);
        }
        Role::Leader => {
            tracing::warn!(
                node_id = my_id,
                leader = req.leader_id,
                term = req.term,
                "AppendEntries from another leader in the same term"
            );
        }
        Role::Follower => {
            state.leader_id = Some(req.leader_id);
        }
    }

    if req.is_heartbeat() {
        tracing::trace!(node_id = my_id, leader = req.leader_id, term = req.term, "Heartbeat received");
    } else {
        // Entries are accepted but not stored; replication lives in the storage layer.
        tracing::debug!(
            node_id = my_id,
            leader = req.leader_id,
            entries = req.entries.len(),
            "AppendEntries carrying entries received"
        );
    }

    Ok(Handled {
        reply: AppendEntriesResponse {
            term: state.current_term,
            success: true,
        },
        stepped_down_from,
        leader_contact: true,
    })
}
