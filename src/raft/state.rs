use serde::Serialize;

use crate::error::InvalidTransition;

/// Stable identity of a cluster member.
pub type NodeId = u64;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    /// Roles reachable from `self` in a single step.
    pub fn allowed_transitions(self) -> &'static [Role] {
        match self {
            Role::Follower => &[Role::Follower, Role::Candidate],
            Role::Candidate => &[Role::Follower, Role::Candidate, Role::Leader],
            Role::Leader => &[Role::Follower],
        }
    }

    pub fn can_transition_to(self, target: Role) -> bool {
        self.allowed_transitions().contains(&target)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Guards the role of a single node. Starts as follower and never terminates.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: Role,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: Role::Follower,
        }
    }

    pub fn current(&self) -> Role {
        self.current
    }

    /// Move to `target` if the transition table allows it. On failure the
    /// current role is left untouched.
    pub fn next(&mut self, target: Role) -> Result<(), InvalidTransition> {
        if !self.current.can_transition_to(target) {
            return Err(InvalidTransition {
                from: self.current,
                to: target,
            });
        }
        self.current = target;
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Term, vote and role bookkeeping of one node.
///
/// This is the part of a node that the RPC receiver rules mutate. It holds no
/// timers; callers react to the role changes it reports.
///
/// # Invariants
///
/// - `current_term` never decreases.
/// - At most one `voted_for` per term: it is only overwritten when the term
///   changes or a new election is started by this node.
#[derive(Debug, Clone, Default)]
pub struct ElectionState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    /// Last node accepted as leader for `current_term`
    pub leader_id: Option<NodeId>,
    machine: StateMachine,
}

impl ElectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(&self) -> Role {
        self.machine.current()
    }

    pub fn transition(&mut self, target: Role) -> Result<(), InvalidTransition> {
        self.machine.next(target)
    }

    /// Adopt `term` if it is newer than ours. Returns true if it was adopted.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        true
    }

    /// Leave the leader or candidate role. Returns the role that was left,
    /// or `None` if this node already was a follower.
    pub fn step_down(&mut self) -> Result<Option<Role>, InvalidTransition> {
        let previous = self.role();
        if previous == Role::Follower {
            return Ok(None);
        }
        self.machine.next(Role::Follower)?;
        Ok(Some(previous))
    }

    /// Open a new term as candidate, voting for ourselves.
    pub fn become_candidate(&mut self, my_id: NodeId) -> Result<u64, InvalidTransition> {
        self.machine.next(Role::Candidate)?;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.leader_id = None;
        Ok(self.current_term)
    }

    pub fn become_leader(&mut self, my_id: NodeId) -> Result<(), InvalidTransition> {
        self.machine.next(Role::Leader)?;
        self.leader_id = Some(my_id);
        Ok(())
    }
}
