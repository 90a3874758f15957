use std::time::Duration;

use crate::error::{RaftError, Result};

/// Timing and protocol tunables shared by every node of a cluster.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Lower bound of the randomized election interval
    pub election_timeout_min_ms: u64,
    /// Upper bound (inclusive) of the randomized election interval
    pub election_timeout_max_ms: u64,
    /// Period of the leader heartbeat
    pub heartbeat_interval_ms: u64,
    /// Bound on a single peer RPC inside an election or heartbeat round.
    /// A peer that does not answer in time counts as a rejection.
    pub rpc_timeout_ms: u64,
    /// When true, a candidate or leader that sees a higher term in a reply
    /// adopts it and steps down. When false, reply terms are only logged and
    /// the term is updated solely by incoming RPCs.
    pub adopt_reply_term: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            adopt_reply_term: true,
        }
    }
}

impl RaftConfig {
    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = timeout_ms;
        self
    }

    pub fn with_adopt_reply_term(mut self, adopt: bool) -> Self {
        self.adopt_reply_term = adopt;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Check that the timing values can drive a stable cluster.
    ///
    /// # Errors
    ///
    /// Returns `RaftError::Config` if the election range is empty or inverted,
    /// if any interval is zero, or if heartbeats are not strictly more frequent
    /// than the shortest election timeout.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0 {
            return Err(RaftError::Config(
                "election_timeout_min_ms must be greater than 0".to_string(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::Config(format!(
                "election timeout range is inverted: {}..={}",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.rpc_timeout_ms == 0 {
            return Err(RaftError::Config(
                "heartbeat_interval_ms and rpc_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(RaftError::Config(format!(
                "heartbeat interval {}ms must be shorter than the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        Ok(())
    }
}
