use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

use crate::cluster::Cluster;
use crate::config::RaftConfig;
use crate::error::{InvalidTransition, RaftError, Result};
use crate::raft::barrier::WaitGroup;
use crate::raft::rpc::{
    handle_append_entries, handle_request_vote, AppendEntriesRequest, AppendEntriesResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::state::{ElectionState, NodeId, Role};
use crate::raft::timer::{random_election_timeout, RepeatingTimer, TimerCallback};

/// Point-in-time view of a node, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_hint: Option<NodeId>,
    pub stopped: bool,
}

/// Everything guarded by the node mutex.
struct NodeInner {
    id: NodeId,
    election_timeout_min_ms: u64,
    election_timeout_max_ms: u64,
    election: ElectionState,
    stopped: bool,
    cluster: Weak<Cluster>,
    election_timer: RepeatingTimer,
    heartbeat_timer: RepeatingTimer,
    rng: StdRng,
}

impl NodeInner {
    /// Re-arm the election timer with a freshly drawn interval.
    fn reset_election_timer(&mut self) {
        let interval = random_election_timeout(
            &mut self.rng,
            self.election_timeout_min_ms,
            self.election_timeout_max_ms,
        );
        self.election_timer.set_interval(interval);
        self.election_timer.restart();
    }

    /// Cancel leader duties after the role was left.
    fn after_step_down(&mut self, stepped_down_from: Option<Role>) {
        if stepped_down_from == Some(Role::Leader) {
            self.heartbeat_timer.cancel();
        }
        if let Some(role) = stepped_down_from {
            tracing::info!(
                node_id = self.id,
                term = self.election.current_term,
                from = %role,
                "Switched to follower"
            );
        }
    }

    /// Leader or candidate to follower. Leaves the election timer schedule alone.
    fn switch_to_follower(&mut self) -> std::result::Result<(), InvalidTransition> {
        let stepped_down_from = self.election.step_down()?;
        self.after_step_down(stepped_down_from);
        Ok(())
    }

    /// Candidate to leader: election timer off, heartbeat timer on.
    fn switch_to_leader(&mut self) -> std::result::Result<(), InvalidTransition> {
        self.election.become_leader(self.id)?;
        self.election_timer.cancel();
        self.heartbeat_timer.start();
        Ok(())
    }

    fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.upgrade()
    }
}

/// One replica of the cluster: owns its term/vote state, its two timers and
/// the receiving side of the RequestVote and AppendEntries RPCs.
///
/// All mutable state sits behind a single mutex created with the node. RPC
/// handlers and timer firings hold it for their whole critical section.
/// Election and heartbeat rounds release it while peers are contacted and
/// re-check that the round is still current before applying its result.
pub struct Node {
    id: NodeId,
    config: RaftConfig,
    inner: Mutex<NodeInner>,
    timer_errors: AtomicU64,
}

impl Node {
    pub fn new(id: NodeId, config: RaftConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Node>| {
            let mut rng = StdRng::from_entropy();
            let election_interval = random_election_timeout(
                &mut rng,
                config.election_timeout_min_ms,
                config.election_timeout_max_ms,
            );

            let inner = NodeInner {
                id,
                election_timeout_min_ms: config.election_timeout_min_ms,
                election_timeout_max_ms: config.election_timeout_max_ms,
                election: ElectionState::new(),
                stopped: true,
                cluster: Weak::new(),
                election_timer: RepeatingTimer::new(
                    "election",
                    election_interval,
                    election_callback(weak.clone()),
                ),
                heartbeat_timer: RepeatingTimer::new(
                    "heartbeat",
                    config.heartbeat_interval(),
                    heartbeat_callback(weak.clone()),
                ),
                rng,
            };

            Self {
                id,
                config,
                inner: Mutex::new(inner),
                timer_errors: AtomicU64::new(0),
            }
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Number of timer firings that ended in an error. Stays at zero as long
    /// as every timer is cancelled when its role is left.
    pub fn timer_errors(&self) -> u64 {
        self.timer_errors.load(Ordering::Relaxed)
    }

    fn record_timer_error(&self, timer: &'static str, error: &RaftError) {
        self.timer_errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(node_id = self.id, timer, error = %error, "Timer fired in an invalid state");
    }

    /// Arm the node: bind it to `cluster`, accept RPCs and start the election
    /// timer. Term and vote are kept. Calling it on a running leader only
    /// rebinds the cluster.
    pub async fn start(&self, cluster: &Arc<Cluster>) {
        let mut inner = self.inner.lock().await;
        inner.cluster = Arc::downgrade(cluster);
        let was_stopped = inner.stopped;
        inner.stopped = false;

        if !was_stopped && inner.election.role() == Role::Leader {
            tracing::debug!(node_id = self.id, "Start on a running leader, cluster rebound");
            return;
        }

        inner.reset_election_timer();
        tracing::info!(
            node_id = self.id,
            term = inner.election.current_term,
            election_ms = inner.election_timer.interval().as_millis() as u64,
            "Node started"
        );
    }

    /// Disarm the node: cancel both timers, fall back to follower and decline
    /// all RPCs until the next `start`.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.stopped = true;
        inner.election_timer.cancel();
        inner.heartbeat_timer.cancel();
        if let Err(e) = inner.switch_to_follower() {
            tracing::warn!(node_id = self.id, error = %e, "Could not force follower on stop");
        }
        tracing::info!(node_id = self.id, term = inner.election.current_term, "Node stopped");
    }

    /// Run one election round now.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolInvariantViolation` if the node is leader: a leader
    /// never has a live election timer.
    pub async fn election_timeout(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        self.run_election(inner).await
    }

    /// Run one heartbeat round now.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolInvariantViolation` if the node is not leader.
    pub async fn heartbeat_timeout(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        self.run_heartbeat(inner).await
    }

    /// Leader or candidate to follower. A leader stops sending heartbeats.
    pub async fn switch_to_follower(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.switch_to_follower()?;
        Ok(())
    }

    /// Candidate to leader. Fails with `InvalidTransition` from any other role.
    pub async fn switch_to_leader(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.switch_to_leader()?;
        tracing::info!(node_id = self.id, term = inner.election.current_term, "Became leader");
        Ok(())
    }

    /// Handle incoming RequestVote RPC
    pub async fn request_vote(&self, req: VoteRequest) -> VoteResponse {
        let mut inner = self.inner.lock().await;
        if inner.stopped {
            return VoteResponse {
                term: inner.election.current_term,
                vote_granted: false,
            };
        }

        match handle_request_vote(&mut inner.election, &req, self.id) {
            Ok(handled) => {
                inner.after_step_down(handled.stepped_down_from);
                // A live candidate means the cluster is active; push our own
                // deadline back.
                if inner.election.role() != Role::Leader {
                    inner.reset_election_timer();
                }
                handled.reply
            }
            Err(e) => {
                tracing::error!(node_id = self.id, error = %e, "RequestVote left node in an invalid role");
                VoteResponse {
                    term: inner.election.current_term,
                    vote_granted: false,
                }
            }
        }
    }

    /// Handle incoming AppendEntries RPC
    pub async fn append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut inner = self.inner.lock().await;
        if inner.stopped {
            return AppendEntriesResponse {
                term: inner.election.current_term,
                success: false,
            };
        }

        match handle_append_entries(&mut inner.election, &req, self.id) {
            Ok(handled) => {
                inner.after_step_down(handled.stepped_down_from);
                let rearm = handled.leader_contact || handled.stepped_down_from.is_some();
                if rearm && inner.election.role() != Role::Leader {
                    inner.reset_election_timer();
                }
                handled.reply
            }
            Err(e) => {
                tracing::error!(node_id = self.id, error = %e, "AppendEntries left node in an invalid role");
                AppendEntriesResponse {
                    term: inner.election.current_term,
                    success: false,
                }
            }
        }
    }

    pub async fn role(&self) -> Role {
        self.inner.lock().await.election.role()
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == Role::Leader
    }

    pub async fn is_follower(&self) -> bool {
        self.role().await == Role::Follower
    }

    pub async fn is_candidate(&self) -> bool {
        self.role().await == Role::Candidate
    }

    pub async fn current_term(&self) -> u64 {
        self.inner.lock().await.election.current_term
    }

    pub async fn voted_for(&self) -> Option<NodeId> {
        self.inner.lock().await.election.voted_for
    }

    /// Last node this one accepted AppendEntries from in the current term.
    pub async fn leader_hint(&self) -> Option<NodeId> {
        self.inner.lock().await.election.leader_id
    }

    pub async fn is_stopped(&self) -> bool {
        self.inner.lock().await.stopped
    }

    /// Interval of the most recent election timer arming.
    pub async fn election_interval(&self) -> Duration {
        self.inner.lock().await.election_timer.interval()
    }

    pub async fn snapshot(&self) -> NodeStatus {
        let inner = self.inner.lock().await;
        NodeStatus {
            id: self.id,
            role: inner.election.role(),
            term: inner.election.current_term,
            voted_for: inner.election.voted_for,
            leader_hint: inner.election.leader_id,
            stopped: inner.stopped,
        }
    }

    async fn on_election_timer(&self, generation: u64) -> Result<()> {
        let inner = self.inner.lock().await;
        if inner.stopped || !inner.election_timer.is_current(generation) {
            return Ok(());
        }
        self.run_election(inner).await
    }

    async fn on_heartbeat_timer(&self, generation: u64) -> Result<()> {
        let inner = self.inner.lock().await;
        if inner.stopped || !inner.heartbeat_timer.is_current(generation) {
            return Ok(());
        }
        self.run_heartbeat(inner).await
    }

    async fn run_election(&self, mut inner: MutexGuard<'_, NodeInner>) -> Result<()> {
        if inner.stopped {
            return Ok(());
        }
        if inner.election.role() == Role::Leader {
            return Err(RaftError::ProtocolInvariantViolation(format!(
                "election timeout on node {} while leader in term {}",
                self.id, inner.election.current_term
            )));
        }

        let Some(cluster) = inner.cluster() else {
            tracing::warn!(node_id = self.id, "Election timeout without a cluster, staying follower");
            inner.switch_to_follower()?;
            return Ok(());
        };

        let term = inner.election.become_candidate(self.id)?;
        let peers = cluster.get_remote_followers(self.id);
        let members = cluster.len();
        drop(cluster);
        drop(inner);

        tracing::info!(node_id = self.id, term, peers = peers.len(), "Starting election");

        let req = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: 0,
            last_log_term: 0,
        };
        let replies = self
            .broadcast(&peers, move |peer| async move { peer.request_vote(req).await })
            .await;

        let mut inner = self.inner.lock().await;
        if inner.stopped
            || inner.election.current_term != term
            || inner.election.role() != Role::Candidate
        {
            tracing::debug!(
                node_id = self.id,
                term,
                current_term = inner.election.current_term,
                role = %inner.election.role(),
                "Election round outdated, result discarded"
            );
            return Ok(());
        }

        let highest_term = replies.iter().map(|r| r.term).max().unwrap_or(term);
        if highest_term > term {
            if self.config.adopt_reply_term {
                tracing::info!(
                    node_id = self.id,
                    term,
                    reply_term = highest_term,
                    "Higher term in vote reply, abandoning election"
                );
                inner.election.observe_term(highest_term);
                inner.switch_to_follower()?;
                inner.reset_election_timer();
                return Ok(());
            }
            tracing::debug!(
                node_id = self.id,
                term,
                reply_term = highest_term,
                "Higher term in vote reply ignored"
            );
        }

        let votes = 1 + replies.iter().filter(|r| r.vote_granted).count();
        if votes > members / 2 {
            inner.switch_to_leader()?;
            tracing::info!(node_id = self.id, term, votes, members, "Became leader");
        } else {
            inner.switch_to_follower()?;
            inner.reset_election_timer();
            tracing::debug!(
                node_id = self.id,
                term,
                votes,
                needed = members / 2 + 1,
                "Election failed, not enough votes"
            );
        }
        Ok(())
    }

    async fn run_heartbeat(&self, inner: MutexGuard<'_, NodeInner>) -> Result<()> {
        if inner.stopped {
            return Ok(());
        }
        if inner.election.role() != Role::Leader {
            return Err(RaftError::ProtocolInvariantViolation(format!(
                "heartbeat timeout on node {} while {} in term {}",
                self.id,
                inner.election.role(),
                inner.election.current_term
            )));
        }

        let term = inner.election.current_term;
        let peers = inner
            .cluster()
            .map(|cluster| cluster.get_remote_followers(self.id))
            .unwrap_or_default();
        if peers.is_empty() {
            tracing::trace!(node_id = self.id, term, "No peers, heartbeat round skipped");
            return Ok(());
        }
        drop(inner);

        let req = AppendEntriesRequest::heartbeat(term, self.id);
        let replies = self
            .broadcast(&peers, move |peer| {
                let req = req.clone();
                async move { peer.append_entries(req).await }
            })
            .await;

        let acked = replies.iter().filter(|r| r.success).count();
        tracing::trace!(node_id = self.id, term, acked, peers = peers.len(), "Heartbeat round done");

        let highest_term = replies.iter().map(|r| r.term).max().unwrap_or(term);
        if highest_term <= term {
            return Ok(());
        }
        if !self.config.adopt_reply_term {
            tracing::debug!(
                node_id = self.id,
                term,
                reply_term = highest_term,
                "Higher term in heartbeat reply ignored"
            );
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if !inner.stopped
            && inner.election.current_term == term
            && inner.election.role() == Role::Leader
        {
            tracing::info!(
                node_id = self.id,
                term,
                reply_term = highest_term,
                "Higher term in heartbeat reply, stepping down"
            );
            inner.election.observe_term(highest_term);
            inner.switch_to_follower()?;
            inner.reset_election_timer();
        }
        Ok(())
    }

    /// Send one RPC per peer concurrently and wait for all of them. Calls that
    /// exceed `rpc_timeout` are dropped from the result.
    async fn broadcast<R, F, Fut>(&self, peers: &[Arc<Node>], call: F) -> Vec<R>
    where
        F: Fn(Arc<Node>) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let wait_group = Arc::new(WaitGroup::new());
        let replies = Arc::new(Mutex::new(Vec::with_capacity(peers.len())));
        let rpc_timeout = self.config.rpc_timeout();

        wait_group.add(peers.len());
        for peer in peers {
            let node_id = self.id;
            let peer_id = peer.id();
            let rpc = timeout(rpc_timeout, call(peer.clone()));
            let wait_group = wait_group.clone();
            let replies = replies.clone();

            tokio::spawn(async move {
                match rpc.await {
                    Ok(reply) => replies.lock().await.push(reply),
                    Err(_) => tracing::warn!(node_id, peer_id, "RPC to peer timed out"),
                }
                wait_group.done();
            });
        }
        wait_group.wait().await;

        let mut replies = replies.lock().await;
        std::mem::take(&mut *replies)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("id", &self.id).finish_non_exhaustive()
    }
}

fn election_callback(node: Weak<Node>) -> TimerCallback {
    Arc::new(move |generation| {
        let node = node.clone();
        Box::pin(async move {
            let Some(node) = node.upgrade() else {
                return;
            };
            if let Err(e) = node.on_election_timer(generation).await {
                node.record_timer_error("election", &e);
            }
        })
    })
}

fn heartbeat_callback(node: Weak<Node>) -> TimerCallback {
    Arc::new(move |generation| {
        let node = node.clone();
        Box::pin(async move {
            let Some(node) = node.upgrade() else {
                return;
            };
            if let Err(e) = node.on_heartbeat_timer(generation).await {
                node.record_timer_error("heartbeat", &e);
            }
        })
    })
}
