pub mod barrier;
pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use barrier::WaitGroup;
pub use node::{Node, NodeStatus};
pub use rpc::{AppendEntriesRequest, AppendEntriesResponse, LogEntry, VoteRequest, VoteResponse};
pub use state::{ElectionState, NodeId, Role, StateMachine};
pub use timer::RepeatingTimer;
