pub mod agent;
pub mod execution;
pub mod flow;

pub use agent::{AgentHealth, AgentRecord, AgentType};
pub use execution::{
    AgentMessage, ExecutionContext, ExecutionStatus, NodeResult, NodeStatus, StoreMetrics,
};
pub use flow::{FlowDefinition, MergeStrategy, NodeKind, NodeSpec};
