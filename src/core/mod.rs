//! 核心编排层：错误、会话状态、过程事件、状态机驱动与构建器

pub mod builder;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod state;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use error::AgentError;
pub use events::{EventSink, SessionEvent};
pub use orchestrator::{Orchestrator, SessionReport};
pub use state::{Evaluation, ExecutionRecord, SessionOutcome, SessionPhase, SessionState};
