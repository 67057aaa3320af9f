pub mod agent_result;
pub mod phase;
pub mod state;

pub use agent_result::{AgentResult, ResultStatus, Usage};
pub use phase::{Phase, SubPhase, progress_key};
pub use state::{
  AgentAssignment, CircuitBreakers, Finding, Mode, Priority, ProjectState, RecoveryMeta, SubTeam,
  TeamStatus, TripReason,
};
