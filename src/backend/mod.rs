//! The supervised backend process.

pub mod reader;
mod state;
pub mod supervisor;

pub use reader::{DiagnosticSource, LineRead, Liveness, StreamEvent};
pub use state::BackendState;
pub use supervisor::{
    BackendHandle, ProcessSupervisor, ShutdownReport, ShutdownStep, SupervisorSettings,
};
