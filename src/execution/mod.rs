//! Execution layer: program description, stream redirection and process launch

pub mod io;
pub mod process;
pub mod program;

pub use io::{IoPlan, RedirectTargets};
pub use process::{ChildStage, ExitReport, LiveHandle, ProcessLauncher, Termination};
pub use program::{ProgramDescriptor, ResolvedProgram};
