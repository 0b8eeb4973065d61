//! Task runner composing worktree isolation with resilient code generation.

mod dispatcher;
mod generator;

pub use dispatcher::{DispatchReport, TaskDispatcher, TaskOutcome, TaskSpec};
pub use generator::{CodeGenerator, GenerationContext, GenerationOutput};
