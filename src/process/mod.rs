//! Process supervision seam and its two implementations.

mod pipe;
mod scripted;
mod traits;

pub use pipe::PipeSupervisor;
pub use scripted::ScriptedSupervisor;
pub use traits::{BoxFuture, ProcessSupervisor};
