pub mod agents;
pub mod config;
pub mod engine;
pub mod error;
pub mod instructions;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod shared_context;
pub mod spawn;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use agents::*;
pub use config::*;
pub use engine::*;
pub use error::{OrchestratorError, Result};
pub use instructions::*;
pub use pipeline::*;
pub use pool::*;
pub use progress::*;
pub use queue::*;
pub use scheduler::*;
pub use shared_context::*;
pub use spawn::*;
pub use store::*;
pub use types::*;
