pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod model;
pub mod orchestrator;
pub mod resource;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod utils;

pub use error::{OrchestratorError, Result};
