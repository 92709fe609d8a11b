//! Configuration entities. Pure data plus validation; behaviour lives in the
//! services that own them.

pub mod group;
pub mod launch;
pub mod server;
pub mod task;

pub use group::Group;
pub use launch::{LaunchConfig, LaunchMode};
pub use server::{Server, ServerPatch};
pub use task::{ScheduledTask, TaskType};
