//! Activity abstractions
//!
//! Activities are the side-effecting steps scheduled by workflows and
//! executed by the runtime's worker pool. An activity's first recorded
//! result is what replay feeds back to the workflow.

mod context;
mod definition;
mod registry;

pub use context::ActivityContext;
pub use definition::{Activity, ActivityError};
pub use registry::{ActivityRegistry, AnyActivity};
