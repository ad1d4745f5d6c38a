//! Colony module
//!
//! A [`Colony`] hatches and tracks [`Drone`]s, each an independent LLM
//! session with its own status, history and notifications.

mod drone;
mod registry;
mod types;

pub use drone::*;
pub use registry::*;
pub use types::*;
