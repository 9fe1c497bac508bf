//! Agent module
//!
//! Connection lifecycle: state, backoff, the session workers and the
//! supervisor that ties them together.

pub mod backoff;
pub mod dispatch;
pub mod heartbeat;
pub mod identity;
pub mod state;
pub mod supervisor;
