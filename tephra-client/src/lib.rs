//! Build orchestrator: wires the format parsers, the mirror pool, and
//! the resolver into an openable build session.

mod error;
mod session;

pub use error::{Error, Result};
pub use session::{BuildSession, SessionConfig};
