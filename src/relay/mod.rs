//! # Relay
//!
//! The two cooperating roles of a relay session:
//! - **session**: the session manager that accepts browser connections and binds each
//!   one to exactly one upstream connection
//! - **pump**: the forwarding and close-translation state machine for a single session

pub mod pump;
pub mod session;

pub use pump::{ClientFrame, CloseFrame, RelayAction, RelayPump, RelayStats, UpstreamPhase};
pub use session::SessionManager;
