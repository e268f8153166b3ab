//! WebSocket Session Management
//!
//! This module contains the relay's real-time session logic:
//!
//! - `registry`: Per-connection turn handles and audio assemblers.
//! - `session`: Manages the WebSocket connection lifecycle, from upgrade to close.
//! - `turn`: Forwards one upstream turn's events to the client.

pub mod registry;
pub mod session;
pub mod turn;

pub use registry::{SessionRegistry, TurnTicket};
pub use session::ws_handler;
