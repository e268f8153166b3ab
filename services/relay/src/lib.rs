//! Voxrelay Relay Library Crate
//!
//! This library contains the relay service's logic: configuration, shared
//! state, the WebSocket session handling that forwards upstream dialogue
//! turns, button-edge broadcasting, and routing. The `relay` binary is a
//! thin wrapper around this library.

pub mod button;
pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
