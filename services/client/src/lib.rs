//! Voice interaction client for the voxrelay relay.
//!
//! - `session`: the coordinator tying the state machine to capture, playback
//!   and the relay link.
//! - `recognition`: single-active speech capture and the wake-word loop.
//! - `playback`: token-guarded playback and the sequential playback queue.
//! - `capability`: traits for the device capabilities.
//! - `transport`: the WebSocket link to the relay.
//! - `console`: console and external-player stand-ins for the capabilities.
//! - `config`: command-line configuration.

pub mod capability;
pub mod config;
pub mod console;
pub mod playback;
pub mod recognition;
pub mod session;
pub mod transport;
