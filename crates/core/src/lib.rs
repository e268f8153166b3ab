//! Core building blocks shared by the relay and the client.
//!
//! - `fsm`: interaction states, events, and the observer-notifying dispatcher.
//! - `assembler`: reassembly of segmented audio traces.
//! - `turn_client`: one streaming upstream request per dialogue turn.
//! - `wakeword`: fuzzy trigger-phrase matching.
//! - `protocol`: the client/relay message envelope.

pub mod assembler;
pub mod fsm;
pub mod protocol;
pub mod turn_client;
pub mod wakeword;

pub use tokio_util::sync::CancellationToken;
