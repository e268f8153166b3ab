//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like the upstream turn client and session registry.

use crate::{button::ButtonEdge, config::Config, ws::SessionRegistry};
use std::sync::Arc;
use tokio::sync::broadcast;
use voxrelay_core::turn_client::TurnStream;

/// Button edges buffered per client before older ones are dropped.
pub const BUTTON_CHANNEL_CAPACITY: usize = 32;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub turns: Arc<dyn TurnStream>,
    pub registry: SessionRegistry,
    pub buttons: broadcast::Sender<ButtonEdge>,
}

impl AppState {
    pub fn new(config: Config, turns: Arc<dyn TurnStream>) -> Self {
        let (buttons, _) = broadcast::channel(BUTTON_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            turns,
            registry: SessionRegistry::new(),
            buttons,
        }
    }
}
