use crate::session::SessionSettings;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use voxrelay_core::wakeword::{DEFAULT_MAX_DISTANCE, TriggerSet};

/// Voice interaction client for the voxrelay relay.
#[derive(Debug, Clone, Parser)]
#[command(name = "client", version, about)]
pub struct ClientConfig {
    /// WebSocket URL of the relay.
    #[arg(long, env = "RELAY_URL", default_value = "ws://localhost:3001/", value_parser = parse_relay_url)]
    pub relay_url: String,

    /// User id sent with every turn.
    #[arg(long, env = "CLIENT_USER_ID", default_value = "voxrelay")]
    pub user_id: String,

    /// Listen for a wake word while in standby.
    #[arg(long, env = "WAKE_WORD")]
    pub wake_word: bool,

    /// Trigger phrase; may be repeated. Replaces the built-in phrases.
    #[arg(long = "trigger")]
    pub triggers: Vec<String>,

    /// Largest edit distance that still counts as a trigger match.
    #[arg(long, default_value_t = DEFAULT_MAX_DISTANCE)]
    pub trigger_distance: usize,

    /// Directory for reply audio handed to the player.
    #[arg(long, env = "SPOOL_DIR")]
    pub spool_dir: Option<PathBuf>,

    /// External player command, e.g. "mpv --no-video". Without one, replies
    /// are written to the spool directory and timed silently.
    #[arg(long, env = "AUDIO_PLAYER")]
    pub player: Option<String>,

    /// Slack added to a reply's duration before playback is given up on.
    #[arg(long, default_value_t = 1500)]
    pub playback_margin_ms: u64,

    /// Pause before reconnecting after the relay link drops.
    #[arg(long, default_value_t = 2000)]
    pub reconnect_delay_ms: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    pub log_level: tracing::Level,
}

fn parse_relay_url(raw: &str) -> Result<String, String> {
    if raw.starts_with("ws://") || raw.starts_with("wss://") {
        Ok(raw.to_string())
    } else {
        Err(format!("'{raw}' is not a ws:// or wss:// URL"))
    }
}

impl ClientConfig {
    pub fn trigger_set(&self) -> TriggerSet {
        let set = if self.triggers.is_empty() {
            TriggerSet::default()
        } else {
            TriggerSet::new(&self.triggers)
        };
        set.with_max_distance(self.trigger_distance)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            user_id: self.user_id.clone(),
            wake_word: self.wake_word,
            triggers: self.trigger_set(),
        }
    }

    pub fn playback_margin(&self) -> Duration {
        Duration::from_millis(self.playback_margin_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("voxrelay-client"))
    }
}
