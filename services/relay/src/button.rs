//! Hardware button edges.
//!
//! A button source reports pressed/released *levels*; the relay only cares
//! about *edges*. [`EdgeDetector`] turns one into the other, and edges are
//! broadcast to every connected client.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voxrelay_core::protocol::ServerEvent;

/// A change in the button's pressed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEdge {
    Down,
    Up,
}

impl From<ButtonEdge> for ServerEvent {
    fn from(edge: ButtonEdge) -> Self {
        match edge {
            ButtonEdge::Down => ServerEvent::ButtonDown,
            ButtonEdge::Up => ServerEvent::ButtonUp,
        }
    }
}

/// Emits an edge only when the observed level differs from the last one.
#[derive(Debug, Default)]
pub struct EdgeDetector {
    pressed: bool,
}

impl EdgeDetector {
    pub fn observe(&mut self, pressed: bool) -> Option<ButtonEdge> {
        let edge = match (self.pressed, pressed) {
            (false, true) => Some(ButtonEdge::Down),
            (true, false) => Some(ButtonEdge::Up),
            _ => None,
        };
        self.pressed = pressed;
        edge
    }
}

fn parse_level(line: &str) -> Option<bool> {
    match line.trim().to_lowercase().as_str() {
        "down" | "1" | "press" => Some(true),
        "up" | "0" | "release" => Some(false),
        _ => None,
    }
}

/// Reads button levels from `reader`, one per line, and broadcasts edges.
pub fn spawn_line_source<R>(reader: R, edges: broadcast::Sender<ButtonEdge>) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        let mut detector = EdgeDetector::default();
        info!("Button line source started");
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some(level) = parse_level(&line) else {
                        debug!(%line, "Ignoring unrecognized button input");
                        continue;
                    };
                    if let Some(edge) = detector.observe(level) {
                        // No receivers just means no client is connected yet.
                        let _ = edges.send(edge);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Button source read failed");
                    break;
                }
            }
        }
        info!("Button line source closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_only_on_level_change() {
        let mut detector = EdgeDetector::default();
        assert_eq!(detector.observe(false), None);
        assert_eq!(detector.observe(true), Some(ButtonEdge::Down));
        assert_eq!(detector.observe(true), None);
        assert_eq!(detector.observe(false), Some(ButtonEdge::Up));
        assert_eq!(detector.observe(false), None);
    }

    #[tokio::test]
    async fn test_line_source_broadcasts_edges() {
        let (tx, mut rx) = broadcast::channel(8);
        let input: &[u8] = b"down\ndown\nnoise\nup\n1\n";
        spawn_line_source(input, tx).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), ButtonEdge::Down);
        assert_eq!(rx.recv().await.unwrap(), ButtonEdge::Up);
        assert_eq!(rx.recv().await.unwrap(), ButtonEdge::Down);
        assert!(rx.try_recv().is_err());
    }
}
