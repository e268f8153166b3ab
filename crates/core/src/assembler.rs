//! Audio Chunk Assembler
//!
//! The dialogue engine streams synthesized speech either as a single direct
//! reference (`payload.audio.src`) or as a bracketed run of segmented trace
//! frames: `start`, any number of base64 `content` frames, then `end`. This
//! module folds the segmented form back into one consolidated trace so the
//! client only ever sees whole audio artifacts.

use base64::Engine;
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Encoding reported when none of the segments named one.
pub const DEFAULT_AUDIO_ENCODING: &str = "audio/mp3";

/// Position of a segmented audio frame inside its bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Start,
    Content,
    End,
}

impl SegmentState {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(SegmentState::Start),
            "content" => Some(SegmentState::Content),
            "end" => Some(SegmentState::End),
            _ => None,
        }
    }
}

/// How a trace payload relates to audio assembly.
#[derive(Debug, PartialEq)]
pub enum AudioFrame<'a> {
    /// A playable reference that bypasses assembly.
    DirectReference(&'a str),
    /// One frame of a segmented run.
    Segment {
        state: SegmentState,
        encoding: Option<&'a str>,
        content: Option<&'a str>,
    },
    /// Anything else; forwarded untouched.
    Other,
}

impl<'a> AudioFrame<'a> {
    /// Classifies a trace's data object.
    pub fn classify(trace: &'a Value) -> Self {
        let payload = &trace["payload"];
        if let Some(src) = payload["audio"]["src"].as_str() {
            return AudioFrame::DirectReference(src);
        }
        if trace["type"].as_str() != Some("audio") || !payload.is_object() {
            return AudioFrame::Other;
        }
        match payload["state"].as_str().and_then(SegmentState::parse) {
            Some(state) => AudioFrame::Segment {
                state,
                encoding: payload["encoding"].as_str(),
                content: payload["content"].as_str(),
            },
            None => AudioFrame::Other,
        }
    }
}

/// Binary segments collected between a `start` and an `end` frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AudioAccumulator {
    chunks: Vec<Vec<u8>>,
    encoding: Option<String>,
}

impl AudioAccumulator {
    fn push(&mut self, chunk: Vec<u8>, encoding: Option<&str>) {
        if self.encoding.is_none() {
            self.encoding = encoding.map(str::to_string);
        }
        self.chunks.push(chunk);
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    fn into_trace(self) -> Value {
        let total = self.byte_len();
        let mut audio = Vec::with_capacity(total);
        for chunk in self.chunks {
            audio.extend_from_slice(&chunk);
        }
        json!({
            "type": "audio",
            "payload": {
                "encoding": self.encoding.as_deref().unwrap_or(DEFAULT_AUDIO_ENCODING),
                "content": base64::engine::general_purpose::STANDARD.encode(&audio),
            }
        })
    }
}

/// Per-session reassembler for segmented audio traces.
#[derive(Debug, Default)]
pub struct AudioChunkAssembler {
    accumulator: Option<AudioAccumulator>,
}

impl AudioChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `start` has been seen without its matching `end`.
    pub fn is_open(&self) -> bool {
        self.accumulator.is_some()
    }

    /// Discards any in-progress accumulation.
    pub fn reset(&mut self) {
        if let Some(acc) = self.accumulator.take() {
            debug!(chunks = acc.chunk_count(), "Discarding pending audio segments");
        }
    }

    /// Feeds one trace and returns the trace to forward, if any.
    ///
    /// Segment frames are never returned as-is: `start` and `content` are
    /// absorbed, and `end` yields the consolidated artifact (or nothing when
    /// the bracket was empty).
    pub fn accept(&mut self, trace: Value) -> Option<Value> {
        match AudioFrame::classify(&trace) {
            AudioFrame::DirectReference(_) => {
                self.reset();
                Some(trace)
            }
            AudioFrame::Other => Some(trace),
            AudioFrame::Segment {
                state: SegmentState::Start,
                ..
            } => {
                if self.is_open() {
                    debug!("Audio start received while a bracket was open; restarting");
                }
                self.accumulator = Some(AudioAccumulator::default());
                debug!("Audio streaming started");
                None
            }
            AudioFrame::Segment {
                state: SegmentState::Content,
                encoding,
                content,
            } => {
                let (Some(acc), Some(content)) = (self.accumulator.as_mut(), content) else {
                    debug!("Dropping audio content outside a start/end bracket");
                    return None;
                };
                match base64::engine::general_purpose::STANDARD.decode(content) {
                    Ok(chunk) => {
                        acc.push(chunk, encoding);
                        debug!(
                            bytes = acc.byte_len(),
                            chunks = acc.chunk_count(),
                            "Added audio chunk"
                        );
                    }
                    Err(e) => warn!(error = %e, "Failed to decode audio chunk; dropping it"),
                }
                None
            }
            AudioFrame::Segment {
                state: SegmentState::End,
                ..
            } => {
                let acc = self.accumulator.take()?;
                if acc.chunk_count() == 0 {
                    debug!("Audio bracket closed without content");
                    return None;
                }
                debug!(
                    chunks = acc.chunk_count(),
                    bytes = acc.byte_len(),
                    "Audio streaming complete"
                );
                Some(acc.into_trace())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn segment(state: &str, content: Option<&[u8]>) -> Value {
        let mut payload = json!({ "state": state, "encoding": "audio/mp3" });
        if let Some(bytes) = content {
            payload["content"] = Value::String(b64(bytes));
        }
        json!({ "type": "audio", "payload": payload })
    }

    fn decoded_content(trace: &Value) -> Vec<u8> {
        let content = trace["payload"]["content"].as_str().unwrap();
        base64::engine::general_purpose::STANDARD.decode(content).unwrap()
    }

    #[test]
    fn test_segments_consolidate_in_arrival_order() {
        let mut assembler = AudioChunkAssembler::new();
        assert!(assembler.accept(segment("start", None)).is_none());
        assert!(assembler.accept(segment("content", Some(b"AAA"))).is_none());
        assert!(assembler.accept(segment("content", Some(b"BB"))).is_none());

        let out = assembler.accept(segment("end", None)).expect("consolidated");
        assert_eq!(out["type"], "audio");
        assert_eq!(out["payload"]["encoding"], "audio/mp3");
        assert_eq!(decoded_content(&out), b"AAABB");
        assert!(!assembler.is_open());
    }

    #[test]
    fn test_empty_bracket_emits_nothing() {
        let mut assembler = AudioChunkAssembler::new();
        assert!(assembler.accept(segment("start", None)).is_none());
        assert!(assembler.accept(segment("end", None)).is_none());
        assert!(!assembler.is_open());
    }

    #[test]
    fn test_direct_reference_discards_open_accumulator() {
        let mut assembler = AudioChunkAssembler::new();
        assembler.accept(segment("start", None));
        assembler.accept(segment("content", Some(b"stale")));

        let direct = json!({
            "type": "audio",
            "payload": { "audio": { "src": "https://cdn.example/reply.mp3" } }
        });
        assert_eq!(assembler.accept(direct.clone()), Some(direct));
        assert!(!assembler.is_open());
        assert!(assembler.accept(segment("end", None)).is_none());
    }

    #[test]
    fn test_bad_chunk_is_dropped_without_aborting() {
        let mut assembler = AudioChunkAssembler::new();
        assembler.accept(segment("start", None));
        assembler.accept(segment("content", Some(b"ok-")));
        let bad = json!({
            "type": "audio",
            "payload": { "state": "content", "encoding": "audio/mp3", "content": "%%not base64%%" }
        });
        assert!(assembler.accept(bad).is_none());
        assembler.accept(segment("content", Some(b"fine")));

        let out = assembler.accept(segment("end", None)).unwrap();
        assert_eq!(decoded_content(&out), b"ok-fine");
    }

    #[test]
    fn test_second_start_resets_previous_bracket() {
        let mut assembler = AudioChunkAssembler::new();
        assembler.accept(segment("start", None));
        assembler.accept(segment("content", Some(b"lost")));
        assembler.accept(segment("start", None));
        assembler.accept(segment("content", Some(b"kept")));

        let out = assembler.accept(segment("end", None)).unwrap();
        assert_eq!(decoded_content(&out), b"kept");
    }

    #[test]
    fn test_first_encoding_wins_and_defaults_when_absent() {
        let mut assembler = AudioChunkAssembler::new();
        assembler.accept(segment("start", None));
        assembler.accept(json!({
            "type": "audio",
            "payload": { "state": "content", "content": b64(b"x") }
        }));
        assembler.accept(json!({
            "type": "audio",
            "payload": { "state": "content", "encoding": "audio/wav", "content": b64(b"y") }
        }));
        assembler.accept(segment("content", Some(b"z")));
        let out = assembler.accept(segment("end", None)).unwrap();
        assert_eq!(out["payload"]["encoding"], "audio/wav");

        assembler.accept(segment("start", None));
        assembler.accept(json!({
            "type": "audio",
            "payload": { "state": "content", "content": b64(b"q") }
        }));
        let out = assembler.accept(segment("end", None)).unwrap();
        assert_eq!(out["payload"]["encoding"], DEFAULT_AUDIO_ENCODING);
    }

    #[test]
    fn test_content_and_end_outside_bracket_are_swallowed() {
        let mut assembler = AudioChunkAssembler::new();
        assert!(assembler.accept(segment("content", Some(b"x"))).is_none());
        assert!(assembler.accept(segment("end", None)).is_none());
    }

    #[test]
    fn test_non_audio_traces_pass_through() {
        let mut assembler = AudioChunkAssembler::new();
        assembler.accept(segment("start", None));

        let text = json!({ "type": "text", "payload": { "message": "Hello there" } });
        assert_eq!(assembler.accept(text.clone()), Some(text));
        let odd = json!({ "type": "audio", "payload": { "state": "paused" } });
        assert_eq!(assembler.accept(odd.clone()), Some(odd));
        assert!(assembler.is_open());
    }

    #[test]
    fn test_classify() {
        let direct = json!({ "type": "text", "payload": { "audio": { "src": "u" } } });
        assert_eq!(AudioFrame::classify(&direct), AudioFrame::DirectReference("u"));
        assert_eq!(AudioFrame::classify(&Value::Null), AudioFrame::Other);
        assert_eq!(
            AudioFrame::classify(&segment("end", None)),
            AudioFrame::Segment {
                state: SegmentState::End,
                encoding: Some("audio/mp3"),
                content: None,
            }
        );
    }
}
