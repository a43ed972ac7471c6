//! Diagnostic fallback for silent or non-JPEG streams.
//!
//! When no frame has decoded within the threshold after the stream started,
//! the read loop stops feeding the assembler and surfaces raw RX dumps
//! instead. While in that mode each chunk is screened for an SOI marker
//! followed by the `FF` of the first segment marker. A sighting resumes
//! extraction provisionally: the first decoded frame clears the mode, while a
//! failed decode or an overflow reset abandons the attempt and discarding
//! starts again.

use std::time::{Duration, Instant};

pub const DEFAULT_THRESHOLD: Duration = Duration::from_millis(5_000);

/// SOI plus the lead byte of the marker every JPEG puts right after it.
const FRAME_LEAD: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// How the read loop should treat a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Screen {
    /// Hand the whole chunk to the assembler.
    Pass,
    /// Do not touch the assembler; its position stays pinned at 0.
    Discard,
    /// An SOI was sighted. Feed the first `carry` bytes of SOI (those that
    /// arrived with earlier chunks), then the chunk from `offset`.
    Resume { offset: usize, carry: usize },
}

#[derive(Debug)]
pub struct DiagnosticFallback {
    threshold: Duration,
    stream_start: Instant,
    switched: bool,
    decoded_any: bool,
    /// Extraction resumed after an SOI sighting while still switched.
    resumed: bool,
    /// Last bytes of the previous chunks, at most `FRAME_LEAD.len() - 1`.
    tail: Vec<u8>,
}

impl DiagnosticFallback {
    pub fn new(threshold: Duration, stream_start: Instant) -> Self {
        Self {
            threshold,
            stream_start,
            switched: false,
            decoded_any: false,
            resumed: false,
            tail: Vec::with_capacity(FRAME_LEAD.len()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.switched
    }

    pub fn stream_start(&self) -> Instant {
        self.stream_start
    }

    /// Returns true exactly when diagnostic mode is entered.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.switched || self.decoded_any {
            return false;
        }
        if now.saturating_duration_since(self.stream_start) > self.threshold {
            self.switched = true;
            self.resumed = false;
            self.tail.clear();
            return true;
        }
        false
    }

    /// Record a successful decode. Returns true if this left diagnostic mode.
    pub fn on_frame_decoded(&mut self) -> bool {
        self.decoded_any = true;
        let was_active = self.switched;
        self.switched = false;
        self.resumed = false;
        was_active
    }

    /// Leave diagnostic mode without a decode and restart the timer from
    /// `now` (soft recovery path).
    pub fn restart(&mut self, now: Instant) {
        self.switched = false;
        self.resumed = false;
        self.tail.clear();
        self.stream_start = now;
    }

    /// True while a provisional resume is feeding the assembler.
    pub fn is_resumed(&self) -> bool {
        self.switched && self.resumed
    }

    /// Drop a resume that produced no frame and go back to discarding.
    pub fn abandon_resume(&mut self) {
        self.resumed = false;
        self.tail.clear();
    }

    pub fn screen(&mut self, chunk: &[u8]) -> Screen {
        if !self.switched || self.resumed {
            return Screen::Pass;
        }
        let carried = self.tail.len();
        let found = {
            let tail = &self.tail;
            let at = |i: usize| if i < carried { tail[i] } else { chunk[i - carried] };
            let total = carried + chunk.len();
            (0..total.saturating_sub(FRAME_LEAD.len() - 1)).find(|&i| {
                FRAME_LEAD
                    .iter()
                    .enumerate()
                    .all(|(k, byte)| at(i + k) == *byte)
            })
        };

        let keep = FRAME_LEAD.len() - 1;
        if chunk.len() >= keep {
            self.tail.clear();
        } else {
            let excess = (self.tail.len() + chunk.len()).saturating_sub(keep);
            self.tail.drain(..excess);
        }
        self.tail
            .extend_from_slice(&chunk[chunk.len().saturating_sub(keep)..]);

        match found {
            Some(i) => {
                self.resumed = true;
                self.tail.clear();
                if i < carried {
                    Screen::Resume {
                        offset: 0,
                        carry: carried - i,
                    }
                } else {
                    Screen::Resume {
                        offset: i - carried,
                        carry: 0,
                    }
                }
            }
            None => Screen::Discard,
        }
    }
}

/// Accumulates space-separated hex of received bytes and emits a dump line
/// every `DUMP_HEX_CHARS` characters, with an ASCII preview of the current
/// chunk.
#[derive(Debug, Default)]
pub struct RxDump {
    hex: String,
}

const DUMP_HEX_CHARS: usize = 200;
const ASCII_PREVIEW: usize = 20;

impl RxDump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        if chunk.is_empty() {
            return None;
        }
        for byte in chunk {
            self.hex.push_str(&hex::encode_upper([*byte]));
            self.hex.push(' ');
        }
        if self.hex.len() <= DUMP_HEX_CHARS {
            return None;
        }
        let head: String = self.hex.chars().take(DUMP_HEX_CHARS).collect();
        let ascii: String = chunk
            .iter()
            .take(ASCII_PREVIEW)
            .map(|&b| if (32..=126).contains(&b) { b as char } else { '.' })
            .collect();
        self.hex.clear();
        Some(format!("RX: {}... (ASCII: {})", head, ascii))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enters_after_threshold_without_frames() {
        let start = Instant::now();
        let mut fallback = DiagnosticFallback::new(DEFAULT_THRESHOLD, start);
        assert!(!fallback.poll(start + Duration::from_millis(4_999)));
        assert!(fallback.poll(start + Duration::from_millis(5_001)));
        assert!(fallback.is_active());
        // Only reported once.
        assert!(!fallback.poll(start + Duration::from_millis(6_000)));
    }

    #[test]
    fn next_decode_exits() {
        let start = Instant::now();
        let mut fallback = DiagnosticFallback::new(DEFAULT_THRESHOLD, start);
        assert!(fallback.poll(start + Duration::from_secs(6)));
        assert!(fallback.on_frame_decoded());
        assert!(!fallback.is_active());
        // A stream that ever produced a frame never re-enters.
        assert!(!fallback.poll(start + Duration::from_secs(60)));
    }

    #[test]
    fn restart_rearms_the_timer() {
        let start = Instant::now();
        let mut fallback = DiagnosticFallback::new(DEFAULT_THRESHOLD, start);
        assert!(fallback.poll(start + Duration::from_secs(6)));
        let later = start + Duration::from_secs(7);
        fallback.restart(later);
        assert!(!fallback.is_active());
        assert!(!fallback.poll(later + Duration::from_secs(1)));
        assert!(fallback.poll(later + Duration::from_secs(6)));
    }

    fn switched() -> DiagnosticFallback {
        let start = Instant::now();
        let mut fallback = DiagnosticFallback::new(Duration::ZERO, start);
        assert!(fallback.poll(start + Duration::from_millis(1)));
        fallback
    }

    #[test]
    fn screen_discards_until_frame_lead() {
        let mut fallback = switched();
        assert_eq!(fallback.screen(b"hello"), Screen::Discard);
        // A bare SOI followed by text is not a frame start.
        assert_eq!(fallback.screen(&[0x00, 0xFF, 0xD8, 0x11, 0x22]), Screen::Discard);
        assert!(!fallback.is_resumed());
        assert_eq!(
            fallback.screen(&[0x00, 0xFF, 0xD8, 0xFF, 0xE0]),
            Screen::Resume {
                offset: 1,
                carry: 0
            }
        );
        assert!(fallback.is_resumed());
        assert_eq!(fallback.screen(b"more"), Screen::Pass);
    }

    #[test]
    fn screen_catches_lead_split_after_ff() {
        let mut fallback = switched();
        assert_eq!(fallback.screen(&[0x10, 0xFF]), Screen::Discard);
        assert_eq!(
            fallback.screen(&[0xD8, 0xFF, 0xDB]),
            Screen::Resume {
                offset: 0,
                carry: 1
            }
        );
    }

    #[test]
    fn screen_catches_lead_split_after_soi() {
        let mut fallback = switched();
        assert_eq!(fallback.screen(&[0x10, 0xFF, 0xD8]), Screen::Discard);
        assert_eq!(
            fallback.screen(&[0xFF, 0xE0]),
            Screen::Resume {
                offset: 0,
                carry: 2
            }
        );
    }

    #[test]
    fn screen_catches_lead_over_one_byte_chunks() {
        let mut fallback = switched();
        assert_eq!(fallback.screen(&[0xFF]), Screen::Discard);
        assert_eq!(fallback.screen(&[0xD8]), Screen::Discard);
        assert_eq!(
            fallback.screen(&[0xFF]),
            Screen::Resume {
                offset: 0,
                carry: 2
            }
        );
    }

    #[test]
    fn abandoned_resume_discards_again() {
        let mut fallback = switched();
        assert!(matches!(
            fallback.screen(&[0xFF, 0xD8, 0xFF, 0x00]),
            Screen::Resume { .. }
        ));
        fallback.abandon_resume();
        assert!(fallback.is_active());
        assert!(!fallback.is_resumed());
        assert_eq!(fallback.screen(&[0x41; 16]), Screen::Discard);
    }

    #[test]
    fn rx_dump_emits_after_enough_bytes() {
        let mut dump = RxDump::new();
        // Three characters per byte: 66 bytes fit in one line.
        assert!(dump.push(&[0x41; 50]).is_none());
        assert!(dump.push(&[0x42; 16]).is_none());
        let line = dump.push(&[0x42; 20]).unwrap_or_default();
        assert!(line.starts_with("RX: 41 41 "));
        assert!(line.ends_with("(ASCII: BBBBBBBBBBBBBBBBBBBB)"));
    }
}
