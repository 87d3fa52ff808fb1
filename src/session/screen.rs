//! Output and input filtering between the PTY and the UI.
//!
//! `ScreenFilter` tracks alt-screen state and gates DECTCEM cursor
//! hide/show: chat-style CLIs toggle the cursor constantly while printing,
//! which flickers badly when mirrored into a TUI pane, so `?25l`/`?25h`
//! pass through only while the application is on the alternate screen.
//!
//! `RingBuffer` bounds per-tab output between frames; `MouseThrottle`
//! dedupes motion and throttles wheel events on the input side.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bounded byte buffer; overflow drops the oldest bytes and counts them.
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
            self.dropped += 1;
        }
    }

    pub fn drain(&mut self) -> Vec<u8> {
        self.buf.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Longest private-mode sequence we bother tracking (`ESC [ ? params h/l`).
const MAX_PRIVATE_SEQ: usize = 16;

enum SeqScan {
    /// A complete private-mode sequence of this byte length.
    Complete(usize),
    /// Byte run could still become a private sequence; wait for more input.
    Incomplete,
    /// Not a private-mode sequence; pass bytes through untouched.
    Other,
}

/// Stateful filter over a PTY output stream. Call `filter` with each chunk
/// in order; partial escape sequences at chunk ends carry over.
pub struct ScreenFilter {
    alt_screen: bool,
    carry: Vec<u8>,
}

impl ScreenFilter {
    pub fn new() -> Self {
        Self {
            alt_screen: false,
            carry: Vec::new(),
        }
    }

    pub fn alt_screen(&self) -> bool {
        self.alt_screen
    }

    pub fn filter(&mut self, input: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(input);

        let mut out = Vec::with_capacity(data.len());
        let mut i = 0;
        while i < data.len() {
            if data[i] != 0x1b {
                out.push(data[i]);
                i += 1;
                continue;
            }
            match scan_private_seq(&data[i..]) {
                SeqScan::Complete(len) => {
                    let seq = &data[i..i + len];
                    if self.apply_private_seq(seq) {
                        out.extend_from_slice(seq);
                    }
                    i += len;
                }
                SeqScan::Incomplete => {
                    self.carry = data[i..].to_vec();
                    break;
                }
                SeqScan::Other => {
                    out.push(data[i]);
                    i += 1;
                }
            }
        }
        out
    }

    /// Track alt-screen state and decide whether the sequence is emitted.
    fn apply_private_seq(&mut self, seq: &[u8]) -> bool {
        // seq = ESC [ ? <params> <h|l>
        let set = seq[seq.len() - 1] == b'h';
        let params = &seq[3..seq.len() - 1];
        let mut emit = true;
        for param in params.split(|&b| b == b';') {
            match param {
                b"1049" | b"1047" | b"47" => self.alt_screen = set,
                b"25" if !self.alt_screen => emit = false,
                _ => {}
            }
        }
        emit
    }
}

impl Default for ScreenFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_private_seq(data: &[u8]) -> SeqScan {
    // data[0] is ESC.
    match data.get(1) {
        None => return SeqScan::Incomplete,
        Some(b'[') => {}
        Some(_) => return SeqScan::Other,
    }
    match data.get(2) {
        None => return SeqScan::Incomplete,
        Some(b'?') => {}
        Some(_) => return SeqScan::Other,
    }
    let mut i = 3;
    while let Some(&b) = data.get(i) {
        match b {
            b'0'..=b'9' | b';' => {
                if i >= MAX_PRIVATE_SEQ {
                    return SeqScan::Other;
                }
                i += 1;
            }
            b'h' | b'l' if i > 3 => return SeqScan::Complete(i + 1),
            _ => return SeqScan::Other,
        }
    }
    SeqScan::Incomplete
}

/// Input-side mouse events, as decoded by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseEvent {
    Motion { x: u16, y: u16 },
    Wheel { delta: i8 },
    Button,
}

/// Drops identical motion at the same `(x, y)` inside the motion window;
/// wheel events throttle on their own clock.
pub struct MouseThrottle {
    motion_window: Duration,
    wheel_window: Duration,
    last_motion: Option<(u16, u16, Instant)>,
    last_wheel: Option<Instant>,
}

impl MouseThrottle {
    pub fn new(motion_window: Duration, wheel_window: Duration) -> Self {
        Self {
            motion_window,
            wheel_window,
            last_motion: None,
            last_wheel: None,
        }
    }

    pub fn admit_at(&mut self, event: MouseEvent, now: Instant) -> bool {
        match event {
            MouseEvent::Motion { x, y } => {
                if let Some((lx, ly, at)) = self.last_motion
                    && lx == x
                    && ly == y
                    && now.duration_since(at) < self.motion_window
                {
                    return false;
                }
                self.last_motion = Some((x, y, now));
                true
            }
            MouseEvent::Wheel { .. } => {
                if let Some(at) = self.last_wheel
                    && now.duration_since(at) < self.wheel_window
                {
                    return false;
                }
                self.last_wheel = Some(now);
                true
            }
            MouseEvent::Button => true,
        }
    }

    pub fn admit(&mut self, event: MouseEvent) -> bool {
        self.admit_at(event, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIDE: &[u8] = b"\x1b[?25l";
    const SHOW: &[u8] = b"\x1b[?25h";
    const ALT_ON: &[u8] = b"\x1b[?1049h";
    const ALT_OFF: &[u8] = b"\x1b[?1049l";

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut ring = RingBuffer::new(4);
        ring.push(b"abcdef");
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.dropped(), 2);
        assert_eq!(ring.drain(), b"cdef");
        assert!(ring.is_empty());
    }

    #[test]
    fn cursor_toggles_dropped_outside_alt_screen() {
        let mut filter = ScreenFilter::new();
        let mut input = Vec::new();
        input.extend_from_slice(b"hello ");
        input.extend_from_slice(HIDE);
        input.extend_from_slice(b"world");
        input.extend_from_slice(SHOW);
        assert_eq!(filter.filter(&input), b"hello world");
    }

    #[test]
    fn cursor_toggles_kept_in_alt_screen() {
        let mut filter = ScreenFilter::new();
        let mut input = Vec::new();
        input.extend_from_slice(ALT_ON);
        input.extend_from_slice(HIDE);
        let out = filter.filter(&input);
        assert!(filter.alt_screen());
        assert_eq!(out, input);

        // Leaving alt screen resumes dropping.
        let mut second = Vec::new();
        second.extend_from_slice(ALT_OFF);
        second.extend_from_slice(HIDE);
        let out = filter.filter(&second);
        assert!(!filter.alt_screen());
        assert_eq!(out, ALT_OFF);
    }

    #[test]
    fn legacy_alt_screen_codes_are_tracked() {
        let mut filter = ScreenFilter::new();
        filter.filter(b"\x1b[?47h");
        assert!(filter.alt_screen());
        filter.filter(b"\x1b[?47l");
        assert!(!filter.alt_screen());
        filter.filter(b"\x1b[?1047h");
        assert!(filter.alt_screen());
    }

    #[test]
    fn split_sequences_carry_across_chunks() {
        let mut filter = ScreenFilter::new();
        let first = filter.filter(b"abc\x1b[?2");
        assert_eq!(first, b"abc");
        let second = filter.filter(b"5lxyz");
        assert_eq!(second, b"xyz");
    }

    #[test]
    fn non_private_sequences_pass_through() {
        let mut filter = ScreenFilter::new();
        let input = b"\x1b[31mred\x1b[0m\x1b[2Jclear";
        assert_eq!(filter.filter(input), input);
    }

    #[test]
    fn other_private_modes_pass_through() {
        let mut filter = ScreenFilter::new();
        // Mouse reporting toggles are not ours to drop.
        let input = b"\x1b[?1000h\x1b[?1002l";
        assert_eq!(filter.filter(input), input);
    }

    #[test]
    fn combined_params_still_track_alt_screen() {
        let mut filter = ScreenFilter::new();
        let input = b"\x1b[?1049;25h";
        let out = filter.filter(input);
        assert!(filter.alt_screen());
        assert_eq!(out, input);
    }

    #[test]
    fn trailing_escape_is_held_not_emitted() {
        let mut filter = ScreenFilter::new();
        assert_eq!(filter.filter(b"data\x1b"), b"data");
        assert_eq!(filter.filter(b"[0m"), b"\x1b[0m");
    }

    #[test]
    fn motion_dedupe_is_position_and_time_scoped() {
        let mut throttle =
            MouseThrottle::new(Duration::from_millis(15), Duration::from_millis(15));
        let t0 = Instant::now();
        assert!(throttle.admit_at(MouseEvent::Motion { x: 3, y: 4 }, t0));
        // Same cell, inside the window: dropped.
        assert!(!throttle.admit_at(
            MouseEvent::Motion { x: 3, y: 4 },
            t0 + Duration::from_millis(5)
        ));
        // Different cell, inside the window: admitted.
        assert!(throttle.admit_at(
            MouseEvent::Motion { x: 4, y: 4 },
            t0 + Duration::from_millis(6)
        ));
        // Same cell again after the window: admitted.
        assert!(throttle.admit_at(
            MouseEvent::Motion { x: 4, y: 4 },
            t0 + Duration::from_millis(30)
        ));
    }

    #[test]
    fn wheel_throttles_independently_of_motion() {
        let mut throttle =
            MouseThrottle::new(Duration::from_millis(15), Duration::from_millis(15));
        let t0 = Instant::now();
        assert!(throttle.admit_at(MouseEvent::Wheel { delta: 1 }, t0));
        assert!(throttle.admit_at(
            MouseEvent::Motion { x: 1, y: 1 },
            t0 + Duration::from_millis(1)
        ));
        // Wheel still inside its own window even though motion intervened.
        assert!(!throttle.admit_at(
            MouseEvent::Wheel { delta: -1 },
            t0 + Duration::from_millis(10)
        ));
        assert!(throttle.admit_at(
            MouseEvent::Wheel { delta: 1 },
            t0 + Duration::from_millis(20)
        ));
    }

    #[test]
    fn buttons_are_never_throttled() {
        let mut throttle =
            MouseThrottle::new(Duration::from_millis(15), Duration::from_millis(15));
        let t0 = Instant::now();
        assert!(throttle.admit_at(MouseEvent::Button, t0));
        assert!(throttle.admit_at(MouseEvent::Button, t0));
    }
}
