//! HTIF mailbox: the `tohost`/`fromhost` word pair used by bare-metal
//! tests and BBL.
//!
//! A `tohost` write is `{dev: bits 56..64, cmd: bits 48..56, payload:
//! bits 0..48}`. The console device (1) putchars; device 0 command 0 ends
//! the run. `fromhost` reads drain the host stdin queue one character at
//! a time.

use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::Mutex;

/// Destination for guest console output (HTIF putchar and the virtio
/// console both end up here).
pub trait CharSink: Send {
    /// Emits one chunk of output.
    fn write(&mut self, data: &[u8]);
}

/// [`CharSink`] onto the process stdout, flushed per chunk.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl CharSink for StdoutSink {
    fn write(&mut self, data: &[u8]) {
        let mut out = std::io::stdout();
        // Console output is best-effort; a broken stdout should not take
        // the dispatcher down.
        let _ = out.write_all(data);
        let _ = out.flush();
    }
}

/// Host-side keyboard queue, filled by the terminal pump thread and
/// drained by guest `fromhost` reads.
#[derive(Debug, Default)]
pub struct StdinQueue {
    chars: Mutex<VecDeque<u8>>,
}

impl StdinQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends input characters.
    pub fn enqueue(&self, bytes: &[u8]) {
        let mut chars = self.chars.lock().unwrap_or_else(|e| e.into_inner());
        chars.extend(bytes.iter().copied());
    }

    /// Pops the next character, if any.
    #[must_use]
    pub fn dequeue(&self) -> Option<u8> {
        self.chars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

/// Outcome of a `tohost` write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtifEffect {
    /// Nothing further to do.
    Handled,
    /// Guest finished the run with this exit code.
    Exit(i32),
}

/// The HTIF mailbox state.
pub struct Htif {
    tohost_addr: u64,
    fromhost_addr: u64,
    enabled: bool,
    stdin: std::sync::Arc<StdinQueue>,
    sink: Box<dyn CharSink>,
}

impl Htif {
    /// Creates the mailbox at `base` (tohost at `base`, fromhost at
    /// `base + 8`).
    #[must_use]
    pub fn new(base: u64, stdin: std::sync::Arc<StdinQueue>, sink: Box<dyn CharSink>) -> Self {
        Self {
            tohost_addr: base,
            fromhost_addr: base + 8,
            enabled: false,
            stdin,
            sink,
        }
    }

    /// Moves both mailbox words to a new base.
    pub fn set_base_addr(&mut self, base: u64) {
        self.tohost_addr = base;
        self.fromhost_addr = base + 8;
    }

    /// Overrides the `tohost` address alone.
    pub fn set_tohost_addr(&mut self, addr: u64) {
        self.tohost_addr = addr;
    }

    /// Overrides the `fromhost` address alone.
    pub fn set_fromhost_addr(&mut self, addr: u64) {
        self.fromhost_addr = addr;
    }

    /// Enables or disables `fromhost` input delivery.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// The `tohost` word address.
    #[must_use]
    pub const fn tohost_addr(&self) -> u64 {
        self.tohost_addr
    }

    /// The `fromhost` word address.
    #[must_use]
    pub const fn fromhost_addr(&self) -> u64 {
        self.fromhost_addr
    }

    /// Decodes and performs a `tohost` write.
    pub fn tohost_write(&mut self, data: u64) -> HtifEffect {
        let dev = (data >> 56) as u8;
        let cmd = (data >> 48) as u8;
        let payload = data & 0x0000_ffff_ffff_ffff;

        match (dev, cmd) {
            (1, 1) => {
                self.sink.write(&[payload as u8]);
                HtifEffect::Handled
            }
            (0, 0) => {
                if payload == 1 {
                    tracing::info!("guest reports PASS");
                    HtifEffect::Exit(0)
                } else {
                    let code = (payload >> 1) as i32;
                    tracing::warn!(code, "guest reports FAIL");
                    HtifEffect::Exit(code)
                }
            }
            _ => {
                tracing::warn!(dev, cmd, "unhandled htif command, payload {payload:#x}");
                HtifEffect::Handled
            }
        }
    }

    /// Services a `fromhost` read: the next pending input character, or
    /// zero when there is none (or input is disabled).
    pub fn fromhost_read(&mut self) -> u64 {
        if !self.enabled {
            return 0;
        }
        self.stdin
            .dequeue()
            .map_or(0, |ch| (1u64 << 56) | u64::from(ch))
    }
}
