//! Guest-memory access seam.
//!
//! The virtqueue engine never touches guest memory directly; it goes
//! through [`GuestDma`]. The production implementation wraps the coherent
//! FMEM DMA window. [`SharedRam`] is an in-process implementation used by
//! tests and loopback configurations.
//!
//! The interface is infallible on purpose: a DMA failure on a descriptor
//! that opened successfully means the side-band is gone, and the
//! implementation is expected to abort rather than hand corrupt ring state
//! back to the engine.

use std::sync::Mutex;

/// Byte-granular access to guest physical memory.
pub trait GuestDma: Send + Sync {
    /// Copies guest memory at `addr` into `buf`.
    fn read(&self, addr: u64, buf: &mut [u8]);

    /// Copies `buf` into guest memory at `addr`.
    fn write(&self, addr: u64, buf: &[u8]);

    /// Reads a little-endian u16.
    fn read_u16(&self, addr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf);
        u16::from_le_bytes(buf)
    }

    /// Writes a little-endian u16.
    fn write_u16(&self, addr: u64, val: u16) {
        self.write(addr, &val.to_le_bytes());
    }

    /// Writes a little-endian u32.
    fn write_u32(&self, addr: u64, val: u32) {
        self.write(addr, &val.to_le_bytes());
    }
}

/// In-process guest RAM backed by a plain buffer.
///
/// Addresses index the buffer directly. Out-of-range accesses are clipped,
/// reading zeroes and dropping writes, so a malformed descriptor cannot
/// take the host down in a test.
#[derive(Debug)]
pub struct SharedRam {
    mem: Mutex<Vec<u8>>,
}

impl SharedRam {
    /// Allocates `size` bytes of zeroed guest RAM.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            mem: Mutex::new(vec![0; size]),
        }
    }

    /// Returns a copy of the byte range at `addr`.
    #[must_use]
    pub fn snapshot(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf);
        buf
    }
}

impl GuestDma for SharedRam {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        let mem = self.mem.lock().unwrap_or_else(|e| e.into_inner());
        let start = usize::try_from(addr).unwrap_or(usize::MAX).min(mem.len());
        let end = start.saturating_add(buf.len()).min(mem.len());
        let n = end - start;
        buf[..n].copy_from_slice(&mem[start..end]);
        buf[n..].fill(0);
    }

    fn write(&self, addr: u64, buf: &[u8]) {
        let mut mem = self.mem.lock().unwrap_or_else(|e| e.into_inner());
        let start = usize::try_from(addr).unwrap_or(usize::MAX).min(mem.len());
        let end = start.saturating_add(buf.len()).min(mem.len());
        let n = end - start;
        mem[start..end].copy_from_slice(&buf[..n]);
    }
}
