//! Virtqueue state and the split-ring wire format.
//!
//! The rings live in guest memory; the host keeps only the addresses the
//! driver programmed and its own progress cursor (`last_avail_idx`).

use crate::mmio::MAX_QUEUE_NUM;

/// Descriptor flag bits.
pub mod desc_flags {
    /// Chain continues at `next`.
    pub const NEXT: u16 = 1;
    /// Buffer is written by the device.
    pub const WRITE: u16 = 2;
    /// Buffer holds an indirect descriptor table (not supported).
    pub const INDIRECT: u16 = 4;
}

/// One entry of the guest-resident descriptor table (16 bytes LE on the
/// wire).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Desc {
    /// Guest physical address of the buffer.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
    /// `desc_flags` bits.
    pub flags: u16,
    /// Next descriptor index when `NEXT` is set.
    pub next: u16,
}

impl Desc {
    /// Wire size of a descriptor.
    pub const SIZE: u64 = 16;

    /// Decodes a descriptor from its wire representation.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self {
            addr: u64::from_le_bytes(bytes[0..8].try_into().unwrap_or([0; 8])),
            len: u32::from_le_bytes(bytes[8..12].try_into().unwrap_or([0; 4])),
            flags: u16::from_le_bytes(bytes[12..14].try_into().unwrap_or([0; 2])),
            next: u16::from_le_bytes(bytes[14..16].try_into().unwrap_or([0; 2])),
        }
    }

    /// Encodes the descriptor into its wire representation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out[12..14].copy_from_slice(&self.flags.to_le_bytes());
        out[14..16].copy_from_slice(&self.next.to_le_bytes());
        out
    }

    /// Whether the chain continues past this descriptor.
    #[must_use]
    pub const fn has_next(&self) -> bool {
        self.flags & desc_flags::NEXT != 0
    }

    /// Whether the device writes (rather than reads) this buffer.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.flags & desc_flags::WRITE != 0
    }
}

/// Host-side state of one virtqueue.
#[derive(Debug, Clone)]
pub struct QueueState {
    /// Driver set `QueueReady`.
    pub ready: bool,
    /// Ring size; a power of two once the driver configures it.
    pub num: u32,
    /// Cached copy of the available ring's index word.
    pub avail_idx: u16,
    /// First available entry the host has not yet consumed.
    pub last_avail_idx: u16,
    /// Guest physical address of the descriptor table.
    pub desc_addr: u64,
    /// Guest physical address of the available ring.
    pub avail_addr: u64,
    /// Guest physical address of the used ring.
    pub used_addr: u64,
    /// Device pulls descriptors on demand instead of draining on notify
    /// (rx-style queues).
    pub manual_recv: bool,
}

impl QueueState {
    /// Ring index mask (`num` is a power of two).
    #[must_use]
    pub const fn mask(&self) -> u16 {
        (self.num - 1) as u16
    }

    /// Address of the available ring's index word.
    #[must_use]
    pub const fn avail_idx_addr(&self) -> u64 {
        self.avail_addr + 2
    }

    /// Address of the available ring slot for `idx`.
    #[must_use]
    pub const fn avail_slot_addr(&self, idx: u16) -> u64 {
        self.avail_addr + 4 + (idx & self.mask()) as u64 * 2
    }

    /// Address of the used ring's index word.
    #[must_use]
    pub const fn used_idx_addr(&self) -> u64 {
        self.used_addr + 2
    }

    /// Address of the used ring element for `idx`.
    #[must_use]
    pub const fn used_elem_addr(&self, idx: u16) -> u64 {
        self.used_addr + 4 + (idx & self.mask()) as u64 * 8
    }

    /// Address of descriptor `idx` in the descriptor table.
    #[must_use]
    pub const fn desc_addr_of(&self, idx: u16) -> u64 {
        self.desc_addr + idx as u64 * Desc::SIZE
    }
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            ready: false,
            num: MAX_QUEUE_NUM,
            avail_idx: 0,
            last_avail_idx: 0,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            manual_recv: false,
        }
    }
}
