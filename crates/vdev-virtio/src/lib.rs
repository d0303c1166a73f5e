//! # vdev-virtio
//!
//! VirtIO 1.0 (MMIO transport) device stack for the FPGA-hosted guest.
//!
//! Unlike an in-process hypervisor, the guest's rings live on the far side
//! of a DMA window: every descriptor fetch, gather/scatter copy, and
//! used-ring publication goes through the [`dma::GuestDma`] seam. The crate
//! provides:
//!
//! - [`device`]: the shared register file ([`device::VirtioCore`]), the
//!   virtqueue engine, and the [`device::VirtioDevice`] trait every backend
//!   implements,
//! - [`notify`]: the worker thread that decouples guest queue notifications
//!   from the MMIO dispatcher,
//! - the device backends: [`blk`], [`net`], [`console`], [`entropy`],
//!   [`input`], and [`p9`].
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 vdev-virtio                   │
//! │ ┌─────┐ ┌─────┐ ┌──────┐ ┌─────┐ ┌─────┐ ┌──┐ │
//! │ │ blk │ │ net │ │ cons │ │ rng │ │input│ │9p│ │
//! │ └──┬──┘ └──┬──┘ └──┬───┘ └──┬──┘ └──┬──┘ └┬─┘ │
//! │    └───────┴───────┴────┬───┴───────┴─────┘   │
//! │                    VirtioCore                 │
//! │               (rings via GuestDma)            │
//! └───────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blk;
pub mod console;
pub mod device;
pub mod dma;
pub mod entropy;
pub mod error;
pub mod input;
pub mod irq;
pub mod mmio;
pub mod net;
pub mod notify;
pub mod p9;
pub mod queue;

pub use device::{RecvStatus, VirtioBus, VirtioCore, VirtioDevice};
pub use dma::{GuestDma, SharedRam};
pub use error::{Result, VirtioError};
pub use irq::{IrqController, IrqLine};
pub use notify::{DeviceHandle, NotifyScheduler};

/// VirtIO device type IDs (MMIO `DeviceID` register values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VirtioDeviceId {
    /// Network device.
    Net = 1,
    /// Block device.
    Block = 2,
    /// Console device.
    Console = 3,
    /// Entropy source.
    Rng = 4,
    /// 9P transport.
    NineP = 9,
    /// Input device.
    Input = 18,
}

/// Device status register bits.
pub mod status {
    /// Guest has noticed the device.
    pub const ACKNOWLEDGE: u32 = 1;
    /// Guest knows how to drive the device.
    pub const DRIVER: u32 = 2;
    /// Driver is set up and ready.
    pub const DRIVER_OK: u32 = 4;
    /// Feature negotiation complete.
    pub const FEATURES_OK: u32 = 8;
    /// Device has experienced an error.
    pub const NEEDS_RESET: u32 = 64;
    /// Driver has given up on the device.
    pub const FAILED: u32 = 128;
}

/// Device-independent and device-specific feature bits offered by this
/// stack.
pub mod features {
    /// VirtIO 1.0 compliance (bit 32). Negotiation requires it.
    pub const VERSION_1: u64 = 1 << 32;
    /// Console size is exposed in config space.
    pub const CONSOLE_F_SIZE: u64 = 1 << 0;
    /// Net device has a valid MAC in config space.
    pub const NET_F_MAC: u64 = 1 << 5;
    /// Block device reports a maximum segment count.
    pub const BLK_F_SEG_MAX: u64 = 1 << 2;
    /// 9P mount tag is exposed in config space.
    pub const P9_F_MOUNT_TAG: u64 = 1 << 0;
}
