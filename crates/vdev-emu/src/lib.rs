//! # vdev-emu
//!
//! The host side of the FPGA-hosted guest: classifies every captured MMIO
//! access and routes it to the VirtIO stack, the HTIF mailbox, the SiFive
//! test finisher, or the boot ROM, then writes the response back through
//! the capture unit.
//!
//! [`Emulator`] assembles the pieces; its `serve_one` loop belongs on the
//! CPU-facing thread, while queue processing runs on the notify worker
//! owned by [`stack::VirtioStack`].

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod control;
pub mod dispatch;
pub mod emulator;
pub mod error;
pub mod htif;
pub mod rom;
pub mod stack;

pub use bus::{GuestMemoryBus, MmioHandler, RangeId};
pub use control::IoControl;
pub use dispatch::{Dispatcher, Served};
pub use emulator::Emulator;
pub use error::{EmuError, Result};
pub use htif::{CharSink, Htif, StdinQueue, StdoutSink};
pub use rom::BootRom;
pub use stack::VirtioStack;

/// Exit code reported for a guest-requested reset.
///
/// The SiFive test finisher provides 16 bits for an exit code, unsigned,
/// so negative values are free for internal use.
pub const EXIT_CODE_RESET: i32 = -1;
