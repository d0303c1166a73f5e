//! # vdev-fmem
//!
//! Side-band channels to the FPGA-hosted "virtual device" capture unit.
//!
//! The hardware exposes three FMEM character devices:
//!
//! - the **capture** device, which latches guest MMIO reads and writes and
//!   lets the host provide the response,
//! - the **DMA** device, a coherent byte-granular window onto guest
//!   physical memory,
//! - the **interrupt** device, a pair of write-1-to-set / write-1-to-clear
//!   level registers.
//!
//! [`HostChannel`] bundles the three and is the only type the rest of the
//! emulator needs. Device-file paths come from the `RISCV_*_FMEM_DEV`
//! environment variables, falling back to the `/dev/fmem_sys0_*` defaults.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod error;
pub mod fmem;

pub use channel::{ChannelConfig, HostChannel, Request};
pub use error::{ChannelError, Result};
pub use fmem::Fmem;
