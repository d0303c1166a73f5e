//! The MMIO request dispatcher.
//!
//! One `serve_one` call answers at most one captured guest access. The
//! guest bus is 64 bits wide and device registers are 32: a 32-bit write
//! to `base + 4` arrives in the upper half of the data lane, and a read
//! of an odd word must be returned in the upper half.

use std::sync::Arc;

use vdev_fmem::{HostChannel, Request};

use crate::bus::GuestMemoryBus;
use crate::error::Result;
use crate::htif::{Htif, HtifEffect};
use crate::rom::BootRom;
use crate::EXIT_CODE_RESET;

/// Stray accesses to these addresses are routine (probes of optional
/// HTIF/finisher locations) and not worth logging.
const QUIET_STRAYS: [u64; 4] = [0x1000_1000, 0x1000_1008, 0x5000_1000, 0x5000_1008];

/// SiFive test finisher status codes (low 16 bits of the write).
const FINISHER_FAIL: u16 = 0x3333;
const FINISHER_PASS: u16 = 0x5555;
const FINISHER_RESET: u16 = 0x7777;

/// Outcome of one dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// No request was pending.
    Idle,
    /// A request was answered.
    Handled,
    /// A request was answered and the guest asked to end the run.
    Exit(i32),
}

/// Classifies captured guest accesses and responds to them.
pub struct Dispatcher {
    chan: Arc<HostChannel>,
    bus: GuestMemoryBus,
    rom: Option<BootRom>,
    htif: Htif,
    sifive_test_addr: u64,
}

impl Dispatcher {
    /// Default address of the SiFive test finisher.
    pub const SIFIVE_TEST_ADDR: u64 = 0x5000_0000;

    /// Creates a dispatcher over the capture channel and address map.
    #[must_use]
    pub fn new(chan: Arc<HostChannel>, bus: GuestMemoryBus, htif: Htif) -> Self {
        Self {
            chan,
            bus,
            rom: None,
            htif,
            sifive_test_addr: Self::SIFIVE_TEST_ADDR,
        }
    }

    /// Maps a boot ROM image.
    pub fn set_rom(&mut self, rom: BootRom) {
        self.rom = Some(rom);
    }

    /// Moves the test finisher.
    pub fn set_sifive_test_addr(&mut self, addr: u64) {
        self.sifive_test_addr = addr;
    }

    /// The HTIF mailbox (for address overrides and input enable).
    pub fn htif_mut(&mut self) -> &mut Htif {
        &mut self.htif
    }

    /// Polls the capture unit and services one request if one is latched.
    ///
    /// # Errors
    ///
    /// Returns an error if the side-band channel fails.
    pub fn serve_one(&mut self) -> Result<Served> {
        if !self.chan.has_pending_request()? {
            return Ok(Served::Idle);
        }

        let outcome = match self.chan.get_request()? {
            Request::Write {
                addr,
                data,
                byte_enable,
            } => self.serve_write(u64::from(addr), data, byte_enable),
            Request::Read { addr, id, burst } => {
                let data = self.serve_read(u64::from(addr), id, burst);
                self.chan.respond_read(data)?;
                Served::Handled
            }
        };

        self.chan.respond_ack()?;
        Ok(outcome)
    }

    fn serve_write(&mut self, addr: u64, mut data: u64, byte_enable: u8) -> Served {
        if let Some((offset, handler)) = self.bus.lookup(addr) {
            if addr & 4 != 0 {
                // 32-bit write to the upper lane of the 64-bit bus.
                data >>= 32;
            }
            tracing::trace!(
                "virtio write addr {addr:#010x} offset {offset:#x} data {data:#010x} byen {byte_enable:#x}"
            );
            handler.write(offset, data, 2);
            Served::Handled
        } else if addr == self.htif.tohost_addr() {
            match self.htif.tohost_write(data) {
                HtifEffect::Handled => Served::Handled,
                HtifEffect::Exit(code) => Served::Exit(code),
            }
        } else if addr == self.htif.fromhost_addr() {
            Served::Handled
        } else if addr == self.sifive_test_addr {
            self.serve_finisher(data)
        } else {
            if !QUIET_STRAYS.contains(&addr) {
                tracing::warn!("stray write addr {addr:#010x} data {data:#x} byen {byte_enable:#x}");
            }
            Served::Handled
        }
    }

    /// The finisher register is in the device tree, so unmodified boot
    /// loaders use it for shutdown; keep it quiet on the known codes.
    fn serve_finisher(&self, data: u64) -> Served {
        let status = data as u16;
        match status {
            FINISHER_PASS => Served::Exit(0),
            FINISHER_FAIL => Served::Exit((data >> 16) as u16 as i32),
            FINISHER_RESET => Served::Exit(EXIT_CODE_RESET),
            other => {
                tracing::warn!(status = other, "unhandled test finisher write");
                Served::Handled
            }
        }
    }

    fn serve_read(&mut self, addr: u64, id: u16, burst: u8) -> u64 {
        if burst != 0 {
            // Burst reads are untested on the capture unit and never
            // issued by the deployed core.
            tracing::warn!(addr = addr, burst, "dropping burst read");
            return 0;
        }

        if let Some((offset, handler)) = self.bus.lookup(addr) {
            let mut val = handler.read(offset, 2);
            if offset & 7 == 4 {
                // The 64-bit data lane carries odd words in its upper half.
                val <<= 32;
            }
            tracing::trace!("virtio read addr {addr:#010x} offset {offset:#x} id {id} val {val:#x}");
            val
        } else if self.rom.as_ref().is_some_and(|rom| rom.contains(addr)) {
            self.rom.as_ref().map_or(0, |rom| rom.word_at(addr))
        } else if addr == self.htif.fromhost_addr() {
            self.htif.fromhost_read()
        } else if addr == self.sifive_test_addr {
            0
        } else {
            if !QUIET_STRAYS.contains(&addr) {
                tracing::warn!("stray read addr {addr:#010x} id {id}");
            }
            0
        }
    }
}
