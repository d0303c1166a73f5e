//! Top-level assembly: the dispatcher, the virtio stack, and the run
//! lifecycle, glued to the FMEM side-band.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use vdev_fmem::HostChannel;
use vdev_virtio::{GuestDma, IrqController};

use crate::control::IoControl;
use crate::dispatch::{Dispatcher, Served};
use crate::error::Result;
use crate::htif::{CharSink, Htif, StdinQueue, StdoutSink};
use crate::rom::BootRom;
use crate::stack::VirtioStack;

/// Default base of the HTIF mailbox.
pub const HTIF_BASE_ADDR: u64 = 0x1000_1000;

/// [`GuestDma`] over the coherent FMEM window.
///
/// The engine's DMA seam is infallible; a failure on a descriptor that
/// opened successfully means the side-band is gone, so this adapter logs
/// and aborts rather than returning corrupt ring state.
pub struct FmemDma {
    chan: Arc<HostChannel>,
}

impl FmemDma {
    /// Wraps the channel's DMA window.
    #[must_use]
    pub fn new(chan: Arc<HostChannel>) -> Self {
        Self { chan }
    }
}

impl GuestDma for FmemDma {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        if let Err(err) = self.chan.dma_read(addr, buf) {
            tracing::error!(addr, %err, "dma read failed");
            std::process::abort();
        }
    }

    fn write(&self, addr: u64, buf: &[u8]) {
        if let Err(err) = self.chan.dma_write(addr, buf) {
            tracing::error!(addr, %err, "dma write failed");
            std::process::abort();
        }
    }
}

/// [`IrqController`] over the FMEM interrupt mailbox.
pub struct HostIrq {
    chan: Arc<HostChannel>,
}

impl HostIrq {
    /// Wraps the channel's interrupt registers.
    #[must_use]
    pub fn new(chan: Arc<HostChannel>) -> Self {
        Self { chan }
    }
}

impl IrqController for HostIrq {
    fn set_levels(&self, mask: u32) {
        if let Err(err) = self.chan.set_irq_levels(mask) {
            tracing::error!(mask, %err, "irq set failed");
            std::process::abort();
        }
    }

    fn clear_levels(&self, mask: u32) {
        if let Err(err) = self.chan.clear_irq_levels(mask) {
            tracing::error!(mask, %err, "irq clear failed");
            std::process::abort();
        }
    }
}

/// The assembled device emulator.
pub struct Emulator {
    dispatcher: Dispatcher,
    stack: VirtioStack,
    control: IoControl,
    stdin: Arc<StdinQueue>,
}

impl Emulator {
    /// Assembles the emulator. `stack` must already carry its devices;
    /// its memory bus moves into the dispatcher here.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop pipe cannot be created.
    pub fn new(chan: Arc<HostChannel>, stack: VirtioStack, rom: Option<BootRom>) -> Result<Self> {
        Self::with_sink(chan, stack, rom, Box::new(StdoutSink))
    }

    /// Like [`Self::new`], but with an explicit console-output sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop pipe cannot be created.
    pub fn with_sink(
        chan: Arc<HostChannel>,
        mut stack: VirtioStack,
        rom: Option<BootRom>,
        sink: Box<dyn CharSink>,
    ) -> Result<Self> {
        let stdin = Arc::new(StdinQueue::new());
        let htif = Htif::new(HTIF_BASE_ADDR, stdin.clone(), sink);
        let mut dispatcher = Dispatcher::new(chan, stack.take_bus(), htif);
        if let Some(rom) = rom {
            dispatcher.set_rom(rom);
        }

        Ok(Self {
            dispatcher,
            stack,
            control: IoControl::new()?,
            stdin,
        })
    }

    /// The host stdin queue feeding HTIF `fromhost` reads.
    #[must_use]
    pub fn stdin(&self) -> Arc<StdinQueue> {
        self.stdin.clone()
    }

    /// The HTIF mailbox, for address overrides and input enable.
    pub fn htif_mut(&mut self) -> &mut Htif {
        self.dispatcher.htif_mut()
    }

    /// The device stack.
    pub fn stack(&mut self) -> &mut VirtioStack {
        &mut self.stack
    }

    /// Moves the test finisher register.
    pub fn set_sifive_test_addr(&mut self, addr: u64) {
        self.dispatcher.set_sifive_test_addr(addr);
    }

    /// The stop pipe's read end for the external terminal pump.
    #[must_use]
    pub fn take_stop_fd(&self) -> Option<OwnedFd> {
        self.control.take_stop_fd()
    }

    /// Starts the notify worker.
    pub fn start_io(&mut self) {
        tracing::info!("start_io");
        self.stack.start();
    }

    /// Services at most one captured guest access; a guest-requested exit
    /// triggers [`Self::stop_io`] before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the side-band channel fails.
    pub fn serve_one(&mut self) -> Result<Served> {
        let served = self.dispatcher.serve_one()?;
        if let Served::Exit(code) = served {
            self.stop_io(code);
        }
        Ok(served)
    }

    /// Initiates shutdown: latches the exit code, pokes the stop pipe, and
    /// tells the notify worker to wind down.
    pub fn stop_io(&mut self, code: i32) {
        self.control.request_stop(code);
        self.stack.stop();
    }

    /// Waits for the notify worker and reports the exit code.
    pub fn join_io(&mut self) -> i32 {
        self.stack.join();
        self.control.exit_code()
    }
}
