//! VirtIO device assembly.
//!
//! [`VirtioStack`] places devices in the guest address map (one `0x1000`
//! window each, starting at [`VIRTIO_BASE_ADDR`]), allocates their IRQ
//! lines, and owns the notify worker's lifecycle.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use vdev_virtio::blk::{BlockBackend, VirtioBlock};
use vdev_virtio::console::{ConsoleSink, VirtioConsole};
use vdev_virtio::entropy::{EntropySource, VirtioEntropy};
use vdev_virtio::input::{InputKind, VirtioInput};
use vdev_virtio::net::{NetBackend, VirtioNet};
use vdev_virtio::p9::{FsBackend, VirtioNineP};
use vdev_virtio::{
    DeviceHandle, GuestDma, IrqController, IrqLine, NotifyScheduler, VirtioBus, VirtioDevice,
};

use crate::bus::{GuestMemoryBus, MmioHandler};
use crate::error::Result;

/// First guest physical address handed to a virtio device.
pub const VIRTIO_BASE_ADDR: u64 = 0x4000_0000;
/// Size of each device's MMIO window.
pub const VIRTIO_WINDOW_SIZE: u64 = 0x1000;
/// First IRQ number handed to a virtio device.
pub const FIRST_VIRTIO_IRQ: u32 = 3;
/// The host interrupt register keeps its low bits for non-virtio lines.
const IRQ_BIT_OFFSET: u32 = 2;

/// Adapts a device's MMIO window onto the guest memory bus.
pub struct VirtioWindow {
    dev: Arc<Mutex<dyn VirtioDevice>>,
}

impl VirtioWindow {
    /// Wraps a device for bus registration.
    #[must_use]
    pub fn new(dev: Arc<Mutex<dyn VirtioDevice>>) -> Self {
        Self { dev }
    }
}

impl MmioHandler for VirtioWindow {
    fn read(&mut self, offset: u32, size_log2: u32) -> u64 {
        u64::from(
            self.dev
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .mmio_read(offset, size_log2),
        )
    }

    fn write(&mut self, offset: u32, val: u64, size_log2: u32) {
        self.dev
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .mmio_write(offset, val as u32, size_log2);
    }
}

/// The set of virtio devices behind the dispatcher.
pub struct VirtioStack {
    dma: Arc<dyn GuestDma>,
    irq_ctl: Arc<dyn IrqController>,
    scheduler: Arc<NotifyScheduler>,
    bus: GuestMemoryBus,
    handles: Vec<DeviceHandle>,
    worker: Option<JoinHandle<()>>,
    next_addr: u64,
    next_irq: u32,

    net: Option<Arc<Mutex<VirtioNet>>>,
    console: Option<Arc<Mutex<VirtioConsole>>>,
    block: Option<Arc<Mutex<VirtioBlock>>>,
    entropy: Option<Arc<Mutex<VirtioEntropy>>>,
    input: Option<Arc<Mutex<VirtioInput>>>,
    ninep: Option<Arc<Mutex<VirtioNineP>>>,
}

impl VirtioStack {
    /// Creates an empty stack over the given DMA window and interrupt
    /// controller.
    #[must_use]
    pub fn new(dma: Arc<dyn GuestDma>, irq_ctl: Arc<dyn IrqController>) -> Self {
        Self {
            dma,
            irq_ctl,
            scheduler: NotifyScheduler::new(),
            bus: GuestMemoryBus::new(),
            handles: Vec::new(),
            worker: None,
            next_addr: VIRTIO_BASE_ADDR,
            next_irq: FIRST_VIRTIO_IRQ,
            net: None,
            console: None,
            block: None,
            entropy: None,
            input: None,
            ninep: None,
        }
    }

    /// Allocates the next MMIO window and IRQ line.
    fn next_bus(&mut self) -> VirtioBus {
        let irq = IrqLine::new(self.irq_ctl.clone(), self.next_irq + IRQ_BIT_OFFSET);
        self.next_irq += 1;
        VirtioBus {
            dma: self.dma.clone(),
            irq,
            scheduler: self.scheduler.clone(),
        }
    }

    fn place(&mut self, dev: Arc<Mutex<dyn VirtioDevice>>) -> Result<()> {
        let pending = dev
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .core()
            .notify_bits();
        self.bus.register(
            self.next_addr,
            VIRTIO_WINDOW_SIZE,
            Box::new(VirtioWindow::new(dev.clone())),
        )?;
        self.next_addr += VIRTIO_WINDOW_SIZE;
        self.handles.push(DeviceHandle { pending, dev });
        Ok(())
    }

    /// Adds a network device.
    ///
    /// # Errors
    ///
    /// Returns an error if the MMIO window cannot be registered.
    pub fn add_net(
        &mut self,
        backend: Box<dyn NetBackend>,
        mac: [u8; 6],
    ) -> Result<Arc<Mutex<VirtioNet>>> {
        let bus = self.next_bus();
        let dev = VirtioNet::new(&bus, backend, mac);
        self.place(dev.clone())?;
        self.net = Some(dev.clone());
        Ok(dev)
    }

    /// Adds an entropy device.
    ///
    /// # Errors
    ///
    /// Returns an error if the MMIO window cannot be registered.
    pub fn add_entropy(
        &mut self,
        source: Box<dyn EntropySource>,
    ) -> Result<Arc<Mutex<VirtioEntropy>>> {
        let bus = self.next_bus();
        let dev = VirtioEntropy::new(&bus, source);
        self.place(dev.clone())?;
        self.entropy = Some(dev.clone());
        Ok(dev)
    }

    /// Adds a block device.
    ///
    /// # Errors
    ///
    /// Returns an error if the MMIO window cannot be registered.
    pub fn add_block(
        &mut self,
        backend: Box<dyn BlockBackend>,
    ) -> Result<Arc<Mutex<VirtioBlock>>> {
        let bus = self.next_bus();
        let dev = VirtioBlock::new(&bus, backend);
        self.place(dev.clone())?;
        self.block = Some(dev.clone());
        Ok(dev)
    }

    /// Adds a console device.
    ///
    /// # Errors
    ///
    /// Returns an error if the MMIO window cannot be registered.
    pub fn add_console(
        &mut self,
        sink: Box<dyn ConsoleSink>,
    ) -> Result<Arc<Mutex<VirtioConsole>>> {
        let bus = self.next_bus();
        let dev = VirtioConsole::new(&bus, sink);
        self.place(dev.clone())?;
        self.console = Some(dev.clone());
        Ok(dev)
    }

    /// Adds an input device.
    ///
    /// # Errors
    ///
    /// Returns an error if the MMIO window cannot be registered.
    pub fn add_input(&mut self, kind: InputKind) -> Result<Arc<Mutex<VirtioInput>>> {
        let bus = self.next_bus();
        let dev = VirtioInput::new(&bus, kind);
        self.place(dev.clone())?;
        self.input = Some(dev.clone());
        Ok(dev)
    }

    /// Adds a 9P filesystem device.
    ///
    /// # Errors
    ///
    /// Returns an error if the MMIO window cannot be registered.
    pub fn add_9p(
        &mut self,
        fs: Box<dyn FsBackend>,
        mount_tag: &str,
    ) -> Result<Arc<Mutex<VirtioNineP>>> {
        let bus = self.next_bus();
        let dev = VirtioNineP::new(&bus, fs, mount_tag);
        self.place(dev.clone())?;
        self.ninep = Some(dev.clone());
        Ok(dev)
    }

    /// The network device, if one was added.
    #[must_use]
    pub fn net(&self) -> Option<Arc<Mutex<VirtioNet>>> {
        self.net.clone()
    }

    /// The console device, if one was added.
    #[must_use]
    pub fn console(&self) -> Option<Arc<Mutex<VirtioConsole>>> {
        self.console.clone()
    }

    /// The block device, if one was added.
    #[must_use]
    pub fn block(&self) -> Option<Arc<Mutex<VirtioBlock>>> {
        self.block.clone()
    }

    /// The entropy device, if one was added.
    #[must_use]
    pub fn entropy(&self) -> Option<Arc<Mutex<VirtioEntropy>>> {
        self.entropy.clone()
    }

    /// The input device, if one was added.
    #[must_use]
    pub fn input(&self) -> Option<Arc<Mutex<VirtioInput>>> {
        self.input.clone()
    }

    /// The 9P device, if one was added.
    #[must_use]
    pub fn ninep(&self) -> Option<Arc<Mutex<VirtioNineP>>> {
        self.ninep.clone()
    }

    /// The notify scheduler shared with device producers.
    #[must_use]
    pub fn scheduler(&self) -> Arc<NotifyScheduler> {
        self.scheduler.clone()
    }

    /// Takes the populated guest memory bus for the dispatcher. Call after
    /// every device has been added.
    pub fn take_bus(&mut self) -> GuestMemoryBus {
        std::mem::take(&mut self.bus)
    }

    /// Spawns the notify worker over every device added so far.
    pub fn start(&mut self) {
        if self.worker.is_none() {
            let handles = std::mem::take(&mut self.handles);
            tracing::info!(devices = handles.len(), "starting virtio stack");
            self.worker = Some(self.scheduler.spawn(handles));
        }
    }

    /// Asks the notify worker to exit.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Waits for the notify worker to exit.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("notify worker panicked");
            }
        }
    }
}
