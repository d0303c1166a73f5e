//! Device base: register file, feature negotiation, and the virtqueue
//! engine.
//!
//! [`VirtioCore`] holds the device-agnostic state every backend shares and
//! implements the ring operations over [`GuestDma`]. Backends embed a core
//! and implement [`VirtioDevice`]; the provided trait methods supply the
//! complete MMIO transport so the dispatcher can treat every device
//! uniformly.
//!
//! Ring ordering follows the VirtIO spec: the available index read is
//! followed by an acquire fence before descriptors are fetched, and all
//! payload writes are separated from the used index store by a release
//! fence. The used-ring index update is the single publish point; the IRQ
//! is raised strictly after it.

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use crate::dma::GuestDma;
use crate::error::{Result, VirtioError};
use crate::irq::IrqLine;
use crate::mmio::{self, int_status, regs, MAX_CONFIG_SPACE_SIZE, MAX_QUEUE, MAX_QUEUE_NUM};
use crate::notify::NotifyScheduler;
use crate::queue::{Desc, QueueState};
use crate::status;

/// Outcome of delivering one available chain to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// The chain was handled (or queued asynchronously); keep draining.
    Done,
    /// The device cannot take more work; the drain stops until the device
    /// re-kicks the queue itself.
    Stall,
}

/// Everything a device needs from its surroundings: the DMA window, its
/// interrupt line, and the notify scheduler.
#[derive(Clone)]
pub struct VirtioBus {
    /// Guest memory access.
    pub dma: Arc<dyn GuestDma>,
    /// The device's interrupt line.
    pub irq: IrqLine,
    /// Scheduler woken on guest queue notifications.
    pub scheduler: Arc<NotifyScheduler>,
}

/// Device-agnostic VirtIO state and the virtqueue engine.
pub struct VirtioCore {
    pub(crate) device_id: u32,
    pub(crate) vendor_id: u32,
    pub(crate) device_features: u64,
    pub(crate) driver_features: u64,
    pub(crate) negotiated_features: u64,
    pub(crate) device_features_sel: u32,
    pub(crate) driver_features_sel: u32,
    pub(crate) queue_sel: u32,
    pub(crate) queues: [QueueState; MAX_QUEUE],
    pub(crate) status: u32,
    pub(crate) int_status: u32,
    pub(crate) config_space: [u8; MAX_CONFIG_SPACE_SIZE],
    pub(crate) config_space_size: usize,
    pub(crate) dma: Arc<dyn GuestDma>,
    pub(crate) irq: IrqLine,
    pending_notify: Arc<AtomicU32>,
    scheduler: Arc<NotifyScheduler>,
}

impl VirtioCore {
    /// Creates the core for a device of type `device_id` with
    /// `config_space_size` bytes of config space (capped at
    /// [`MAX_CONFIG_SPACE_SIZE`]).
    #[must_use]
    pub fn new(bus: &VirtioBus, device_id: u32, config_space_size: usize) -> Self {
        let mut core = Self {
            device_id,
            vendor_id: mmio::VENDOR_ID,
            device_features: 0,
            driver_features: 0,
            negotiated_features: 0,
            device_features_sel: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            queues: Default::default(),
            status: 0,
            int_status: 0,
            config_space: [0; MAX_CONFIG_SPACE_SIZE],
            config_space_size: config_space_size.min(MAX_CONFIG_SPACE_SIZE),
            dma: bus.dma.clone(),
            irq: bus.irq.clone(),
            pending_notify: Arc::new(AtomicU32::new(0)),
            scheduler: bus.scheduler.clone(),
        };
        core.reset();
        core
    }

    /// Puts the device back into its post-construction state: queues
    /// cleared, negotiation undone, interrupt status dropped.
    ///
    /// `manual_recv` is a device property, not driver state, so it
    /// survives.
    pub fn reset(&mut self) {
        self.status = 0;
        self.queue_sel = 0;
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.int_status = 0;
        for qs in &mut self.queues {
            qs.ready = false;
            qs.num = MAX_QUEUE_NUM;
            qs.desc_addr = 0;
            qs.avail_addr = 0;
            qs.used_addr = 0;
            qs.avail_idx = 0;
            qs.last_avail_idx = 0;
        }
        self.driver_features = 0;
        self.negotiated_features = 0;
    }

    /// Sets the feature bits the device offers.
    pub fn offer_features(&mut self, features: u64) {
        self.device_features = features;
    }

    /// Marks a queue as pull-driven: notifications cache the available
    /// index but do not invoke `recv`.
    pub fn set_manual_recv(&mut self, queue_idx: usize) {
        self.queues[queue_idx].manual_recv = true;
    }

    /// Current status register value.
    #[must_use]
    pub const fn status(&self) -> u32 {
        self.status
    }

    /// Current interrupt status register value.
    #[must_use]
    pub const fn int_status(&self) -> u32 {
        self.int_status
    }

    /// Features accepted at the `FEATURES_OK` handshake, zero before it.
    #[must_use]
    pub const fn negotiated_features(&self) -> u64 {
        self.negotiated_features
    }

    /// State of one queue, if `queue_idx` is in range.
    #[must_use]
    pub fn queue(&self, queue_idx: usize) -> Option<&QueueState> {
        self.queues.get(queue_idx)
    }

    /// The notify bitset drained by the scheduler worker.
    #[must_use]
    pub fn notify_bits(&self) -> Arc<AtomicU32> {
        self.pending_notify.clone()
    }

    /// Records a guest notification for `queue_idx` and wakes the worker.
    pub fn async_queue_notify(&self, queue_idx: u32) {
        self.pending_notify
            .fetch_or(1 << queue_idx, Ordering::Release);
        self.scheduler.kick();
    }

    // ------------------------------------------------------------------
    // Descriptor chains
    // ------------------------------------------------------------------

    /// Fetches descriptor `desc_idx` of `queue_idx` from guest memory.
    #[must_use]
    pub fn get_desc(&self, queue_idx: usize, desc_idx: u16) -> Desc {
        let mut bytes = [0u8; 16];
        self.dma
            .read(self.queues[queue_idx].desc_addr_of(desc_idx), &mut bytes);
        Desc::from_bytes(&bytes)
    }

    /// Walks the chain at `desc_idx` and totals the readable and writable
    /// byte counts.
    ///
    /// # Errors
    ///
    /// Returns [`VirtioError::InvalidChain`] if a readable descriptor
    /// follows a writable one.
    pub fn desc_rw_size(&self, queue_idx: usize, desc_idx: u16) -> Result<(usize, usize)> {
        let mut read_size = 0usize;
        let mut write_size = 0usize;
        let mut desc = self.get_desc(queue_idx, desc_idx);

        loop {
            if desc.is_write() {
                break;
            }
            read_size += desc.len as usize;
            if !desc.has_next() {
                return Ok((read_size, write_size));
            }
            desc = self.get_desc(queue_idx, desc.next);
        }

        loop {
            if !desc.is_write() {
                return Err(VirtioError::InvalidChain(
                    "readable descriptor after writable".to_string(),
                ));
            }
            write_size += desc.len as usize;
            if !desc.has_next() {
                break;
            }
            desc = self.get_desc(queue_idx, desc.next);
        }

        Ok((read_size, write_size))
    }

    /// Advances to the descriptor containing linear `offset` within the
    /// chain window of the requested direction.
    fn seek(
        &self,
        queue_idx: usize,
        desc_idx: u16,
        mut offset: usize,
        want_write: bool,
    ) -> Result<(Desc, usize)> {
        let mut desc = self.get_desc(queue_idx, desc_idx);

        if want_write {
            while !desc.is_write() {
                if !desc.has_next() {
                    return Err(VirtioError::InvalidChain(
                        "no writable descriptor in chain".to_string(),
                    ));
                }
                desc = self.get_desc(queue_idx, desc.next);
            }
        }

        loop {
            if desc.is_write() != want_write {
                return Err(VirtioError::InvalidChain(
                    "descriptor direction flips mid-window".to_string(),
                ));
            }
            if offset < desc.len as usize {
                return Ok((desc, offset));
            }
            if !desc.has_next() {
                return Err(VirtioError::InvalidChain(
                    "offset past end of chain".to_string(),
                ));
            }
            offset -= desc.len as usize;
            desc = self.get_desc(queue_idx, desc.next);
        }
    }

    /// Gathers `buf.len()` bytes from the readable window of the chain,
    /// starting at linear `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VirtioError::InvalidChain`] if the window is too short or
    /// malformed.
    pub fn copy_from_queue(
        &self,
        queue_idx: usize,
        desc_idx: u16,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let (mut desc, mut offset) = self.seek(queue_idx, desc_idx, offset, false)?;
        let mut pos = 0;
        loop {
            let n = (buf.len() - pos).min(desc.len as usize - offset);
            self.dma
                .read(desc.addr + offset as u64, &mut buf[pos..pos + n]);
            pos += n;
            if pos == buf.len() {
                return Ok(());
            }
            offset += n;
            if offset == desc.len as usize {
                if !desc.has_next() {
                    return Err(VirtioError::InvalidChain(
                        "readable window shorter than request".to_string(),
                    ));
                }
                desc = self.get_desc(queue_idx, desc.next);
                if desc.is_write() {
                    return Err(VirtioError::InvalidChain(
                        "readable window shorter than request".to_string(),
                    ));
                }
                offset = 0;
            }
        }
    }

    /// Scatters `buf` into the writable window of the chain, starting at
    /// linear `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VirtioError::InvalidChain`] if the window is too short or
    /// malformed.
    pub fn copy_to_queue(
        &self,
        queue_idx: usize,
        desc_idx: u16,
        offset: usize,
        buf: &[u8],
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let (mut desc, mut offset) = self.seek(queue_idx, desc_idx, offset, true)?;
        let mut pos = 0;
        loop {
            let n = (buf.len() - pos).min(desc.len as usize - offset);
            self.dma.write(desc.addr + offset as u64, &buf[pos..pos + n]);
            pos += n;
            if pos == buf.len() {
                return Ok(());
            }
            offset += n;
            if offset == desc.len as usize {
                if !desc.has_next() {
                    return Err(VirtioError::InvalidChain(
                        "writable window shorter than payload".to_string(),
                    ));
                }
                desc = self.get_desc(queue_idx, desc.next);
                if !desc.is_write() {
                    return Err(VirtioError::InvalidChain(
                        "writable window shorter than payload".to_string(),
                    ));
                }
                offset = 0;
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Publishes a consumed chain into the used ring and raises the IRQ.
    ///
    /// All payload writes must already have been issued; the release fence
    /// orders them before the index store the driver polls.
    pub fn consume_desc(&mut self, queue_idx: usize, desc_idx: u16, desc_len: usize) {
        let qs = &self.queues[queue_idx];
        let used_idx = self.dma.read_u16(qs.used_idx_addr());

        let elem = qs.used_elem_addr(used_idx);
        self.dma.write_u32(elem, u32::from(desc_idx));
        self.dma.write_u32(elem + 4, desc_len as u32);

        fence(Ordering::Release);
        self.dma
            .write_u16(qs.used_idx_addr(), used_idx.wrapping_add(1));

        self.int_status |= int_status::USED_RING;
        self.irq.raise();
    }

    /// Signals a device config space change to the driver.
    pub fn config_change_notify(&mut self) {
        self.int_status |= int_status::CONFIG_CHANGE;
        self.irq.raise();
    }

    /// Next available descriptor head of a pull-driven queue, if the
    /// cached available index shows one.
    #[must_use]
    pub fn peek_avail_desc(&self, queue_idx: usize) -> Option<u16> {
        let qs = &self.queues[queue_idx];
        if !qs.ready || qs.last_avail_idx == qs.avail_idx {
            return None;
        }
        Some(self.dma.read_u16(qs.avail_slot_addr(qs.last_avail_idx)))
    }

    /// Consumes one available-ring slot of a pull-driven queue.
    pub fn advance_avail(&mut self, queue_idx: usize) {
        let qs = &mut self.queues[queue_idx];
        qs.last_avail_idx = qs.last_avail_idx.wrapping_add(1);
    }

    // ------------------------------------------------------------------
    // Config space
    // ------------------------------------------------------------------

    /// Seeds config space bytes at `offset`. Intended for device
    /// constructors and config-change events.
    pub fn set_config(&mut self, offset: usize, bytes: &[u8]) {
        let end = (offset + bytes.len()).min(self.config_space_size);
        if offset < end {
            self.config_space[offset..end].copy_from_slice(&bytes[..end - offset]);
        }
    }

    /// The device's config space.
    #[must_use]
    pub fn config(&self) -> &[u8] {
        &self.config_space[..self.config_space_size]
    }

    fn config_read(&self, offset: u32, size_log2: u32) -> u32 {
        let offset = offset as usize;
        let space = &self.config_space;
        match size_log2 {
            0 if offset < self.config_space_size => u32::from(space[offset]),
            1 if offset + 1 < self.config_space_size => {
                u32::from(u16::from_le_bytes([space[offset], space[offset + 1]]))
            }
            2 if offset + 3 < self.config_space_size => u32::from_le_bytes([
                space[offset],
                space[offset + 1],
                space[offset + 2],
                space[offset + 3],
            ]),
            _ => 0,
        }
    }

    /// Returns whether the write landed (and the device hook should run).
    fn config_write(&mut self, offset: u32, val: u32, size_log2: u32) -> bool {
        let offset = offset as usize;
        match size_log2 {
            0 if offset < self.config_space_size => {
                self.config_space[offset] = val as u8;
                true
            }
            1 if offset + 1 < self.config_space_size => {
                self.config_space[offset..offset + 2]
                    .copy_from_slice(&(val as u16).to_le_bytes());
                true
            }
            2 if offset + 3 < self.config_space_size => {
                self.config_space[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Transport registers
    // ------------------------------------------------------------------

    fn reg_read(&self, offset: u32) -> u32 {
        let qs = &self.queues[self.queue_sel as usize];
        match offset {
            regs::MAGIC => mmio::MAGIC_VALUE,
            regs::VERSION => mmio::VERSION,
            regs::DEVICE_ID => self.device_id,
            regs::VENDOR_ID => self.vendor_id,
            regs::DEVICE_FEATURES => match self.device_features_sel {
                0 => self.device_features as u32,
                1 => (self.device_features >> 32) as u32,
                _ => 0,
            },
            regs::DEVICE_FEATURES_SEL => self.device_features_sel,
            regs::QUEUE_SEL => self.queue_sel,
            regs::QUEUE_NUM_MAX => MAX_QUEUE_NUM,
            regs::QUEUE_NUM => qs.num,
            regs::QUEUE_READY => u32::from(qs.ready),
            regs::QUEUE_DESC_LOW => qs.desc_addr as u32,
            regs::QUEUE_DESC_HIGH => (qs.desc_addr >> 32) as u32,
            regs::QUEUE_AVAIL_LOW => qs.avail_addr as u32,
            regs::QUEUE_AVAIL_HIGH => (qs.avail_addr >> 32) as u32,
            regs::QUEUE_USED_LOW => qs.used_addr as u32,
            regs::QUEUE_USED_HIGH => (qs.used_addr >> 32) as u32,
            regs::INTERRUPT_STATUS => self.int_status,
            regs::STATUS => self.status,
            regs::CONFIG_GENERATION => 0,
            _ => 0,
        }
    }

    fn reg_write(&mut self, offset: u32, val: u32) {
        match offset {
            regs::DEVICE_FEATURES_SEL => self.device_features_sel = val,
            regs::DRIVER_FEATURES_SEL => self.driver_features_sel = val,
            regs::DRIVER_FEATURES => match self.driver_features_sel {
                0 => self.driver_features |= u64::from(val),
                1 => self.driver_features |= u64::from(val) << 32,
                _ => {}
            },
            regs::QUEUE_SEL => {
                if (val as usize) < MAX_QUEUE {
                    self.queue_sel = val;
                }
            }
            regs::QUEUE_NUM => {
                if val.is_power_of_two() {
                    self.queues[self.queue_sel as usize].num = val;
                }
            }
            regs::QUEUE_READY => {
                self.queues[self.queue_sel as usize].ready = val & 1 != 0;
            }
            regs::QUEUE_DESC_LOW => set_low32(self.ring_addr_mut(RingAddr::Desc), val),
            regs::QUEUE_DESC_HIGH => set_high32(self.ring_addr_mut(RingAddr::Desc), val),
            regs::QUEUE_AVAIL_LOW => set_low32(self.ring_addr_mut(RingAddr::Avail), val),
            regs::QUEUE_AVAIL_HIGH => set_high32(self.ring_addr_mut(RingAddr::Avail), val),
            regs::QUEUE_USED_LOW => set_low32(self.ring_addr_mut(RingAddr::Used), val),
            regs::QUEUE_USED_HIGH => set_high32(self.ring_addr_mut(RingAddr::Used), val),
            regs::STATUS => self.write_status(val),
            regs::QUEUE_NOTIFY => {
                if (val as usize) < MAX_QUEUE {
                    self.async_queue_notify(val);
                }
            }
            regs::INTERRUPT_ACK => {
                self.int_status &= !val;
                if self.int_status == 0 {
                    self.irq.lower();
                }
            }
            _ => {
                tracing::trace!("unhandled mmio write at {offset:#x}");
            }
        }
    }

    /// The feature-negotiation gate: a `FEATURES_OK` write commits only if
    /// every driver-requested bit is offered and `VERSION_1` is among
    /// them. On rejection the bit is stripped before the status commits,
    /// which is how the driver observes the failure.
    fn write_status(&mut self, mut val: u32) {
        if self.status & status::FEATURES_OK == 0 && val & status::FEATURES_OK != 0 {
            let negotiated = self.driver_features & self.device_features;
            if negotiated == self.driver_features && negotiated & crate::features::VERSION_1 != 0 {
                tracing::debug!(
                    device_id = self.device_id,
                    "features negotiated: {negotiated:#x}"
                );
                self.negotiated_features = negotiated;
            } else {
                tracing::warn!(
                    device_id = self.device_id,
                    "feature negotiation failed: offered {:#x}, requested {:#x}",
                    self.device_features,
                    self.driver_features
                );
                val ^= status::FEATURES_OK;
            }
        }

        self.status = val;
        if val == 0 {
            tracing::debug!(device_id = self.device_id, "device reset");
            self.irq.lower();
            self.reset();
        }
    }

    fn ring_addr_mut(&mut self, which: RingAddr) -> &mut u64 {
        let qs = &mut self.queues[self.queue_sel as usize];
        match which {
            RingAddr::Desc => &mut qs.desc_addr,
            RingAddr::Avail => &mut qs.avail_addr,
            RingAddr::Used => &mut qs.used_addr,
        }
    }
}

#[derive(Clone, Copy)]
enum RingAddr {
    Desc,
    Avail,
    Used,
}

fn set_low32(addr: &mut u64, val: u32) {
    *addr = (*addr & !0xffff_ffff) | u64::from(val);
}

fn set_high32(addr: &mut u64, val: u32) {
    *addr = (*addr & 0xffff_ffff) | (u64::from(val) << 32);
}

/// A VirtIO device: the shared core plus backend-specific behavior.
///
/// The provided methods implement the whole MMIO transport and the
/// available-ring drain, so backends only supply `recv` and, where
/// needed, a config-write hook.
pub trait VirtioDevice: Send {
    /// The shared register state and ring engine.
    fn core(&self) -> &VirtioCore;

    /// Mutable access to the shared state.
    fn core_mut(&mut self) -> &mut VirtioCore;

    /// Handles one available descriptor chain.
    fn recv(
        &mut self,
        queue_idx: usize,
        desc_idx: u16,
        read_size: usize,
        write_size: usize,
    ) -> RecvStatus;

    /// Invoked after the driver writes the device config space.
    fn config_written(&mut self) {}

    /// Drains the available ring of `queue_idx`, delivering each chain to
    /// [`Self::recv`]. Pull-driven queues only refresh the cached
    /// available index.
    fn queue_notify(&mut self, queue_idx: usize) {
        if queue_idx >= MAX_QUEUE {
            return;
        }

        let avail_idx = {
            let core = self.core();
            core.dma.read_u16(core.queues[queue_idx].avail_idx_addr())
        };
        {
            let core = self.core_mut();
            core.queues[queue_idx].avail_idx = avail_idx;
            if core.queues[queue_idx].manual_recv {
                return;
            }
        }

        fence(Ordering::Acquire);
        loop {
            let (last, slot) = {
                let qs = &self.core().queues[queue_idx];
                if qs.last_avail_idx == avail_idx {
                    break;
                }
                (qs.last_avail_idx, qs.avail_slot_addr(qs.last_avail_idx))
            };

            let desc_idx = self.core().dma.read_u16(slot);
            match self.core().desc_rw_size(queue_idx, desc_idx) {
                Ok((read_size, write_size)) => {
                    if self.recv(queue_idx, desc_idx, read_size, write_size) == RecvStatus::Stall {
                        break;
                    }
                }
                Err(err) => {
                    // The chain is not consumed; the driver sees no
                    // used-ring entry for it.
                    tracing::warn!(queue_idx, desc_idx, %err, "dropping malformed chain");
                }
            }
            self.core_mut().queues[queue_idx].last_avail_idx = last.wrapping_add(1);
        }
    }

    /// MMIO read at `offset` within the device window.
    fn mmio_read(&self, offset: u32, size_log2: u32) -> u32 {
        if offset >= regs::CONFIG {
            return self.core().config_read(offset - regs::CONFIG, size_log2);
        }
        if size_log2 == 2 {
            self.core().reg_read(offset)
        } else {
            0
        }
    }

    /// MMIO write at `offset` within the device window.
    fn mmio_write(&mut self, offset: u32, val: u32, size_log2: u32) {
        if offset >= regs::CONFIG {
            if self
                .core_mut()
                .config_write(offset - regs::CONFIG, val, size_log2)
            {
                self.config_written();
            }
            return;
        }
        if size_log2 == 2 {
            self.core_mut().reg_write(offset, val);
        }
    }
}
