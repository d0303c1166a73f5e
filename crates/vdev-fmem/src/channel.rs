//! The three-channel host side-band: capture unit, DMA window, IRQ mailbox.

use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::Result;
use crate::fmem::Fmem;

/// Capture-unit register offsets.
pub mod regs {
    /// Latched read address (u32).
    pub const VD_READ_ADDR: u64 = 0x0000;
    /// Flit size of the latched read (u8).
    pub const VD_FLIT_SIZE: u64 = 0x0008;
    /// Burst beat count of the latched read (u8).
    pub const VD_BURST_CNT: u64 = 0x000c;
    /// Response data for a read request (u64).
    pub const VD_READ_DATA: u64 = 0x0040;
    /// Latched write address (u32).
    pub const VD_WRITE_ADDR: u64 = 0x1000;
    /// Latched write byte-enable mask (u8).
    pub const VD_WRITE_BYEN: u64 = 0x1008;
    /// Latched write data (u64).
    pub const VD_WRITE_DATA: u64 = 0x1040;
    /// Write 1 to release the response to the guest (u32).
    pub const VD_SEND_RESP: u64 = 0x2000;
    /// ID of the latched request (u32, low 16 bits valid).
    pub const VD_REQ_ID: u64 = 0x2004;
    /// Non-zero when the latched request is a write (u8).
    pub const VD_IS_WRITE: u64 = 0x2006;
    /// Non-zero while a request is latched (u8).
    pub const VD_REQ_LEVEL: u64 = 0x2007;
    /// Write 1 to start capturing guest accesses (u32).
    pub const VD_ENABLE: u64 = 0x2008;
}

/// IRQ mailbox register offsets: a write-1-to-set word followed by a
/// write-1-to-clear word.
const IRQ_W1S: u64 = 0;
const IRQ_W1C: u64 = 4;

/// Paths of the three side-band device files.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Capture unit management interface.
    pub virtual_device: PathBuf,
    /// Coherent window onto guest physical memory.
    pub dma: PathBuf,
    /// Interrupt set/clear register pair.
    pub interrupts: PathBuf,
}

impl ChannelConfig {
    /// Builds a config from the `RISCV_*_FMEM_DEV` environment variables,
    /// falling back to the standard device nodes.
    #[must_use]
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            env::var_os(name).map_or_else(|| PathBuf::from(default), PathBuf::from)
        };
        Self {
            virtual_device: var(
                "RISCV_VIRTUAL_DEVICE_FMEM_DEV",
                "/dev/fmem_sys0_virtual_device",
            ),
            dma: var("RISCV_DMA_FMEM_DEV", "/dev/fmem_sys0_dma"),
            interrupts: var("RISCV_INTERRUPT_FMEM_DEV", "/dev/fmem_sys0_interrupts"),
        }
    }
}

/// A guest MMIO access latched by the capture unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Guest store. `data` holds the full 64-bit lane; `byte_enable` marks
    /// the valid bytes within it.
    Write {
        addr: u32,
        data: u64,
        byte_enable: u8,
    },
    /// Guest load. `burst` is the AXI beat count minus one; anything but
    /// zero is outside what the emulator services.
    Read { addr: u32, id: u16, burst: u8 },
}

/// The bundled side-band channels.
///
/// Created once at startup; the DMA channel must be usable or startup
/// fails outright, since every virtqueue operation depends on it.
#[derive(Debug)]
pub struct HostChannel {
    mmio: Fmem,
    dma: Fmem,
    irq: Fmem,
    /// Shadow of the guest-visible IRQ levels. Guarded so that set and
    /// clear from different threads do not interleave against the
    /// hardware register.
    irq_state: Mutex<u32>,
}

impl HostChannel {
    /// Opens the three side-band devices and enables the capture unit.
    ///
    /// # Errors
    ///
    /// Returns an error if any device file cannot be opened or the enable
    /// write fails. Callers treat a failure here as fatal.
    pub fn open(config: &ChannelConfig) -> Result<Self> {
        let mmio = Fmem::open(&config.virtual_device)?;
        let dma = Fmem::open(&config.dma)?;
        let irq = Fmem::open(&config.interrupts)?;

        // Start capturing all guest reads and writes.
        mmio.write32(regs::VD_ENABLE, 1)?;
        tracing::info!(
            "virtual device capture enabled ({})",
            config.virtual_device.display()
        );

        Ok(Self {
            mmio,
            dma,
            irq,
            irq_state: Mutex::new(0),
        })
    }

    /// Returns whether the capture unit holds an unanswered guest access.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the read.
    pub fn has_pending_request(&self) -> Result<bool> {
        Ok(self.mmio.read8(regs::VD_REQ_LEVEL)? != 0)
    }

    /// Reads the latched request out of the capture unit.
    ///
    /// Only meaningful after [`Self::has_pending_request`] reported `true`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses a read.
    pub fn get_request(&self) -> Result<Request> {
        if self.mmio.read8(regs::VD_IS_WRITE)? != 0 {
            Ok(Request::Write {
                addr: self.mmio.read32(regs::VD_WRITE_ADDR)?,
                data: self.mmio.read64(regs::VD_WRITE_DATA)?,
                byte_enable: self.mmio.read8(regs::VD_WRITE_BYEN)?,
            })
        } else {
            Ok(Request::Read {
                addr: self.mmio.read32(regs::VD_READ_ADDR)?,
                id: self.mmio.read32(regs::VD_REQ_ID)? as u16,
                burst: self.mmio.read8(regs::VD_BURST_CNT)?,
            })
        }
    }

    /// Stages the response data for a latched read request.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the write.
    pub fn respond_read(&self, data: u64) -> Result<()> {
        self.mmio.write64(regs::VD_READ_DATA, data)
    }

    /// Releases the staged response (or the bare write acknowledgement)
    /// back to the guest.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the write.
    pub fn respond_ack(&self) -> Result<()> {
        self.mmio.write32(regs::VD_SEND_RESP, 1)
    }

    /// Copies guest memory into `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the DMA descriptor refuses the read.
    pub fn dma_read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.dma.read_bytes(addr, buf)
    }

    /// Copies `buf` into guest memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the DMA descriptor refuses the write.
    pub fn dma_write(&self, addr: u64, buf: &[u8]) -> Result<()> {
        self.dma.write_bytes(addr, buf)
    }

    /// Raises the interrupt lines in `mask` (write-1-to-set).
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the write.
    pub fn set_irq_levels(&self, mask: u32) -> Result<()> {
        let mut state = self.irq_state.lock().unwrap_or_else(|e| e.into_inner());
        self.irq.write32(IRQ_W1S, mask)?;
        *state |= mask;
        Ok(())
    }

    /// Lowers the interrupt lines in `mask` (write-1-to-clear).
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the write.
    pub fn clear_irq_levels(&self, mask: u32) -> Result<()> {
        let mut state = self.irq_state.lock().unwrap_or_else(|e| e.into_inner());
        self.irq.write32(IRQ_W1C, mask)?;
        *state &= !mask;
        Ok(())
    }

    /// Returns the shadow copy of the guest-visible IRQ levels.
    #[must_use]
    pub fn irq_levels(&self) -> u32 {
        *self.irq_state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
