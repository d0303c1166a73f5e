//! Positioned register access over an FMEM device file.
//!
//! FMEM devices present a flat register space addressed by file offset.
//! Accesses must use the natural width of the target register, so the
//! wrapper exposes one method per width instead of a generic read.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{ChannelError, Result};

/// An open FMEM device.
#[derive(Debug)]
pub struct Fmem {
    file: File,
}

impl Fmem {
    /// Opens an FMEM device read-write.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Open`] if the device file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| ChannelError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!("opened fmem device {}", path.display());
        Ok(Self { file })
    }

    /// Reads a byte register.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the read.
    pub fn read8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.file.read_exact_at(&mut buf, addr)?;
        Ok(buf[0])
    }

    /// Reads a 16-bit register.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the read.
    pub fn read16(&self, addr: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.file.read_exact_at(&mut buf, addr)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the read.
    pub fn read32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.file.read_exact_at(&mut buf, addr)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a 64-bit register.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the read.
    pub fn read64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, addr)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes a byte register.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the write.
    pub fn write8(&self, addr: u64, val: u8) -> Result<()> {
        self.file.write_all_at(&[val], addr)?;
        Ok(())
    }

    /// Writes a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the write.
    pub fn write32(&self, addr: u64, val: u32) -> Result<()> {
        self.file.write_all_at(&val.to_le_bytes(), addr)?;
        Ok(())
    }

    /// Writes a 64-bit register.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the write.
    pub fn write64(&self, addr: u64, val: u64) -> Result<()> {
        self.file.write_all_at(&val.to_le_bytes(), addr)?;
        Ok(())
    }

    /// Reads a byte range starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the read.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, addr)?;
        Ok(())
    }

    /// Writes a byte range starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor refuses the write.
    pub fn write_bytes(&self, addr: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, addr)?;
        Ok(())
    }
}
