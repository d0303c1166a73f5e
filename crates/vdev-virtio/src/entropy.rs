//! VirtIO entropy device (virtio-rng).
//!
//! The guest posts writable buffers; the device fills them from the host
//! CSPRNG in 256-byte chunks.

use std::sync::{Arc, Mutex};

use crate::device::{RecvStatus, VirtioBus, VirtioCore, VirtioDevice};
use crate::features;

/// Largest single fill; `getrandom(2)` never short-reads at this size.
const CHUNK_SIZE: usize = 256;

/// Host randomness source.
pub trait EntropySource: Send {
    /// Fills `buf` with random bytes.
    fn fill(&mut self, buf: &mut [u8]);
}

/// [`EntropySource`] backed by `getrandom(2)`.
#[derive(Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&mut self, buf: &mut [u8]) {
        let mut filled = 0;
        while filled < buf.len() {
            let rest = &mut buf[filled..];
            // SAFETY: the pointer and length describe the live tail of
            // `rest`, which getrandom only writes into.
            let ret = unsafe { libc::getrandom(rest.as_mut_ptr().cast(), rest.len(), 0) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                // Reads up to 256 bytes cannot fail on a healthy host.
                tracing::error!(%err, "getrandom failed");
                std::process::abort();
            }
            filled += ret as usize;
        }
    }
}

/// The entropy device.
pub struct VirtioEntropy {
    core: VirtioCore,
    source: Box<dyn EntropySource>,
    chunk: [u8; CHUNK_SIZE],
}

impl VirtioEntropy {
    /// Creates the device over the given randomness source.
    #[must_use]
    pub fn new(bus: &VirtioBus, source: Box<dyn EntropySource>) -> Arc<Mutex<Self>> {
        let mut core = VirtioCore::new(bus, crate::VirtioDeviceId::Rng as u32, 0);
        core.offer_features(features::VERSION_1);

        tracing::info!("virtio-rng ready");

        Arc::new(Mutex::new(Self {
            core,
            source,
            chunk: [0; CHUNK_SIZE],
        }))
    }
}

impl VirtioDevice for VirtioEntropy {
    fn core(&self) -> &VirtioCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VirtioCore {
        &mut self.core
    }

    fn recv(
        &mut self,
        queue_idx: usize,
        desc_idx: u16,
        _read_size: usize,
        write_size: usize,
    ) -> RecvStatus {
        if queue_idx == 0 {
            let mut offset = 0;
            while offset < write_size {
                let block = CHUNK_SIZE.min(write_size - offset);
                self.source.fill(&mut self.chunk[..block]);
                if self
                    .core
                    .copy_to_queue(queue_idx, desc_idx, offset, &self.chunk[..block])
                    .is_err()
                {
                    return RecvStatus::Done;
                }
                offset += block;
            }
            self.core.consume_desc(queue_idx, desc_idx, write_size);
        }
        RecvStatus::Done
    }
}
