//! VirtIO console device (virtio-console).
//!
//! Queue 0 is guest-bound input, fed by the host I/O pump through
//! [`VirtioConsole::write_data`] (pull-driven, same protocol as net rx).
//! Queue 1 is guest output, delivered to the [`ConsoleSink`].

use std::sync::{Arc, Mutex};

use crate::device::{RecvStatus, VirtioBus, VirtioCore, VirtioDevice};
use crate::features;

/// Guest-bound input queue.
const RX_QUEUE: usize = 0;
/// Guest output queue.
const TX_QUEUE: usize = 1;

/// Destination for guest console output.
pub trait ConsoleSink: Send {
    /// Delivers a chunk of guest output.
    fn write(&mut self, data: &[u8]);
}

/// The console device.
pub struct VirtioConsole {
    core: VirtioCore,
    sink: Box<dyn ConsoleSink>,
}

impl VirtioConsole {
    /// Config space: columns and rows, both le16.
    const CONFIG_SPACE_SIZE: usize = 4;

    /// Creates the device writing guest output into `sink`.
    #[must_use]
    pub fn new(bus: &VirtioBus, sink: Box<dyn ConsoleSink>) -> Arc<Mutex<Self>> {
        let mut core = VirtioCore::new(
            bus,
            crate::VirtioDeviceId::Console as u32,
            Self::CONFIG_SPACE_SIZE,
        );
        core.offer_features(features::VERSION_1 | features::CONSOLE_F_SIZE);
        core.set_manual_recv(RX_QUEUE);

        tracing::info!("virtio-console ready");

        Arc::new(Mutex::new(Self { core, sink }))
    }

    /// Whether the guest has an input buffer posted.
    #[must_use]
    pub fn can_write_data(&self) -> bool {
        let Some(qs) = self.core.queue(RX_QUEUE) else {
            return false;
        };
        qs.ready && qs.last_avail_idx != qs.avail_idx
    }

    /// Size of the next posted input buffer, or zero when none is.
    ///
    /// The host pump uses this to bound its reads.
    #[must_use]
    pub fn write_len(&self) -> usize {
        let Some(desc_idx) = self.core.peek_avail_desc(RX_QUEUE) else {
            return 0;
        };
        self.core
            .desc_rw_size(RX_QUEUE, desc_idx)
            .map_or(0, |(_, write_size)| write_size)
    }

    /// Delivers host input to the guest. Returns the number of bytes
    /// accepted (zero when no buffer is posted).
    pub fn write_data(&mut self, data: &[u8]) -> usize {
        let Some(desc_idx) = self.core.peek_avail_desc(RX_QUEUE) else {
            return 0;
        };
        if self.core.copy_to_queue(RX_QUEUE, desc_idx, 0, data).is_err() {
            return 0;
        }
        self.core.consume_desc(RX_QUEUE, desc_idx, data.len());
        self.core.advance_avail(RX_QUEUE);
        data.len()
    }

    /// Announces a new terminal size to the guest.
    pub fn resize_event(&mut self, cols: u16, rows: u16) {
        self.core.set_config(0, &cols.to_le_bytes());
        self.core.set_config(2, &rows.to_le_bytes());
        self.core.config_change_notify();
        tracing::debug!(cols, rows, "console resize");
    }
}

impl VirtioDevice for VirtioConsole {
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
        read_size: usize,
        _write_size: usize,
    ) -> RecvStatus {
        if queue_idx == TX_QUEUE {
            let mut buf = vec![0u8; read_size];
            if self
                .core
                .copy_from_queue(queue_idx, desc_idx, 0, &mut buf)
                .is_err()
            {
                return RecvStatus::Done;
            }
            self.sink.write(&buf);
            self.core.consume_desc(queue_idx, desc_idx, 0);
        }
        RecvStatus::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{program_queue, push_avail, rig, write_desc, USED_RING};
    use crate::dma::GuestDma;
    use crate::queue::{desc_flags, Desc};

    #[derive(Default)]
    struct BufferSink {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl ConsoleSink for BufferSink {
        fn write(&mut self, data: &[u8]) {
            self.data.lock().unwrap().extend_from_slice(data);
        }
    }

    #[test]
    fn test_guest_output_reaches_sink() {
        let rig = rig();
        let sink = BufferSink::default();
        let data = sink.data.clone();
        let dev = VirtioConsole::new(&rig.bus, Box::new(sink));
        let mut dev = dev.lock().unwrap();

        program_queue(&mut *dev, TX_QUEUE as u32, 8);
        rig.ram.write(0x4000, b"hello guest\r\n");
        write_desc(
            &rig.ram,
            0,
            Desc {
                addr: 0x4000,
                len: 13,
                flags: 0,
                next: 0,
            },
        );
        push_avail(&rig.ram, 0, 0, 1);

        dev.queue_notify(TX_QUEUE);

        assert_eq!(data.lock().unwrap().as_slice(), b"hello guest\r\n");
        assert_eq!(rig.ram.read_u16(USED_RING + 2), 1);
    }

    #[test]
    fn test_host_input_protocol() {
        let rig = rig();
        let dev = VirtioConsole::new(&rig.bus, Box::new(BufferSink::default()));
        let mut dev = dev.lock().unwrap();

        program_queue(&mut *dev, RX_QUEUE as u32, 8);
        assert!(!dev.can_write_data());
        assert_eq!(dev.write_data(b"x"), 0);

        write_desc(
            &rig.ram,
            0,
            Desc {
                addr: 0x6000,
                len: 64,
                flags: desc_flags::WRITE,
                next: 0,
            },
        );
        push_avail(&rig.ram, 0, 0, 1);
        dev.queue_notify(RX_QUEUE);

        assert!(dev.can_write_data());
        assert_eq!(dev.write_len(), 64);
        assert_eq!(dev.write_data(b"input"), 5);
        assert_eq!(rig.ram.snapshot(0x6000, 5), b"input");
        assert_eq!(rig.ram.read_u16(USED_RING + 2), 1);
        assert!(!dev.can_write_data());
    }

    #[test]
    fn test_resize_event_updates_config_and_interrupts() {
        let rig = rig();
        let dev = VirtioConsole::new(&rig.bus, Box::new(BufferSink::default()));
        let mut dev = dev.lock().unwrap();

        dev.resize_event(80, 25);

        let cfg = dev.core().config();
        assert_eq!(u16::from_le_bytes([cfg[0], cfg[1]]), 80);
        assert_eq!(u16::from_le_bytes([cfg[2], cfg[3]]), 25);
        assert_eq!(dev.core().int_status() & 2, 2);
    }
}
