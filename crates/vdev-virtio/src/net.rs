//! VirtIO network device (virtio-net).
//!
//! Queue 0 carries guest-bound frames and is pull-driven: the packet
//! source (TAP or SLIRP, behind [`NetBackend`]) calls
//! [`VirtioNet::write_packet`] when it has data, and the device takes one
//! available buffer on demand. Queue 1 is the transmit path, drained on
//! notify like any other queue.

use std::sync::{Arc, Mutex};

use crate::device::{RecvStatus, VirtioBus, VirtioCore, VirtioDevice};
use crate::features;

/// Size of the virtio-net header prepended to every frame.
pub const NET_HEADER_SIZE: usize = 12;

/// Guest-bound receive queue.
const RX_QUEUE: usize = 0;
/// Host-bound transmit queue.
const TX_QUEUE: usize = 1;

/// Where transmitted frames go.
pub trait NetBackend: Send {
    /// Sends one Ethernet frame out of the emulated machine.
    fn write_packet(&mut self, frame: &[u8]);
}

/// The network device.
pub struct VirtioNet {
    core: VirtioCore,
    backend: Box<dyn NetBackend>,
    header_size: usize,
}

impl VirtioNet {
    /// Config space: 6-byte MAC followed by a 2-byte status word.
    const CONFIG_SPACE_SIZE: usize = 8;

    /// Creates the device with the given MAC address.
    #[must_use]
    pub fn new(bus: &VirtioBus, backend: Box<dyn NetBackend>, mac: [u8; 6]) -> Arc<Mutex<Self>> {
        let mut core = VirtioCore::new(bus, crate::VirtioDeviceId::Net as u32, Self::CONFIG_SPACE_SIZE);
        core.offer_features(features::VERSION_1 | features::NET_F_MAC);
        core.set_config(0, &mac);
        core.set_manual_recv(RX_QUEUE);

        tracing::info!(
            "virtio-net ready, mac {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0],
            mac[1],
            mac[2],
            mac[3],
            mac[4],
            mac[5]
        );

        Arc::new(Mutex::new(Self {
            core,
            backend,
            header_size: NET_HEADER_SIZE,
        }))
    }

    /// Whether the guest has an rx buffer posted.
    #[must_use]
    pub fn can_write_packet(&self) -> bool {
        let Some(qs) = self.core.queue(RX_QUEUE) else {
            return false;
        };
        qs.ready && qs.last_avail_idx != qs.avail_idx
    }

    /// Injects one frame into the guest. Frames that do not fit the posted
    /// buffer (header included) are dropped, as are frames arriving while
    /// the guest has no buffer posted.
    pub fn write_packet(&mut self, frame: &[u8]) {
        let Some(desc_idx) = self.core.peek_avail_desc(RX_QUEUE) else {
            return;
        };
        let Ok((_, write_size)) = self.core.desc_rw_size(RX_QUEUE, desc_idx) else {
            return;
        };
        let len = self.header_size + frame.len();
        if len > write_size {
            tracing::trace!(len, write_size, "dropping oversized rx frame");
            return;
        }

        let header = vec![0u8; self.header_size];
        if self
            .core
            .copy_to_queue(RX_QUEUE, desc_idx, 0, &header)
            .is_err()
            || self
                .core
                .copy_to_queue(RX_QUEUE, desc_idx, self.header_size, frame)
                .is_err()
        {
            return;
        }
        self.core.consume_desc(RX_QUEUE, desc_idx, len);
        self.core.advance_avail(RX_QUEUE);
    }

    /// Reflects the backend's link state into config space, notifying the
    /// driver on change.
    pub fn set_carrier(&mut self, up: bool) {
        let current = self.core.config()[6] & 1 != 0;
        if current != up {
            self.core.set_config(6, &[u8::from(up)]);
            self.core.config_change_notify();
            tracing::debug!(up, "carrier change");
        }
    }
}

impl VirtioDevice for VirtioNet {
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
            if read_size < self.header_size {
                tracing::warn!(read_size, "short tx chain");
                return RecvStatus::Done;
            }
            let len = read_size - self.header_size;
            let mut frame = vec![0u8; len];
            if self
                .core
                .copy_from_queue(queue_idx, desc_idx, self.header_size, &mut frame)
                .is_err()
            {
                return RecvStatus::Done;
            }
            self.backend.write_packet(&frame);
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
    struct CapturingBackend {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl NetBackend for CapturingBackend {
        fn write_packet(&mut self, frame: &[u8]) {
            self.frames.lock().unwrap().push(frame.to_vec());
        }
    }

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];

    #[test]
    fn test_config_space_holds_mac() {
        let rig = rig();
        let dev = VirtioNet::new(&rig.bus, Box::new(CapturingBackend::default()), MAC);
        let dev = dev.lock().unwrap();
        assert_eq!(&dev.core().config()[..6], &MAC);
        assert_eq!(
            dev.core().device_features,
            features::VERSION_1 | features::NET_F_MAC
        );
        assert!(dev.core().queue(RX_QUEUE).unwrap().manual_recv);
    }

    #[test]
    fn test_tx_frame_reaches_backend() {
        let rig = rig();
        let backend = CapturingBackend::default();
        let frames = backend.frames.clone();
        let dev = VirtioNet::new(&rig.bus, Box::new(backend), MAC);
        let mut dev = dev.lock().unwrap();

        // Queue 1 carries tx; program it at the shared test layout.
        program_queue(&mut *dev, TX_QUEUE as u32, 8);

        let mut chain = vec![0u8; NET_HEADER_SIZE];
        chain.extend_from_slice(b"frame-payload");
        rig.ram.write(0x4000, &chain);
        write_desc(
            &rig.ram,
            0,
            Desc {
                addr: 0x4000,
                len: chain.len() as u32,
                flags: 0,
                next: 0,
            },
        );
        push_avail(&rig.ram, 0, 0, 1);

        dev.queue_notify(TX_QUEUE);

        assert_eq!(frames.lock().unwrap().as_slice(), &[b"frame-payload".to_vec()]);
        // Tx completions publish a zero-length used entry.
        assert_eq!(rig.ram.read_u16(USED_RING + 2), 1);
        let len_bytes = rig.ram.snapshot(USED_RING + 8, 4);
        assert_eq!(u32::from_le_bytes(len_bytes.try_into().unwrap()), 0);
    }

    #[test]
    fn test_rx_injection_scatters_header_and_payload() {
        let rig = rig();
        let dev = VirtioNet::new(&rig.bus, Box::new(CapturingBackend::default()), MAC);
        let mut dev = dev.lock().unwrap();

        program_queue(&mut *dev, RX_QUEUE as u32, 8);
        write_desc(
            &rig.ram,
            0,
            Desc {
                addr: 0x6000,
                len: 256,
                flags: desc_flags::WRITE,
                next: 0,
            },
        );
        push_avail(&rig.ram, 0, 0, 1);
        dev.queue_notify(RX_QUEUE); // manual queue: caches avail_idx only

        assert!(dev.can_write_packet());
        dev.write_packet(b"ping");

        assert_eq!(
            rig.ram.snapshot(0x6000, NET_HEADER_SIZE),
            vec![0; NET_HEADER_SIZE]
        );
        assert_eq!(rig.ram.snapshot(0x6000 + NET_HEADER_SIZE as u64, 4), b"ping");
        assert_eq!(rig.ram.read_u16(USED_RING + 2), 1);
        assert!(!dev.can_write_packet());
    }

    #[test]
    fn test_rx_drops_when_no_buffer_or_too_small() {
        let rig = rig();
        let dev = VirtioNet::new(&rig.bus, Box::new(CapturingBackend::default()), MAC);
        let mut dev = dev.lock().unwrap();

        program_queue(&mut *dev, RX_QUEUE as u32, 8);

        // No buffer posted at all.
        dev.write_packet(b"dropped");
        assert_eq!(rig.ram.read_u16(USED_RING + 2), 0);

        // Buffer smaller than header + frame.
        write_desc(
            &rig.ram,
            0,
            Desc {
                addr: 0x6000,
                len: (NET_HEADER_SIZE + 2) as u32,
                flags: desc_flags::WRITE,
                next: 0,
            },
        );
        push_avail(&rig.ram, 0, 0, 1);
        dev.queue_notify(RX_QUEUE);
        dev.write_packet(b"too-long");
        assert_eq!(rig.ram.read_u16(USED_RING + 2), 0);
        // The buffer stays posted for a smaller frame.
        assert!(dev.can_write_packet());
    }

    #[test]
    fn test_carrier_change_fires_config_interrupt() {
        let rig = rig();
        let dev = VirtioNet::new(&rig.bus, Box::new(CapturingBackend::default()), MAC);
        let mut dev = dev.lock().unwrap();

        dev.set_carrier(true);
        assert_eq!(dev.core().config()[6] & 1, 1);
        assert_eq!(dev.core().int_status() & 2, 2);

        // No change, no second interrupt.
        dev.mmio_write(crate::mmio::regs::INTERRUPT_ACK, 2, 2);
        dev.set_carrier(true);
        assert_eq!(dev.core().int_status(), 0);
    }
}
