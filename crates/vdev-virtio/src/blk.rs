//! VirtIO block device (virtio-blk).
//!
//! Requests start with a 16-byte header `{type, reserved, sector}`. Data
//! transfers may complete asynchronously: the backend either finishes in
//! the caller and hands the buffer straight back, or keeps the completion
//! and fires it later from its own thread. While a transfer is in flight
//! the device stalls its queue; the completion republishes it.

use std::sync::{Arc, Mutex, Weak};

use crate::device::{RecvStatus, VirtioBus, VirtioCore, VirtioDevice};
use crate::features;

/// Request header, little-endian on the wire.
#[derive(Debug, Clone, Copy)]
struct RequestHeader {
    kind: u32,
    sector: u64,
}

impl RequestHeader {
    const SIZE: usize = 16;

    fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self {
            kind: u32::from_le_bytes(bytes[0..4].try_into().unwrap_or([0; 4])),
            // bytes 4..8 are reserved
            sector: u64::from_le_bytes(bytes[8..16].try_into().unwrap_or([0; 8])),
        }
    }
}

/// Request types serviced by this device.
pub mod req_type {
    /// Read sectors into the writable window.
    pub const IN: u32 = 0;
    /// Write sectors from the readable window.
    pub const OUT: u32 = 1;
    /// Flush buffered writes (there are none; completes immediately).
    pub const FLUSH: u32 = 4;
    /// Legacy alias, treated as `FLUSH`.
    pub const FLUSH_OUT: u32 = 5;
    /// Report the 20-byte ASCII device identity.
    pub const GET_ID: u32 = 8;
}

/// Status byte written at the end of every request.
pub mod req_status {
    /// Success.
    pub const OK: u8 = 0;
    /// Backend I/O failure.
    pub const IOERR: u8 = 1;
    /// Request type not supported.
    pub const UNSUPP: u8 = 2;
}

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// Identity returned for `GET_ID` requests.
const DEVICE_ID_STRING: &[u8] = b"vdev-virtio-blk";

/// Completion invoked by the backend when an asynchronous transfer
/// finishes. Carries the data buffer back together with the status
/// (`0` success, `< 0` I/O error).
pub type BlockCompletion = Box<dyn FnOnce(Vec<u8>, i32) + Send>;

/// Sector-addressed storage behind the device.
///
/// `read` and `write` either complete in the caller — returning
/// `Some((buf, status))` without invoking `done` — or return `None` and
/// invoke `done` later from another thread. Implementations must not call
/// `done` from within the submitting call; the device lock is held there.
pub trait BlockBackend: Send {
    /// Total capacity in sectors.
    fn sector_count(&self) -> u64;

    /// Fills `buf` with `nb_sectors` starting at `first_sector`. `buf` may
    /// be longer than the transfer (it carries the trailing status byte).
    fn read(
        &mut self,
        first_sector: u64,
        nb_sectors: usize,
        buf: Vec<u8>,
        done: BlockCompletion,
    ) -> Option<(Vec<u8>, i32)>;

    /// Writes `nb_sectors` from `buf` starting at `first_sector`.
    fn write(
        &mut self,
        first_sector: u64,
        nb_sectors: usize,
        buf: Vec<u8>,
        done: BlockCompletion,
    ) -> Option<(Vec<u8>, i32)>;
}

/// An in-flight request awaiting its backend completion.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    kind: u32,
    queue_idx: usize,
    desc_idx: u16,
    write_size: usize,
}

/// The block device.
pub struct VirtioBlock {
    core: VirtioCore,
    backend: Box<dyn BlockBackend>,
    in_flight: Option<PendingRequest>,
    handle: Weak<Mutex<Self>>,
}

impl VirtioBlock {
    /// Config space: capacity (le64), size_max (le32, unused), seg_max
    /// (le32).
    const CONFIG_SPACE_SIZE: usize = 16;

    /// Creates the device and binds it to `bus`.
    #[must_use]
    pub fn new(bus: &VirtioBus, backend: Box<dyn BlockBackend>) -> Arc<Mutex<Self>> {
        let mut core = VirtioCore::new(bus, crate::VirtioDeviceId::Block as u32, Self::CONFIG_SPACE_SIZE);
        core.offer_features(features::VERSION_1 | features::BLK_F_SEG_MAX);

        let nb_sectors = backend.sector_count();
        core.set_config(0, &nb_sectors.to_le_bytes());
        core.set_config(8, &0u32.to_le_bytes());
        // Advertise a segment limit so the driver does not assume one
        // segment per request.
        core.set_config(12, &64u32.to_le_bytes());

        tracing::info!(nb_sectors, "virtio-blk ready");

        let dev = Arc::new(Mutex::new(Self {
            core,
            backend,
            in_flight: None,
            handle: Weak::new(),
        }));
        dev.lock().unwrap_or_else(|e| e.into_inner()).handle = Arc::downgrade(&dev);
        dev
    }

    fn completion(&self) -> BlockCompletion {
        let handle = self.handle.clone();
        Box::new(move |buf, ret| {
            if let Some(dev) = handle.upgrade() {
                let mut dev = dev.lock().unwrap_or_else(|e| e.into_inner());
                dev.complete(buf, ret);
            }
        })
    }

    /// Finishes an asynchronous request and resumes the queue drain.
    fn complete(&mut self, buf: Vec<u8>, ret: i32) {
        let Some(req) = self.in_flight.take() else {
            tracing::warn!("spurious block completion");
            return;
        };
        self.req_end(req, buf, ret);
        self.queue_notify(req.queue_idx);
    }

    /// Publishes the result of a request into its chain.
    fn req_end(&mut self, req: PendingRequest, mut buf: Vec<u8>, ret: i32) {
        let status = if ret < 0 {
            req_status::IOERR
        } else {
            req_status::OK
        };
        match req.kind {
            req_type::OUT => {
                if self
                    .core
                    .copy_to_queue(req.queue_idx, req.desc_idx, 0, &[status])
                    .is_ok()
                {
                    self.core.consume_desc(req.queue_idx, req.desc_idx, 1);
                }
            }
            // IN, FLUSH, FLUSH_OUT, GET_ID: the buffer already holds the
            // payload; the status byte rides in its last slot.
            _ => {
                buf[req.write_size - 1] = status;
                if self
                    .core
                    .copy_to_queue(req.queue_idx, req.desc_idx, 0, &buf[..req.write_size])
                    .is_ok()
                {
                    self.core
                        .consume_desc(req.queue_idx, req.desc_idx, req.write_size);
                }
            }
        }
    }
}

impl VirtioDevice for VirtioBlock {
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
        write_size: usize,
    ) -> RecvStatus {
        if self.in_flight.is_some() {
            return RecvStatus::Stall;
        }

        let mut header_bytes = [0u8; RequestHeader::SIZE];
        if self
            .core
            .copy_from_queue(queue_idx, desc_idx, 0, &mut header_bytes)
            .is_err()
        {
            return RecvStatus::Done;
        }
        let header = RequestHeader::from_bytes(&header_bytes);

        let req = PendingRequest {
            kind: header.kind,
            queue_idx,
            desc_idx,
            write_size,
        };

        match header.kind {
            req_type::IN => {
                if write_size == 0 {
                    tracing::warn!("blk IN request with no writable window");
                    return RecvStatus::Done;
                }
                let buf = vec![0u8; write_size];
                let nb_sectors = (write_size - 1) / SECTOR_SIZE;
                let done = self.completion();
                match self.backend.read(header.sector, nb_sectors, buf, done) {
                    Some((buf, ret)) => self.req_end(req, buf, ret),
                    None => self.in_flight = Some(req),
                }
            }
            req_type::OUT => {
                if write_size == 0 || read_size < RequestHeader::SIZE {
                    tracing::warn!("malformed blk OUT request");
                    return RecvStatus::Done;
                }
                let len = read_size - RequestHeader::SIZE;
                let mut buf = vec![0u8; len];
                if self
                    .core
                    .copy_from_queue(queue_idx, desc_idx, RequestHeader::SIZE, &mut buf)
                    .is_err()
                {
                    return RecvStatus::Done;
                }
                let nb_sectors = len / SECTOR_SIZE;
                let done = self.completion();
                match self.backend.write(header.sector, nb_sectors, buf, done) {
                    Some((buf, ret)) => self.req_end(req, buf, ret),
                    None => self.in_flight = Some(req),
                }
            }
            req_type::FLUSH | req_type::FLUSH_OUT => {
                if write_size == 0 {
                    tracing::warn!("blk FLUSH request with no status slot");
                    return RecvStatus::Done;
                }
                // No write-back cache: requests are handled in order, so a
                // flush completes immediately.
                self.req_end(req, vec![0u8; write_size], 0);
            }
            req_type::GET_ID => {
                // 20 bytes of identity plus the status byte.
                if write_size < 21 {
                    tracing::warn!(write_size, "blk GET_ID window too small");
                    return RecvStatus::Done;
                }
                let mut buf = vec![0u8; write_size];
                buf[..DEVICE_ID_STRING.len()].copy_from_slice(DEVICE_ID_STRING);
                self.req_end(req, buf, 0);
            }
            other => {
                tracing::warn!(kind = other, "unsupported blk request");
                if self
                    .core
                    .copy_to_queue(queue_idx, desc_idx, 0, &[req_status::UNSUPP])
                    .is_ok()
                {
                    self.core.consume_desc(queue_idx, desc_idx, 1);
                }
            }
        }
        RecvStatus::Done
    }
}
