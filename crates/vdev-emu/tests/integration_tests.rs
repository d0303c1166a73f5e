//! End-to-end tests: captured guest accesses in, responses and guest
//! memory effects out, with every side-band channel backed by a scratch
//! file.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vdev_emu::emulator::{FmemDma, HostIrq};
use vdev_emu::htif::CharSink;
use vdev_emu::stack::VIRTIO_BASE_ADDR;
use vdev_emu::{BootRom, Emulator, Served, VirtioStack, EXIT_CODE_RESET};
use vdev_fmem::channel::regs;
use vdev_fmem::{ChannelConfig, Fmem, HostChannel};
use vdev_virtio::entropy::EntropySource;
use vdev_virtio::mmio::regs as vregs;
use vdev_virtio::queue::{desc_flags, Desc};

const DESC_TABLE: u64 = 0x1000;
const AVAIL_RING: u64 = 0x2000;
const USED_RING: u64 = 0x3000;
const DATA_ADDR: u64 = 0x8000;

struct PatternSource(u8);

impl EntropySource for PatternSource {
    fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.0;
            self.0 = self.0.wrapping_add(1);
        }
    }
}

#[derive(Default, Clone)]
struct BufferSink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl CharSink for BufferSink {
    fn write(&mut self, data: &[u8]) {
        self.data.lock().unwrap().extend_from_slice(data);
    }
}

struct GuestRig {
    _files: Vec<tempfile::NamedTempFile>,
    chan: Arc<HostChannel>,
    mmio: Fmem,
    irq_file: Fmem,
    emu: Emulator,
    sink: BufferSink,
}

fn guest_rig() -> GuestRig {
    let mut files = Vec::new();
    let mut paths = Vec::new();
    for len in [0x3000u64, 0x10000, 0x10] {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();
        paths.push(file.path().to_path_buf());
        files.push(file);
    }
    let config = ChannelConfig {
        virtual_device: paths[0].clone(),
        dma: paths[1].clone(),
        interrupts: paths[2].clone(),
    };
    let chan = Arc::new(HostChannel::open(&config).unwrap());
    let mmio = Fmem::open(&config.virtual_device).unwrap();
    let irq_file = Fmem::open(&config.interrupts).unwrap();

    let mut stack = VirtioStack::new(
        Arc::new(FmemDma::new(chan.clone())),
        Arc::new(HostIrq::new(chan.clone())),
    );
    stack.add_entropy(Box::new(PatternSource(0x10))).unwrap();

    let sink = BufferSink::default();
    let rom = BootRom::new(0x7000_0000, vec![0x0bad_c0de_0000_0001]);
    let mut emu =
        Emulator::with_sink(chan.clone(), stack, Some(rom), Box::new(sink.clone())).unwrap();
    emu.htif_mut().set_enabled(true);

    GuestRig {
        _files: files,
        chan,
        mmio,
        irq_file,
        emu,
        sink,
    }
}

impl GuestRig {
    fn inject_write(&mut self, addr: u64, data: u64) -> Served {
        self.mmio.write8(regs::VD_IS_WRITE, 1).unwrap();
        self.mmio.write32(regs::VD_WRITE_ADDR, addr as u32).unwrap();
        self.mmio.write64(regs::VD_WRITE_DATA, data).unwrap();
        self.mmio.write8(regs::VD_WRITE_BYEN, 0xff).unwrap();
        self.mmio.write8(regs::VD_REQ_LEVEL, 1).unwrap();

        let served = self.emu.serve_one().unwrap();
        self.mmio.write8(regs::VD_REQ_LEVEL, 0).unwrap();
        assert_eq!(self.mmio.read32(regs::VD_SEND_RESP).unwrap(), 1);
        self.mmio.write32(regs::VD_SEND_RESP, 0).unwrap();
        served
    }

    fn inject_read(&mut self, addr: u64) -> u64 {
        self.mmio.write8(regs::VD_IS_WRITE, 0).unwrap();
        self.mmio.write32(regs::VD_READ_ADDR, addr as u32).unwrap();
        self.mmio.write32(regs::VD_REQ_ID, 7).unwrap();
        self.mmio.write8(regs::VD_BURST_CNT, 0).unwrap();
        self.mmio.write8(regs::VD_REQ_LEVEL, 1).unwrap();

        self.emu.serve_one().unwrap();
        self.mmio.write8(regs::VD_REQ_LEVEL, 0).unwrap();
        self.mmio.write32(regs::VD_SEND_RESP, 0).unwrap();
        self.mmio.read64(regs::VD_READ_DATA).unwrap()
    }

    /// Writes a 32-bit device register the way the 64-bit guest bus
    /// delivers it: odd words travel in the upper lane.
    fn reg_write(&mut self, base: u64, offset: u32, val: u32) {
        let addr = base + u64::from(offset);
        let data = if addr & 4 == 0 {
            u64::from(val)
        } else {
            u64::from(val) << 32
        };
        assert_eq!(self.inject_write(addr, data), Served::Handled);
    }

    fn reg_read(&mut self, base: u64, offset: u32) -> u32 {
        let addr = base + u64::from(offset);
        let val = self.inject_read(addr);
        if addr & 4 == 0 {
            val as u32
        } else {
            (val >> 32) as u32
        }
    }

    fn guest_read_u16(&self, addr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.chan.dma_read(addr, &mut buf).unwrap();
        u16::from_le_bytes(buf)
    }
}

fn wait_until(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if pred() {
            return true;
        }
        std::thread::yield_now();
    }
    pred()
}

#[test]
fn test_entropy_device_end_to_end_through_capture_unit() {
    let mut rig = guest_rig();
    rig.emu.start_io();
    let base = VIRTIO_BASE_ADDR;

    // Probe the transport identity the way a driver would.
    assert_eq!(rig.reg_read(base, vregs::MAGIC), 0x7472_6976);
    assert_eq!(rig.reg_read(base, vregs::VERSION), 2);
    assert_eq!(rig.reg_read(base, vregs::DEVICE_ID), 4);

    // Negotiate VERSION_1 and bring the device up.
    rig.reg_write(base, vregs::DRIVER_FEATURES_SEL, 1);
    rig.reg_write(base, vregs::DRIVER_FEATURES, 1);
    rig.reg_write(base, vregs::STATUS, 8);
    assert_eq!(rig.reg_read(base, vregs::STATUS) & 8, 8);

    // Program queue 0.
    rig.reg_write(base, vregs::QUEUE_SEL, 0);
    rig.reg_write(base, vregs::QUEUE_NUM, 8);
    rig.reg_write(base, vregs::QUEUE_DESC_LOW, DESC_TABLE as u32);
    rig.reg_write(base, vregs::QUEUE_DESC_HIGH, 0);
    rig.reg_write(base, vregs::QUEUE_AVAIL_LOW, AVAIL_RING as u32);
    rig.reg_write(base, vregs::QUEUE_AVAIL_HIGH, 0);
    rig.reg_write(base, vregs::QUEUE_USED_LOW, USED_RING as u32);
    rig.reg_write(base, vregs::QUEUE_USED_HIGH, 0);
    rig.reg_write(base, vregs::QUEUE_READY, 1);

    // Post one 16-byte writable descriptor.
    let desc = Desc {
        addr: DATA_ADDR,
        len: 16,
        flags: desc_flags::WRITE,
        next: 0,
    };
    rig.chan.dma_write(DESC_TABLE, &desc.to_bytes()).unwrap();
    rig.chan.dma_write(AVAIL_RING + 4, &0u16.to_le_bytes()).unwrap();
    rig.chan.dma_write(AVAIL_RING + 2, &1u16.to_le_bytes()).unwrap();

    // Kick the queue; the notify worker runs the transfer.
    rig.reg_write(base, vregs::QUEUE_NOTIFY, 0);
    assert!(wait_until(Duration::from_secs(5), || {
        rig.guest_read_u16(USED_RING + 2) == 1
    }));

    let mut data = [0u8; 16];
    rig.chan.dma_read(DATA_ADDR, &mut data).unwrap();
    let expected: Vec<u8> = (0x10..0x20).collect();
    assert_eq!(&data[..], &expected[..]);

    // The device's IRQ (line 3, host bit 5) reached the mailbox register.
    assert!(wait_until(Duration::from_secs(5), || {
        rig.irq_file.read32(0).unwrap() & (1 << 5) != 0
    }));
    assert_eq!(rig.chan.irq_levels() & (1 << 5), 1 << 5);

    // Interrupt status reads back and acks through the same path.
    assert_eq!(rig.reg_read(base, vregs::INTERRUPT_STATUS) & 1, 1);
    rig.reg_write(base, vregs::INTERRUPT_ACK, 1);
    assert_eq!(rig.reg_read(base, vregs::INTERRUPT_STATUS), 0);

    rig.emu.stop_io(0);
    assert_eq!(rig.emu.join_io(), 0);
}

#[test]
fn test_htif_putchar_and_finish() {
    let mut rig = guest_rig();
    rig.emu.start_io();

    // Scenario: tohost putchar 'A'.
    let served = rig.inject_write(0x1000_1000, (1 << 56) | (1 << 48) | 0x41);
    assert_eq!(served, Served::Handled);
    assert_eq!(rig.sink.data.lock().unwrap().as_slice(), b"A");

    // Host input flows back through fromhost.
    rig.emu.stdin().enqueue(b"k");
    assert_eq!(rig.inject_read(0x1000_1008), (1 << 56) | u64::from(b'k'));
    assert_eq!(rig.inject_read(0x1000_1008), 0);

    // tohost finish: payload 1 is PASS.
    assert_eq!(rig.inject_write(0x1000_1000, 1), Served::Exit(0));
    assert_eq!(rig.emu.join_io(), 0);
}

#[test]
fn test_sifive_finisher_stops_the_run() {
    let mut rig = guest_rig();
    rig.emu.start_io();

    assert_eq!(rig.inject_write(0x5000_0000, 0x5555), Served::Exit(0));
    assert_eq!(rig.emu.join_io(), 0);
}

#[test]
fn test_sifive_reset_code() {
    let mut rig = guest_rig();
    rig.emu.start_io();

    assert_eq!(
        rig.inject_write(0x5000_0000, 0x7777),
        Served::Exit(EXIT_CODE_RESET)
    );
    assert_eq!(rig.emu.join_io(), EXIT_CODE_RESET);
}

#[test]
fn test_rom_and_stray_reads() {
    let mut rig = guest_rig();

    assert_eq!(rig.inject_read(0x7000_0000), 0x0bad_c0de_0000_0001);
    assert_eq!(rig.inject_read(0x6123_4560), 0);
}

#[test]
fn test_stop_pipe_notifies_external_pump() {
    let mut rig = guest_rig();
    let stop_fd = rig.emu.take_stop_fd().unwrap();
    rig.emu.start_io();

    rig.emu.stop_io(2);

    use std::io::Read;
    let mut pipe = std::fs::File::from(stop_fd);
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"X");
    assert_eq!(rig.emu.join_io(), 2);
}
