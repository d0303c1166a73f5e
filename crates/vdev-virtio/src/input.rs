//! VirtIO input device (virtio-input).
//!
//! Queue 0 streams `{type, code, value}` events to the guest (pull-driven,
//! one event per posted buffer). Queue 1 carries LED/keyboard feedback the
//! device acknowledges and drops. Device discovery runs over config space:
//! the driver writes a selector pair at offsets 0/1 and reads the reply
//! size at offset 2 with the payload from offset 8.

use std::sync::{Arc, Mutex};

use crate::device::{RecvStatus, VirtioBus, VirtioCore, VirtioDevice};
use crate::features;

/// Config selector values (offset 0).
mod cfg {
    pub const UNSET: u8 = 0x00;
    pub const ID_NAME: u8 = 0x01;
    pub const ID_SERIAL: u8 = 0x02;
    pub const ID_DEVIDS: u8 = 0x03;
    pub const PROP_BITS: u8 = 0x10;
    pub const EV_BITS: u8 = 0x11;
    pub const ABS_INFO: u8 = 0x12;
}

/// Event types (subset of the Linux input event codes).
pub mod ev {
    /// Event separator.
    pub const SYN: u16 = 0x00;
    /// Key or button state change.
    pub const KEY: u16 = 0x01;
    /// Relative axis movement.
    pub const REL: u16 = 0x02;
    /// Absolute axis position.
    pub const ABS: u16 = 0x03;
    /// Autorepeat support marker.
    pub const REP: u16 = 0x14;
}

const BTN_LEFT: u16 = 0x110;
const BTN_RIGHT: u16 = 0x111;
const BTN_MIDDLE: u16 = 0x112;

const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_WHEEL: u16 = 0x08;

const ABS_X: u8 = 0x00;
const ABS_Y: u8 = 0x01;

const BUTTONS: [u16; 3] = [BTN_LEFT, BTN_RIGHT, BTN_MIDDLE];

/// Absolute-axis range reported for tablets; coordinates are scaled into
/// `0..ABS_SCALE` by the host UI.
pub const ABS_SCALE: u32 = 32768;

/// Input device personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Full keyboard.
    Keyboard,
    /// Relative-motion mouse.
    Mouse,
    /// Absolute-position tablet.
    Tablet,
}

/// The input device.
pub struct VirtioInput {
    core: VirtioCore,
    kind: InputKind,
    buttons_state: u32,
}

impl VirtioInput {
    const CONFIG_SPACE_SIZE: usize = 256;
    /// Event queue toward the guest.
    const EVENT_QUEUE: usize = 0;
    /// Status queue from the guest (LEDs, autorepeat).
    const STATUS_QUEUE: usize = 1;

    /// Creates a device of the given personality.
    #[must_use]
    pub fn new(bus: &VirtioBus, kind: InputKind) -> Arc<Mutex<Self>> {
        let mut core = VirtioCore::new(
            bus,
            crate::VirtioDeviceId::Input as u32,
            Self::CONFIG_SPACE_SIZE,
        );
        core.offer_features(features::VERSION_1);
        core.set_manual_recv(Self::EVENT_QUEUE);

        tracing::info!(?kind, "virtio-input ready");

        Arc::new(Mutex::new(Self {
            core,
            kind,
            buttons_state: 0,
        }))
    }

    /// Pushes one event into the guest's event queue.
    ///
    /// # Errors
    ///
    /// Fails when the queue is not ready or has no buffer posted; callers
    /// drop the whole gesture in that case.
    pub fn queue_event(&mut self, ev_type: u16, code: u16, value: u32) -> crate::Result<()> {
        let no_buffer = || {
            crate::VirtioError::Device {
                device: "input".to_string(),
                message: "no event buffer posted".to_string(),
            }
        };

        let Some(desc_idx) = self.core.peek_avail_desc(Self::EVENT_QUEUE) else {
            return Err(no_buffer());
        };

        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&ev_type.to_le_bytes());
        buf[2..4].copy_from_slice(&code.to_le_bytes());
        buf[4..8].copy_from_slice(&value.to_le_bytes());

        self.core
            .copy_to_queue(Self::EVENT_QUEUE, desc_idx, 0, &buf)?;
        self.core
            .consume_desc(Self::EVENT_QUEUE, desc_idx, buf.len());
        self.core.advance_avail(Self::EVENT_QUEUE);
        Ok(())
    }

    /// Sends a key press or release (keyboards only).
    ///
    /// # Errors
    ///
    /// Fails on non-keyboards or when no event buffer is posted.
    pub fn send_key_event(&mut self, down: bool, key_code: u16) -> crate::Result<()> {
        if self.kind != InputKind::Keyboard {
            return Err(crate::VirtioError::Device {
                device: "input".to_string(),
                message: "key event on non-keyboard".to_string(),
            });
        }
        self.queue_event(ev::KEY, key_code, u32::from(down))?;
        self.queue_event(ev::SYN, 0, 0)
    }

    /// Sends pointer motion, wheel, and button changes (mice and tablets).
    ///
    /// # Errors
    ///
    /// Fails on keyboards or when the event queue runs out of buffers
    /// mid-gesture.
    pub fn send_mouse_event(
        &mut self,
        dx: i32,
        dy: i32,
        dz: i32,
        buttons: u32,
    ) -> crate::Result<()> {
        match self.kind {
            InputKind::Mouse => {
                self.queue_event(ev::REL, REL_X, dx as u32)?;
                self.queue_event(ev::REL, REL_Y, dy as u32)?;
            }
            InputKind::Tablet => {
                self.queue_event(ev::ABS, u16::from(ABS_X), dx as u32)?;
                self.queue_event(ev::ABS, u16::from(ABS_Y), dy as u32)?;
            }
            InputKind::Keyboard => {
                return Err(crate::VirtioError::Device {
                    device: "input".to_string(),
                    message: "mouse event on keyboard".to_string(),
                })
            }
        }
        if dz != 0 {
            self.queue_event(ev::REL, REL_WHEEL, dz as u32)?;
        }

        if buttons != self.buttons_state {
            for (i, &button) in BUTTONS.iter().enumerate() {
                let now = (buttons >> i) & 1;
                let before = (self.buttons_state >> i) & 1;
                if now != before {
                    self.queue_event(ev::KEY, button, now)?;
                }
            }
            self.buttons_state = buttons;
        }

        self.queue_event(ev::SYN, 0, 0)
    }

    fn set_bitmap_bit(config: &mut [u8], bit: u16) {
        config[8 + usize::from(bit >> 3)] |= 1 << (bit & 7);
    }

    /// Answers the selector the driver just wrote. The reply length goes
    /// to offset 2, the payload from offset 8.
    fn answer_config_query(&mut self) {
        let select = self.core.config()[0];
        let subsel = self.core.config()[1];
        let mut reply = [0u8; 256];
        reply[..self.core.config().len()].copy_from_slice(self.core.config());

        match select {
            cfg::UNSET => return,
            cfg::ID_NAME => {
                let name: &[u8] = match self.kind {
                    InputKind::Keyboard => b"virtio_keyboard",
                    InputKind::Mouse => b"virtio_mouse",
                    InputKind::Tablet => b"virtio_tablet",
                };
                reply[2] = name.len() as u8;
                reply[8..8 + name.len()].copy_from_slice(name);
            }
            cfg::EV_BITS => {
                reply[2] = 0;
                match (self.kind, u16::from(subsel)) {
                    (InputKind::Keyboard, ev::KEY) => {
                        reply[2] = 128 / 8;
                        reply[8..8 + 128 / 8].fill(0xff);
                    }
                    (InputKind::Keyboard, ev::REP) => {
                        reply[2] = 1;
                    }
                    (InputKind::Mouse | InputKind::Tablet, ev::KEY) => {
                        reply[2] = (512u32 / 8) as u8;
                        reply[8..8 + 512 / 8].fill(0);
                        for &button in &BUTTONS {
                            Self::set_bitmap_bit(&mut reply, button);
                        }
                    }
                    (InputKind::Mouse, ev::REL) => {
                        reply[2] = 2;
                        reply[8] = 0;
                        reply[9] = 0;
                        Self::set_bitmap_bit(&mut reply, REL_X);
                        Self::set_bitmap_bit(&mut reply, REL_Y);
                        Self::set_bitmap_bit(&mut reply, REL_WHEEL);
                    }
                    (InputKind::Tablet, ev::REL) => {
                        reply[2] = 2;
                        reply[8] = 0;
                        reply[9] = 0;
                        Self::set_bitmap_bit(&mut reply, REL_WHEEL);
                    }
                    (InputKind::Tablet, ev::ABS) => {
                        reply[2] = 1;
                        reply[8] = 0;
                        Self::set_bitmap_bit(&mut reply, u16::from(ABS_X));
                        Self::set_bitmap_bit(&mut reply, u16::from(ABS_Y));
                    }
                    _ => {}
                }
            }
            cfg::ABS_INFO => {
                if self.kind == InputKind::Tablet && subsel <= ABS_Y {
                    // min, max, fuzz, flat, res
                    reply[2] = 5 * 4;
                    reply[8..12].copy_from_slice(&0u32.to_le_bytes());
                    reply[12..16].copy_from_slice(&(ABS_SCALE - 1).to_le_bytes());
                    reply[16..20].copy_from_slice(&0u32.to_le_bytes());
                    reply[20..24].copy_from_slice(&0u32.to_le_bytes());
                    reply[24..28].copy_from_slice(&0u32.to_le_bytes());
                }
            }
            // ID_SERIAL, ID_DEVIDS, PROP_BITS and anything unknown get an
            // empty reply.
            _ => {
                reply[2] = 0;
            }
        }

        self.core.set_config(0, &reply);
    }
}

impl VirtioDevice for VirtioInput {
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
        _write_size: usize,
    ) -> RecvStatus {
        if queue_idx == Self::STATUS_QUEUE {
            // LED and autorepeat updates: acknowledge and drop.
            self.core.consume_desc(queue_idx, desc_idx, 0);
        }
        RecvStatus::Done
    }

    fn config_written(&mut self) {
        self.answer_config_query();
    }
}
