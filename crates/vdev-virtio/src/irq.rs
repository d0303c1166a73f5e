//! Interrupt line plumbing.
//!
//! The host exposes a single pair of write-1-to-set / write-1-to-clear
//! level registers; each device owns one bit in them.

use std::sync::Arc;

/// Level-triggered interrupt register pair.
pub trait IrqController: Send + Sync {
    /// Raises the lines in `mask`.
    fn set_levels(&self, mask: u32);

    /// Lowers the lines in `mask`.
    fn clear_levels(&self, mask: u32);
}

/// One device's interrupt line.
#[derive(Clone)]
pub struct IrqLine {
    controller: Arc<dyn IrqController>,
    mask: u32,
}

impl IrqLine {
    /// Binds bit `bit` of the controller's level register.
    #[must_use]
    pub fn new(controller: Arc<dyn IrqController>, bit: u32) -> Self {
        Self {
            controller,
            mask: 1 << bit,
        }
    }

    /// Asserts the line.
    pub fn raise(&self) {
        self.controller.set_levels(self.mask);
    }

    /// Deasserts the line.
    pub fn lower(&self) {
        self.controller.clear_levels(self.mask);
    }
}

impl std::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqLine").field("mask", &self.mask).finish()
    }
}
