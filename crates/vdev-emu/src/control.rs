//! Run-lifecycle plumbing: exit code and the stop pipe.
//!
//! The terminal pump (outside this crate) selects on the stop pipe's read
//! end alongside stdin; one byte written there tells it to wind down.

use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Mutex;

use crate::error::{EmuError, Result};

/// Exit-code latch plus the stop pipe.
pub struct IoControl {
    exit_code: Mutex<Option<i32>>,
    stop_tx: Mutex<Option<OwnedFd>>,
    stop_rx: Mutex<Option<OwnedFd>>,
}

impl IoControl {
    /// Creates the control block and its stop pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe cannot be created.
    pub fn new() -> Result<Self> {
        let mut fds = [0i32; 2];
        // SAFETY: fds points at two writable ints, as pipe(2) requires.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(EmuError::IoControl(format!(
                "pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        // The stop write must never block the dispatcher.
        // SAFETY: fds[1] is the pipe fd just created.
        unsafe {
            libc::fcntl(fds[1], libc::F_SETFL, libc::O_NONBLOCK);
        }
        // SAFETY: both fds are freshly created and owned by no one else.
        let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        Ok(Self {
            exit_code: Mutex::new(None),
            stop_tx: Mutex::new(Some(tx)),
            stop_rx: Mutex::new(Some(rx)),
        })
    }

    /// Hands the stop pipe's read end to the external I/O pump.
    #[must_use]
    pub fn take_stop_fd(&self) -> Option<OwnedFd> {
        self.stop_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Latches the exit code and pokes the stop pipe. The first stop wins;
    /// later calls are ignored.
    pub fn request_stop(&self, code: i32) {
        {
            let mut exit = self.exit_code.lock().unwrap_or_else(|e| e.into_inner());
            if exit.is_some() {
                return;
            }
            *exit = Some(code);
        }
        tracing::info!(code, "stop requested");

        let mut tx = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(fd) = tx.take() {
            use std::os::fd::AsRawFd;
            let byte = b'X';
            // SAFETY: fd is the owned write end; one byte from a stack
            // buffer.
            unsafe {
                libc::write(fd.as_raw_fd(), std::ptr::addr_of!(byte).cast(), 1);
            }
            // Dropping fd closes the write end, which also unblocks any
            // reader waiting for EOF.
        }
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.exit_code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The latched exit code (zero if no stop was ever requested).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(0)
    }
}
