//! Queue-notification scheduler.
//!
//! Guest `QueueNotify` writes land on the MMIO dispatcher thread, which
//! must answer the bus before the guest times out. Ring processing is
//! therefore deferred: the dispatcher records the queue in the device's
//! pending bitset and signals the scheduler; a worker thread drains the
//! bitsets and runs `queue_notify` outside the bus-response path.
//!
//! The bitset hand-off is lock-free: producers `fetch_or` with release
//! ordering, the worker takes the whole set with an acquire `swap`. A bit
//! set between the swap and the drain completing is observed on the
//! worker's next pass, so no notification is lost.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::device::VirtioDevice;
use crate::mmio::MAX_QUEUE;

/// One device as seen by the worker.
pub struct DeviceHandle {
    /// The device's pending-queue bitset (bit n = queue n).
    pub pending: Arc<AtomicU32>,
    /// The device itself.
    pub dev: Arc<Mutex<dyn VirtioDevice>>,
}

#[derive(Default)]
struct SchedState {
    pending: bool,
    stop: bool,
}

/// Wakes the drain worker when any device has queued notifications.
pub struct NotifyScheduler {
    state: Mutex<SchedState>,
    cond: Condvar,
}

impl NotifyScheduler {
    /// Creates an idle scheduler.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedState::default()),
            cond: Condvar::new(),
        })
    }

    /// Signals the worker that at least one pending bitset is non-empty.
    pub fn kick(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending = true;
        self.cond.notify_one();
    }

    /// Tells the worker to exit after its current pass.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending = true;
        state.stop = true;
        self.cond.notify_one();
    }

    /// Spawns the drain worker over `devices`.
    ///
    /// The handle joins once [`Self::stop`] has been called and the final
    /// pass finished.
    pub fn spawn(self: &Arc<Self>, devices: Vec<DeviceHandle>) -> JoinHandle<()> {
        let sched = Arc::clone(self);
        std::thread::Builder::new()
            .name("virtio-queues".to_string())
            .spawn(move || sched.run(&devices))
            .unwrap_or_else(|e| {
                // Thread spawn failing at startup leaves the emulator
                // unable to service any queue; nothing to recover.
                panic!("failed to spawn notify worker: {e}")
            })
    }

    fn run(&self, devices: &[DeviceHandle]) {
        tracing::debug!(devices = devices.len(), "notify worker running");
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                while !state.pending {
                    state = self
                        .cond
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
                if state.stop {
                    state.stop = false;
                    tracing::debug!("notify worker exiting");
                    return;
                }
                // Clear before draining: a notification arriving during
                // the drain must re-signal.
                state.pending = false;
            }

            for handle in devices {
                // Take the bits before processing them; holding them while
                // notifying would let a concurrent producer's bit be
                // clobbered.
                let mut bits = handle.pending.swap(0, Ordering::Acquire);
                let mut queue_idx = 0;
                while bits != 0 && queue_idx < MAX_QUEUE {
                    if bits & (1 << queue_idx) != 0 {
                        bits &= !(1 << queue_idx);
                        let mut dev = handle.dev.lock().unwrap_or_else(|e| e.into_inner());
                        dev.queue_notify(queue_idx);
                    }
                    queue_idx += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{RecvStatus, VirtioBus, VirtioCore, VirtioDevice};
    use crate::dma::SharedRam;
    use crate::irq::tests::FakeIrqController;
    use crate::irq::IrqLine;
    use std::time::{Duration, Instant};

    struct CountingDevice {
        core: VirtioCore,
        notified: Arc<AtomicU32>,
    }

    impl VirtioDevice for CountingDevice {
        fn core(&self) -> &VirtioCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut VirtioCore {
            &mut self.core
        }

        fn recv(&mut self, _: usize, _: u16, _: usize, _: usize) -> RecvStatus {
            RecvStatus::Done
        }

        fn queue_notify(&mut self, queue_idx: usize) {
            // Queues are unprogrammed here; just record the call.
            self.notified
                .fetch_or(1 << queue_idx, Ordering::SeqCst);
        }
    }

    fn counting_device(sched: &Arc<NotifyScheduler>) -> (Arc<Mutex<CountingDevice>>, Arc<AtomicU32>) {
        let ram = Arc::new(SharedRam::new(0x1000));
        let irq = Arc::new(FakeIrqController::default());
        let bus = VirtioBus {
            dma: ram,
            irq: IrqLine::new(irq, 0),
            scheduler: sched.clone(),
        };
        let notified = Arc::new(AtomicU32::new(0));
        let dev = Arc::new(Mutex::new(CountingDevice {
            core: VirtioCore::new(&bus, 4, 0),
            notified: notified.clone(),
        }));
        (dev, notified)
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
    fn test_worker_drains_pending_bits() {
        let sched = NotifyScheduler::new();
        let (dev, notified) = counting_device(&sched);
        let pending = dev.lock().unwrap().core().notify_bits();

        let worker = sched.spawn(vec![DeviceHandle {
            pending,
            dev: dev.clone(),
        }]);

        dev.lock().unwrap().core().async_queue_notify(0);
        assert!(wait_until(Duration::from_secs(5), || {
            notified.load(Ordering::SeqCst) & 1 != 0
        }));

        sched.stop();
        worker.join().unwrap();
    }

    #[test]
    fn test_concurrent_notifies_lose_no_queue() {
        let sched = NotifyScheduler::new();
        let (dev, notified) = counting_device(&sched);
        let pending = dev.lock().unwrap().core().notify_bits();

        let worker = sched.spawn(vec![DeviceHandle {
            pending,
            dev: dev.clone(),
        }]);

        let core_a = dev.lock().unwrap().core().notify_bits();
        let core_b = core_a.clone();
        let sched_a = sched.clone();
        let sched_b = sched.clone();
        let t1 = std::thread::spawn(move || {
            core_a.fetch_or(1 << 1, Ordering::Release);
            sched_a.kick();
        });
        let t2 = std::thread::spawn(move || {
            core_b.fetch_or(1 << 2, Ordering::Release);
            sched_b.kick();
        });
        t1.join().unwrap();
        t2.join().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            notified.load(Ordering::SeqCst) & 0b110 == 0b110
        }));

        sched.stop();
        worker.join().unwrap();
    }

    #[test]
    fn test_stop_terminates_worker_without_notifications() {
        let sched = NotifyScheduler::new();
        let worker = sched.spawn(Vec::new());
        sched.stop();
        worker.join().unwrap();
    }
}
