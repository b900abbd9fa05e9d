//! The software GPU timeline.
//!
//! A worker thread drains queue operations in submission order. Fences are
//! counters the worker raises; CPU waits block on a condition variable.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::device::{Command, DeviceState};
use crate::backend::TextureId;

/// Monotonic fence shared between the CPU and the worker.
#[derive(Debug, Default)]
pub struct Fence {
    value: Mutex<u64>,
    reached: Condvar,
}

impl Fence {
    pub fn completed(&self) -> u64 {
        *self.value.lock()
    }

    pub(crate) fn signal(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
        }
        self.reached.notify_all();
    }

    pub fn wait(&self, value: u64) {
        let mut current = self.value.lock();
        while *current < value {
            self.reached.wait(&mut current);
        }
    }
}

/// Pauses and resumes the software GPU.
///
/// While paused, submitted work queues up and no fence advances, which makes
/// frames observably in flight.
#[derive(Debug, Clone, Default)]
pub struct GpuGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl GpuGate {
    pub fn pause(&self) {
        *self.inner.0.lock() = true;
    }

    pub fn resume(&self) {
        let (paused, cond) = &*self.inner;
        *paused.lock() = false;
        cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.0.lock()
    }

    fn wait_open(&self) {
        let (paused, cond) = &*self.inner;
        let mut guard = paused.lock();
        while *guard {
            cond.wait(&mut guard);
        }
    }
}

pub(crate) enum QueueOp {
    Execute {
        label: String,
        commands: Vec<Command>,
    },
    Signal {
        fence: Arc<Fence>,
        value: u64,
    },
    Present {
        backbuffer: TextureId,
    },
}

/// Sending half of the queue plus the worker thread.
pub(crate) struct Queue {
    sender: Option<Sender<QueueOp>>,
    worker: Option<JoinHandle<()>>,
}

impl Queue {
    pub fn spawn(device: Arc<Mutex<DeviceState>>, gate: GpuGate) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam::channel::unbounded();
        let worker = std::thread::Builder::new()
            .name("software-gpu".into())
            .spawn(move || run(receiver, device, gate))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn push(&self, op: QueueOp) -> bool {
        match &self.sender {
            Some(sender) => sender.send(op).is_ok(),
            None => false,
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued work and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Software GPU worker panicked");
            }
        }
    }
}

fn run(receiver: Receiver<QueueOp>, device: Arc<Mutex<DeviceState>>, gate: GpuGate) {
    log::debug!("Software GPU worker started");
    for op in receiver.iter() {
        gate.wait_open();
        match op {
            QueueOp::Execute { label, commands } => {
                log::trace!("Executing {} ({} commands)", label, commands.len());
                device.lock().execute(&label, commands);
            }
            QueueOp::Signal { fence, value } => {
                device.lock().stats.signals += 1;
                fence.signal(value);
            }
            QueueOp::Present { backbuffer } => device.lock().present(backbuffer),
        }
    }
    log::debug!("Software GPU worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fence_wait_returns_after_signal() {
        let fence = Arc::new(Fence::default());
        let waiter = {
            let fence = fence.clone();
            std::thread::spawn(move || fence.wait(3))
        };
        fence.signal(1);
        std::thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        fence.signal(3);
        waiter.join().unwrap();
        assert_eq!(fence.completed(), 3);
    }

    #[test]
    fn test_fence_never_decreases() {
        let fence = Fence::default();
        fence.signal(5);
        fence.signal(2);
        assert_eq!(fence.completed(), 5);
    }

    #[test]
    fn test_gate_blocks_until_resumed() {
        let gate = GpuGate::default();
        gate.pause();
        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.wait_open())
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        gate.resume();
        waiter.join().unwrap();
    }
}
