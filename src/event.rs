use std::sync::{Condvar, Mutex};

use anyhow::Result;

use crate::error::RunError;
use crate::types::DeviceOption;

#[derive(Debug, Default)]
struct EventState {
    recorded: bool,
    outstanding: bool,
}

/// A device-attached synchronization token.
///
/// State machine: `unset -> recorded -> awaited*`. Recording twice within
/// one net iteration, without the net-level reset in between, is an
/// invariant violation. Host kernels complete inline on their worker, so a
/// CPU event records the moment its chain body finishes.
pub struct Event {
    device: DeviceOption,
    state: Mutex<EventState>,
    cv: Condvar,
}

impl Event {
    pub fn new(device: DeviceOption) -> Self {
        Self {
            device,
            state: Mutex::new(EventState::default()),
            cv: Condvar::new(),
        }
    }

    pub fn device(&self) -> DeviceOption {
        self.device
    }

    /// Reset at the start of each net iteration.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("event lock poisoned");
        state.recorded = false;
        state.outstanding = false;
    }

    pub fn record(&self) -> Result<()> {
        let mut state = self.state.lock().expect("event lock poisoned");
        if state.recorded {
            return Err(RunError::DeviceError(format!(
                "event on {} recorded twice without a reset",
                self.device
            ))
            .into());
        }
        state.recorded = true;
        state.outstanding = true;
        self.cv.notify_all();
        Ok(())
    }

    pub fn is_recorded(&self) -> bool {
        self.state.lock().expect("event lock poisoned").recorded
    }

    pub fn is_outstanding(&self) -> bool {
        self.state.lock().expect("event lock poisoned").outstanding
    }

    /// Block the host thread until the event records, then consume the
    /// outstanding flag. Used for end-of-net synchronization.
    pub fn host_wait(&self) {
        let mut state = self.state.lock().expect("event lock poisoned");
        while !state.recorded {
            state = self.cv.wait(state).expect("event lock poisoned");
        }
        state.outstanding = false;
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("device", &self.device)
            .field("recorded", &self.is_recorded())
            .finish()
    }
}

/// The logical submission stream a chain executes on. Work submitted to one
/// stream runs in FIFO order; anything across streams synchronizes through
/// events.
pub struct Stream {
    device: DeviceOption,
}

impl Stream {
    pub fn new(device: DeviceOption) -> Self {
        Self { device }
    }

    pub fn device(&self) -> DeviceOption {
        self.device
    }

    /// Order this stream after `event`.
    ///
    /// Same-domain producers are already serialized by stream FIFO order.
    /// Cross-domain producers must have recorded: chains are dispatched
    /// only after every parent chain finished, so an unset event here means
    /// the producer never recorded one. That is a synchronization bug, not
    /// a transient state.
    pub fn wait_event(&self, event: &Event) -> Result<()> {
        let mut state = event.state.lock().expect("event lock poisoned");
        if event.device.same_domain(&self.device) {
            state.outstanding = false;
            return Ok(());
        }
        if !state.recorded {
            return Err(RunError::InvalidSync(format!(
                "stream {} waiting on unrecorded event from {}",
                self.device, event.device
            ))
            .into());
        }
        if event.device.kind != self.device.kind || event.device.index != self.device.index {
            crate::trace!(
                "cross-device wait: {} waiting on {}",
                self.device,
                event.device
            );
        }
        state.outstanding = false;
        Ok(())
    }
}
