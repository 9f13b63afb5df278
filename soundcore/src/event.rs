use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::{Error, Result};

bitflags! {
    /// Readiness and fault bits carried by an I/O event.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventState: u32 {
        /// Captured data is waiting in the buffer.
        const READABLE = 1 << 0;
        /// The buffer has room for more playback data.
        const WRITABLE = 1 << 1;
        /// The hardware latched a transfer fault.
        const ERROR = 1 << 2;
        /// The stream was torn down under a sleeping waiter.
        const CANCELLED = 1 << 3;
    }
}

/// How long an I/O wait may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitTimeout {
    Indefinite,
    /// Zero polls exactly once.
    Millis(u64),
}

/// Wait object attached to a cyclic buffer.
///
/// The producing and consuming sides publish buffer occupancy through the
/// readiness bits; waiters block on the condvar. Fault and cancel bits are
/// latched so a sleeper always observes a teardown that raced its wait.
pub struct IoEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl IoEvent {
    pub fn new() -> Self {
        IoEvent {
            state: Mutex::new(EventState::empty()),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> EventState {
        *self.state.lock().unwrap()
    }

    /// Sets bits, waking waiters when anything new appears.
    pub fn set(&self, bits: EventState) {
        let mut state = self.state.lock().unwrap();
        if !state.contains(bits) {
            state.insert(bits);
            self.cond.notify_all();
        }
    }

    pub fn clear(&self, bits: EventState) {
        self.state.lock().unwrap().remove(bits);
    }

    pub fn latch_error(&self) {
        self.set(EventState::ERROR);
    }

    pub fn cancel(&self) {
        self.set(EventState::CANCELLED);
    }

    /// Clears latched fault and cancel bits before a stream is reused.
    pub fn rearm(&self) {
        self.clear(EventState::ERROR | EventState::CANCELLED);
    }

    /// Blocks until one of `ready` is set, a fault or cancel is latched,
    /// or the timeout runs out.
    pub fn wait(&self, ready: EventState, timeout: WaitTimeout) -> Result<()> {
        let deadline = match timeout {
            WaitTimeout::Indefinite => None,
            WaitTimeout::Millis(millis) => Some(Instant::now() + Duration::from_millis(millis)),
        };

        let mut state = self.state.lock().unwrap();
        loop {
            if state.contains(EventState::CANCELLED) {
                return Err(Error::Cancelled);
            }
            if state.contains(EventState::ERROR) {
                return Err(Error::DeviceIoError);
            }
            if state.intersects(ready) {
                return Ok(());
            }

            match deadline {
                None => {
                    state = self.cond.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }
}

impl Default for IoEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn zero_timeout_polls_once() {
        let event = IoEvent::new();
        assert_eq!(
            event.wait(EventState::READABLE, WaitTimeout::Millis(0)),
            Err(Error::Timeout)
        );

        event.set(EventState::READABLE);
        assert_eq!(event.wait(EventState::READABLE, WaitTimeout::Millis(0)), Ok(()));
    }

    #[test]
    fn set_wakes_waiter() {
        let event = Arc::new(IoEvent::new());
        let waker = event.clone();
        let waiter = thread::spawn(move || event.wait(EventState::WRITABLE, WaitTimeout::Indefinite));
        thread::sleep(Duration::from_millis(10));
        waker.set(EventState::WRITABLE);
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn cancel_beats_readiness() {
        let event = IoEvent::new();
        event.set(EventState::READABLE);
        event.cancel();
        assert_eq!(
            event.wait(EventState::READABLE, WaitTimeout::Indefinite),
            Err(Error::Cancelled)
        );
        event.rearm();
        assert_eq!(event.wait(EventState::READABLE, WaitTimeout::Millis(0)), Ok(()));
    }

    #[test]
    fn error_latches_until_rearm() {
        let event = IoEvent::new();
        event.latch_error();
        assert_eq!(
            event.wait(EventState::WRITABLE, WaitTimeout::Indefinite),
            Err(Error::DeviceIoError)
        );
    }
}
