use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Half duplex byte link to the battery bus.
pub trait Transport {
    /// Writes a complete frame and blocks until it left the driver.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Waits for one frame delimited by `start` and `end`.
    ///
    /// Bytes before `start` are discarded. Returns `Ok(None)` when no complete
    /// frame arrives within `timeout`; a partial frame is never returned.
    fn receive_frame(
        &mut self,
        timeout: Duration,
        start: u8,
        end: u8,
    ) -> Result<Option<Vec<u8>>, Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        (**self).send(frame)
    }

    fn receive_frame(
        &mut self,
        timeout: Duration,
        start: u8,
        end: u8,
    ) -> Result<Option<Vec<u8>>, Error> {
        (**self).receive_frame(timeout, start, end)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        (**self).send(frame)
    }

    fn receive_frame(
        &mut self,
        timeout: Duration,
        start: u8,
        end: u8,
    ) -> Result<Option<Vec<u8>>, Error> {
        (**self).receive_frame(timeout, start, end)
    }
}

const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Cloneable flag asking a running poll loop to stop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` in short slices.
    ///
    /// Returns `false` as soon as the signal is raised, `true` if the full
    /// duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_shared_between_clones() {
        let signal = StopSignal::new();
        let handle = signal.clone();
        assert!(!signal.is_stopped());
        handle.stop();
        assert!(signal.is_stopped());
    }

    #[test]
    fn sleep_returns_early_when_stopped() {
        let signal = StopSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)));

        signal.stop();
        let started = Instant::now();
        assert!(!signal.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sleep_is_interrupted_from_another_thread() {
        let signal = StopSignal::new();
        let handle = signal.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            handle.stop();
        });
        assert!(!signal.sleep(Duration::from_secs(10)));
        stopper.join().unwrap();
    }
}
