/// Completion Sync
///
/// A hardware-visible counter the accelerator decrements when a packet
/// completes, and a bounded wait on it reaching zero.

use crate::error::Result;
use crate::hal::{Platform, Runtime};
use crate::types::SignalHandle;
use std::time::{Duration, Instant};

/// Initial value of a completion signal; one decrement completes it
pub const SIGNAL_ARMED: i64 = 1;

const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(10);

pub struct CompletionSignal {
    handle: SignalHandle,
    runtime: Runtime,
}

impl CompletionSignal {
    /// Create a signal armed for one completion
    pub fn new(runtime: &Runtime) -> Result<Self> {
        Self::with_value(runtime, SIGNAL_ARMED)
    }

    pub fn with_value(runtime: &Runtime, initial: i64) -> Result<Self> {
        let handle = runtime.platform().signal_create(initial).map_err(|e| {
            log::error!("{e}");
            e
        })?;
        Ok(Self {
            handle,
            runtime: runtime.clone(),
        })
    }

    pub fn handle(&self) -> SignalHandle {
        self.handle
    }

    pub fn value(&self) -> i64 {
        self.runtime.platform().signal_load(self.handle)
    }

    /// Re-arm before reusing the signal for another dispatch
    pub fn reset(&self) {
        self.runtime.platform().signal_store(self.handle, SIGNAL_ARMED);
    }

    /// Wait for the signal to reach zero, see [`wait`]
    pub fn wait(&self, timeout: Duration) -> bool {
        wait_on(self.runtime.platform(), self.handle, timeout, DEFAULT_WAIT_SLICE)
    }

    /// Like `wait`, blocking for at most `slice` per platform wait
    pub fn wait_sliced(&self, timeout: Duration, slice: Duration) -> bool {
        wait_on(self.runtime.platform(), self.handle, timeout, slice)
    }
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("handle", &self.handle)
            .field("value", &self.value())
            .finish()
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.platform().signal_destroy(self.handle) {
            log::error!("{e}");
        }
    }
}

/// Wait for `signal` to reach zero.
///
/// Returns `true` once it does, `false` if it is still non-zero after
/// `timeout` of wall-clock time. Completion observed at the deadline counts.
pub fn wait(runtime: &Runtime, signal: SignalHandle, timeout: Duration) -> bool {
    wait_on(runtime.platform(), signal, timeout, DEFAULT_WAIT_SLICE)
}

fn wait_on(platform: &dyn Platform, signal: SignalHandle, timeout: Duration, slice: Duration) -> bool {
    let begin = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(begin.elapsed());
        if platform.signal_wait_eq(signal, 0, remaining.min(slice)) == 0 {
            return true;
        }

        let elapsed = begin.elapsed();
        if elapsed >= timeout {
            if platform.signal_load(signal) == 0 {
                return true;
            }
            log::warn!("Kernel execution timed out, elapsed time: {elapsed:?}");
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimPlatform;
    use std::sync::Arc;
    use std::thread;

    fn runtime() -> Runtime {
        Runtime::new(Arc::new(SimPlatform::builder().build())).unwrap()
    }

    /// Decrement the signal from another thread after `delay`
    fn complete_after(rt: &Runtime, signal: SignalHandle, delay: Duration) -> thread::JoinHandle<()> {
        let rt = rt.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            rt.platform().signal_store(signal, 0);
        })
    }

    #[test]
    fn completes_before_timeout() {
        let rt = runtime();
        let signal = CompletionSignal::new(&rt).unwrap();
        let worker = complete_after(&rt, signal.handle(), Duration::from_millis(20));
        assert!(signal.wait(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn never_completes() {
        let rt = runtime();
        let signal = CompletionSignal::new(&rt).unwrap();
        let begin = Instant::now();
        assert!(!signal.wait(Duration::from_millis(50)));
        assert!(begin.elapsed() >= Duration::from_millis(50));
        assert_eq!(signal.value(), 1);
    }

    #[test]
    fn already_complete_returns_immediately() {
        let rt = runtime();
        let signal = CompletionSignal::with_value(&rt, 0).unwrap();
        assert!(signal.wait(Duration::ZERO));
    }

    #[test]
    fn completion_at_the_deadline_counts() {
        let rt = runtime();
        let signal = CompletionSignal::new(&rt).unwrap();
        rt.platform().signal_store(signal.handle(), 0);
        // Zero timeout: the only check happens at the deadline.
        assert!(wait(&rt, signal.handle(), Duration::ZERO));
    }

    #[test]
    fn late_completion_times_out_then_reset_rearms() {
        let rt = runtime();
        let signal = CompletionSignal::new(&rt).unwrap();
        let worker = complete_after(&rt, signal.handle(), Duration::from_millis(300));
        assert!(!signal.wait_sliced(Duration::from_millis(30), Duration::from_millis(5)));
        worker.join().unwrap();
        assert!(signal.wait(Duration::ZERO));

        signal.reset();
        assert_eq!(signal.value(), SIGNAL_ARMED);
    }
}
