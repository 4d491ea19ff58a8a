//! A background thread that periodically runs some maintenance work,
//! or sooner when nudged.  The cache uses one to reclaim soft index
//! entries off the request path.
use std::io::Result;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct State {
    pending: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Signal {
    state: Mutex<State>,
    wake: Condvar,
}

#[derive(Debug)]
pub(crate) struct Reaper {
    signal: Arc<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Spawns a thread named `name` that calls `work` every
    /// `interval`, or right after a [`Reaper::nudge`].  The thread
    /// exits when `work` returns false, or on shutdown.
    pub fn spawn(
        name: String,
        interval: Duration,
        mut work: impl FnMut() -> bool + Send + 'static,
    ) -> Result<Reaper> {
        let signal = Arc::new(Signal::default());
        let thread = {
            let signal = signal.clone();

            std::thread::Builder::new().name(name).spawn(move || loop {
                {
                    let mut state = signal.state.lock();
                    if !state.pending && !state.shutdown {
                        signal.wake.wait_for(&mut state, interval);
                    }

                    if state.shutdown {
                        return;
                    }

                    state.pending = false;
                }

                if !work() {
                    return;
                }
            })?
        };

        Ok(Reaper {
            signal,
            thread: Some(thread),
        })
    }

    /// Asks the thread to run its work soon.
    pub fn nudge(&self) {
        self.signal.state.lock().pending = true;
        self.signal.wake.notify_one();
    }

    /// Stops the thread and waits for it to exit.  Idempotent.
    pub fn shutdown(&mut self) {
        self.signal.state.lock().shutdown = true;
        self.signal.wake.notify_one();

        if let Some(thread) = self.thread.take() {
            // Never join ourselves.
            if thread.thread().id() == std::thread::current().id() {
                return;
            }

            if thread.join().is_err() {
                tracing::error!("soft index reaper panicked");
            }
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();

        while start.elapsed() < deadline {
            if cond() {
                return true;
            }

            std::thread::sleep(Duration::from_millis(5));
        }

        cond()
    }

    /// A nudge runs the work long before the (huge) interval.
    #[test]
    fn test_nudge() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut reaper = {
            let runs = runs.clone();
            Reaper::spawn("test-reaper".into(), Duration::from_secs(3600), move || {
                runs.fetch_add(1, Ordering::SeqCst);
                true
            })
            .expect("spawn must succeed")
        };

        reaper.nudge();
        assert!(wait_until(Duration::from_secs(10), || runs.load(Ordering::SeqCst) >= 1));

        reaper.shutdown();
        assert!(!reaper.is_running());
    }

    #[test]
    fn test_periodic() {
        let runs = Arc::new(AtomicUsize::new(0));
        let _reaper = {
            let runs = runs.clone();
            Reaper::spawn("test-reaper".into(), Duration::from_millis(5), move || {
                runs.fetch_add(1, Ordering::SeqCst);
                true
            })
            .expect("spawn must succeed")
        };

        assert!(wait_until(Duration::from_secs(10), || runs.load(Ordering::SeqCst) >= 3));
    }

    /// The thread exits on its own once the work says so.
    #[test]
    fn test_work_stops() {
        let reaper = Reaper::spawn("test-reaper".into(), Duration::from_millis(1), || false)
            .expect("spawn must succeed");

        assert!(wait_until(Duration::from_secs(10), || !reaper.is_running()));
    }

    /// Shutdown wakes a sleeping thread right away.
    #[test]
    fn test_shutdown_is_prompt() {
        let mut reaper = Reaper::spawn("test-reaper".into(), Duration::from_secs(3600), || true)
            .expect("spawn must succeed");
        assert!(reaper.is_running());

        let start = Instant::now();
        reaper.shutdown();
        assert!(start.elapsed() < Duration::from_secs(60));
        assert!(!reaper.is_running());

        // And again, for good measure.
        reaper.shutdown();
    }
}
