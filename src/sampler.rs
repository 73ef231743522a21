use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;
use crate::error::SamplerError;
use crate::metrics::{PeakState, Snapshot};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
/// Shorter intervals are raised to this so the sampling loop never spins.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Something that can be asked for the current memory readings.
pub trait SnapshotSource: Send {
    fn take_snapshot(&mut self) -> Snapshot;
}

impl<F> SnapshotSource for F
where
    F: FnMut() -> Snapshot + Send,
{
    fn take_snapshot(&mut self) -> Snapshot {
        self()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Periodically snapshots a [`SnapshotSource`] on a background thread and
/// keeps the running peaks.
///
/// Once [`Sampler::stop`] returns the sampling thread has exited, so the
/// returned peaks are final.
pub struct Sampler {
    interval: Duration,
    state: SamplerState,
    source: Option<Box<dyn SnapshotSource>>,
    peaks: Arc<Mutex<PeakState>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    pub fn new(source: impl SnapshotSource + 'static, interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            state: SamplerState::Idle,
            source: Some(Box::new(source)),
            peaks: Arc::new(Mutex::new(PeakState::new())),
            cancel: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Peaks observed so far. Only final after `stop`.
    pub fn peaks(&self) -> PeakState {
        self.peaks.lock().clone()
    }

    /// Spawns the sampling thread. The first snapshot is taken immediately.
    pub fn start(&mut self) -> Result<(), SamplerError> {
        let Some(source) = self.source.take().filter(|_| self.state == SamplerState::Idle) else {
            return Err(SamplerError::InvalidState {
                expected: SamplerState::Idle,
                found: self.state,
            });
        };

        let peaks = Arc::clone(&self.peaks);
        let cancel = Arc::clone(&self.cancel);
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("memscope-sampler".to_string())
            .spawn(move || run(source, &peaks, &cancel, interval));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = SamplerState::Running;
                debug!("sampler started with interval {:?}", interval);
                Ok(())
            }
            Err(e) => {
                self.state = SamplerState::Stopped;
                Err(SamplerError::Spawn(e))
            }
        }
    }

    /// Signals the sampling thread and waits for it to exit.
    ///
    /// Blocks for as long as an in-flight snapshot takes. Stopping a sampler
    /// that is not running is an `InvalidState` error.
    pub fn stop(&mut self) -> Result<PeakState, SamplerError> {
        if self.state != SamplerState::Running {
            return Err(SamplerError::InvalidState {
                expected: SamplerState::Running,
                found: self.state,
            });
        }

        self.state = SamplerState::Stopping;
        self.cancel.store(true, Ordering::Release);

        let joined = match self.handle.take() {
            Some(handle) => {
                handle.thread().unpark();
                handle.join()
            }
            None => Ok(()),
        };
        self.state = SamplerState::Stopped;

        let peaks = self.peaks();
        debug!(
            "sampler stopped after {} samples (peak cpu {:.2} MB, peak gpu {:.2} MB)",
            peaks.samples, peaks.peak_cpu_mem, peaks.peak_gpu_total_mem
        );
        joined.map_err(|_| SamplerError::Panicked)?;
        Ok(peaks)
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if self.state == SamplerState::Running {
            let _ = self.stop();
        }
    }
}

fn run(
    mut source: Box<dyn SnapshotSource>,
    peaks: &Mutex<PeakState>,
    cancel: &AtomicBool,
    interval: Duration,
) {
    while !cancel.load(Ordering::Acquire) {
        let snapshot = source.take_snapshot();
        peaks.lock().fold(&snapshot);

        // park_timeout can wake spuriously; sleep out the full interval
        // unless cancelled.
        let deadline = Instant::now() + interval;
        loop {
            if cancel.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
}
