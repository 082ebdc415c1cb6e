use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use thiserror::Error;

use crate::region::Region;
use crate::results::ResultSet;
use crate::{FrameRange, Phase};

use super::backend::{DetectRequest, DetectorBackend};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Why a bounded detection call returned without detections.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector '{name}' gave no answer within {secs:.1}s")]
    TimedOut { name: String, secs: f64 },

    #[error("detection cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

struct Entry {
    name: String,
    serves_low: bool,
    serves_high: bool,
    backend: Arc<Mutex<dyn DetectorBackend>>,
}

impl Entry {
    fn serves(&self, phase: Phase) -> bool {
        match phase {
            Phase::Low => self.serves_low,
            Phase::High => self.serves_high,
        }
    }
}

/// Detector backends routed by phase.
///
/// The first registered backend that supports a phase serves it. Phase support
/// is read once at registration, so routing never waits on a busy backend.
/// Each call runs on its own thread; the caller stops waiting at the deadline
/// or when the cancel flag is raised.
#[derive(Default)]
pub struct DetectorRegistry {
    entries: Vec<Entry>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let entry = Entry {
            name: backend.name().to_string(),
            serves_low: backend.supports(Phase::Low),
            serves_high: backend.supports(Phase::High),
            backend: Arc::new(Mutex::new(backend)),
        };
        log::debug!(
            "registered detector '{}' (low: {}, high: {})",
            entry.name,
            entry.serves_low,
            entry.serves_high
        );
        self.entries.push(entry);
    }

    /// Backend names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    fn entry_for(&self, phase: Phase) -> Result<&Entry, DetectError> {
        self.entries
            .iter()
            .find(|e| e.serves(phase))
            .ok_or_else(|| anyhow!("no registered detector serves the {}", phase).into())
    }

    /// Runs the request on the backend serving its phase.
    ///
    /// Gives up with [`DetectError::TimedOut`] after `timeout` and with
    /// [`DetectError::Cancelled`] once `cancel` is set. An abandoned call keeps
    /// its backend locked until it returns.
    pub fn detect_within(
        &self,
        request: &DetectRequest<'_>,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<ResultSet, DetectError> {
        let entry = self.entry_for(request.phase)?;
        let job = DetectJob::from_request(request);
        let backend = Arc::clone(&entry.backend);
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("detect-{}", entry.name))
            .spawn(move || {
                let answer = match backend.lock() {
                    Ok(mut guard) => guard.detect(&job.request()),
                    Err(_) => Err(anyhow!("detector lock poisoned")),
                };
                let _ = tx.send(answer);
            })
            .map_err(|e| anyhow!("failed to start detector '{}': {}", entry.name, e))?;

        let deadline = Instant::now() + timeout;
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(answer) => return answer.map_err(DetectError::Failed),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("detector '{}' stopped without an answer", entry.name).into())
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            if cancel.load(Ordering::SeqCst) {
                log::warn!("abandoning '{}' for frames {}: cancelled", entry.name, request.range);
                return Err(DetectError::Cancelled);
            }
            if Instant::now() >= deadline {
                log::warn!("abandoning '{}' for frames {}: timed out", entry.name, request.range);
                return Err(DetectError::TimedOut {
                    name: entry.name.clone(),
                    secs: timeout.as_secs_f64(),
                });
            }
        }
    }

    /// Warms up every registered backend.
    pub fn warm_up(&self) -> anyhow::Result<()> {
        for entry in &self.entries {
            let mut guard = entry
                .backend
                .lock()
                .map_err(|_| anyhow!("detector '{}' lock poisoned", entry.name))?;
            guard.warm_up()?;
        }
        Ok(())
    }
}

/// Owned copy of a [`DetectRequest`] handed to the detector thread.
struct DetectJob {
    phase: Phase,
    range: FrameRange,
    regions: Vec<Region>,
    resolution: f64,
    qp: u32,
    frames_dir: Option<PathBuf>,
}

impl DetectJob {
    fn from_request(request: &DetectRequest<'_>) -> Self {
        Self {
            phase: request.phase,
            range: request.range,
            regions: request.regions.to_vec(),
            resolution: request.resolution,
            qp: request.qp,
            frames_dir: request.frames_dir.map(PathBuf::from),
        }
    }

    fn request(&self) -> DetectRequest<'_> {
        DetectRequest {
            phase: self.phase,
            range: self.range,
            regions: &self.regions,
            resolution: self.resolution,
            qp: self.qp,
            frames_dir: self.frames_dir.as_deref(),
        }
    }
}
