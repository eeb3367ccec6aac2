use presence_core::{
    AttendanceEvent, AttendanceRecorder, CosineMatcher, Descriptor, DescriptorStore,
    EnrollmentRecord, MatchError, MatchResult, Matcher, Scan, ScanLimits, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("match error: {0}")]
    Match(#[from] MatchError),
    #[error("descriptor has {actual} components, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("threshold must be within [-1, 1], got {0}")]
    InvalidThreshold(f32),
    #[error("failed to spawn writer thread: {0}")]
    Spawn(std::io::Error),
    #[error("recognition task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Matching parameters shared by every request.
#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub threshold: f32,
    pub duplicate_threshold: f32,
    pub descriptor_len: usize,
    pub scan_timeout: Option<Duration>,
}

/// Result of an enrollment.
#[derive(Debug)]
pub struct EnrollOutcome {
    pub record: EnrollmentRecord,
    /// Best existing enrollment of a *different* employee above the
    /// duplicate threshold, if any.
    pub possible_duplicate: Option<MatchResult>,
}

/// Result of a check-in: the scan, and the event logged on a match.
#[derive(Debug)]
pub struct CheckIn {
    pub scan: Scan,
    pub event: Option<AttendanceEvent>,
}

/// Messages sent to the writer thread.
enum EngineRequest {
    Enroll {
        record: EnrollmentRecord,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Record {
        event: AttendanceEvent,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Clone-safe handle to the engine.
///
/// Writes are funneled through one thread so enrollments and attendance
/// events land strictly one after another. Recognition runs on the blocking
/// pool against the shared store, so several scans proceed in parallel.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    store: Arc<dyn DescriptorStore>,
    settings: Arc<MatchSettings>,
}

impl EngineHandle {
    /// Enroll a descriptor for `employee_id`, reporting the closest other
    /// employee above the duplicate threshold.
    pub async fn enroll(
        &self,
        employee_id: String,
        name: Option<String>,
        descriptor: Descriptor,
    ) -> Result<EnrollOutcome, EngineError> {
        self.check_len(&descriptor)?;

        let nearest = self
            .nearest_other(descriptor.clone(), employee_id.clone())
            .await?
            .result;
        let possible_duplicate = match nearest {
            MatchResult::Matched {
                employee_id: ref other,
                similarity,
                ..
            } => {
                tracing::warn!(
                    employee_id = %employee_id,
                    similar_to = %other,
                    similarity,
                    "new enrollment closely matches another employee"
                );
                Some(nearest)
            }
            MatchResult::NoMatch => None,
        };

        let record = EnrollmentRecord::new(employee_id, descriptor, name);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                record: record.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;

        Ok(EnrollOutcome {
            record,
            possible_duplicate,
        })
    }

    /// Match a probe without recording anything.
    pub async fn recognize(&self, probe: Descriptor, threshold: Option<f32>) -> Result<Scan, EngineError> {
        self.check_len(&probe)?;
        let threshold = match threshold {
            Some(t) if !(-1.0..=1.0).contains(&t) => return Err(EngineError::InvalidThreshold(t)),
            Some(t) => t,
            None => self.settings.threshold,
        };
        self.scan(probe, threshold).await
    }

    /// Match a probe and, on success, append an attendance event.
    pub async fn check_in(
        &self,
        probe: Descriptor,
        threshold: Option<f32>,
        location: &str,
    ) -> Result<CheckIn, EngineError> {
        let scan = self.recognize(probe, threshold).await?;
        let Some(event) = AttendanceEvent::from_match(&scan.result, location) else {
            return Ok(CheckIn { scan, event: None });
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Record {
                event: event.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;

        Ok(CheckIn {
            scan,
            event: Some(event),
        })
    }

    fn check_len(&self, descriptor: &Descriptor) -> Result<(), EngineError> {
        if descriptor.len() != self.settings.descriptor_len {
            return Err(EngineError::DimensionMismatch {
                expected: self.settings.descriptor_len,
                actual: descriptor.len(),
            });
        }
        Ok(())
    }

    fn limits(&self) -> ScanLimits {
        match self.settings.scan_timeout {
            Some(timeout) => ScanLimits::none().with_timeout(timeout),
            None => ScanLimits::none(),
        }
    }

    async fn scan(&self, probe: Descriptor, threshold: f32) -> Result<Scan, EngineError> {
        let store = Arc::clone(&self.store);
        let limits = self.limits();

        let scan = tokio::task::spawn_blocking(move || {
            CosineMatcher.recognize_with(store.as_ref(), &probe, threshold, &limits)
        })
        .await??;
        Ok(scan)
    }

    /// Best match above the duplicate threshold among enrollments of
    /// employees other than `employee_id`.
    async fn nearest_other(&self, probe: Descriptor, employee_id: String) -> Result<Scan, EngineError> {
        let store = Arc::clone(&self.store);
        let limits = self.limits();
        let threshold = self.settings.duplicate_threshold;

        let scan = tokio::task::spawn_blocking(move || -> Result<Scan, MatchError> {
            let others: Vec<EnrollmentRecord> = store
                .all()?
                .iter()
                .filter(|r| r.employee_id != employee_id)
                .cloned()
                .collect();
            CosineMatcher.compare(&probe, &others, threshold, &limits)
        })
        .await??;
        Ok(scan)
    }
}

/// Spawn the writer thread.
///
/// The thread exits once every [`EngineHandle`] clone has been dropped.
pub fn spawn_engine(
    store: Arc<dyn DescriptorStore>,
    recorder: Arc<dyn AttendanceRecorder>,
    settings: MatchSettings,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);
    let writer_store = Arc::clone(&store);

    std::thread::Builder::new()
        .name("presence-writer".into())
        .spawn(move || {
            tracing::debug!("writer thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { record, reply } => {
                        let result = writer_store.append(record).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Record { event, reply } => {
                        let result = recorder.record(event).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::debug!("writer thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        store,
        settings: Arc::new(settings),
    })
}
