//! Threshold nearest-neighbour search over enrolled descriptors.

use crate::store::{DescriptorStore, StoreError};
use crate::types::{Descriptor, EnrollmentRecord, MatchResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Records scored between cancellation/deadline checks.
const LIMIT_CHECK_INTERVAL: usize = 256;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid threshold: {0}")]
    InvalidThreshold(f32),
    #[error("scan cancelled after {scanned} of {total} enrollments")]
    Cancelled { scanned: usize, total: usize },
    #[error("scan timed out after {scanned} of {total} enrollments")]
    TimedOut { scanned: usize, total: usize },
}

/// Shared flag that aborts an in-flight scan.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Resource limits for a single gallery scan.
#[derive(Debug, Clone, Default)]
pub struct ScanLimits {
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelFlag>,
}

impl ScanLimits {
    /// No deadline, no cancellation.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check(&self, scanned: usize, total: usize) -> Result<(), MatchError> {
        if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            return Err(MatchError::Cancelled { scanned, total });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(MatchError::TimedOut { scanned, total });
        }
        Ok(())
    }
}

/// Outcome of a gallery scan, with counts of what was actually compared.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub result: MatchResult,
    /// Enrollments scored against the probe.
    pub compared: usize,
    /// Enrollments skipped because their length differs from the probe.
    pub skipped: usize,
}

impl Scan {
    fn empty() -> Self {
        Self {
            result: MatchResult::NoMatch,
            compared: 0,
            skipped: 0,
        }
    }
}

/// Strategy for comparing a probe descriptor against a gallery of enrollments.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Descriptor,
        gallery: &[EnrollmentRecord],
        threshold: f32,
        limits: &ScanLimits,
    ) -> Result<Scan, MatchError>;

    /// Match a probe against a snapshot of `store`.
    fn recognize(
        &self,
        store: &dyn DescriptorStore,
        probe: &Descriptor,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        self.recognize_with(store, probe, threshold, &ScanLimits::none())
            .map(|scan| scan.result)
    }

    /// [`recognize`](Self::recognize) with scan limits and the full report.
    fn recognize_with(
        &self,
        store: &dyn DescriptorStore,
        probe: &Descriptor,
        threshold: f32,
        limits: &ScanLimits,
    ) -> Result<Scan, MatchError> {
        check_threshold(threshold)?;

        let gallery = store.all()?;
        if gallery.is_empty() {
            tracing::debug!("no enrollments; skipping scan");
            return Ok(Scan::empty());
        }

        self.compare(probe, &gallery, threshold, limits)
    }
}

fn check_threshold(threshold: f32) -> Result<(), MatchError> {
    if threshold.is_nan() {
        return Err(MatchError::InvalidThreshold(threshold));
    }
    Ok(())
}

/// Full-scan cosine matcher.
///
/// A candidate wins only with a score strictly above both the threshold and
/// the best seen so far, so equal best scores resolve to the earliest
/// enrollment and `score == threshold` is not a match.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Descriptor,
        gallery: &[EnrollmentRecord],
        threshold: f32,
        limits: &ScanLimits,
    ) -> Result<Scan, MatchError> {
        check_threshold(threshold)?;

        let total = gallery.len();
        let mut best: Option<(&EnrollmentRecord, f32)> = None;
        let mut compared = 0;
        let mut skipped = 0;

        for (i, record) in gallery.iter().enumerate() {
            if i % LIMIT_CHECK_INTERVAL == 0 {
                limits.check(i, total)?;
            }

            let sim = match probe.similarity(&record.descriptor) {
                Ok(sim) => sim,
                Err(mismatch) => {
                    tracing::warn!(
                        employee_id = %record.employee_id,
                        expected = mismatch.expected,
                        actual = mismatch.actual,
                        "skipping enrollment with mismatched descriptor length"
                    );
                    skipped += 1;
                    continue;
                }
            };
            compared += 1;

            let best_sim = best.map_or(f32::NEG_INFINITY, |(_, s)| s);
            if sim > best_sim && sim > threshold {
                best = Some((record, sim));
            }
        }

        let result = match best {
            Some((record, similarity)) => MatchResult::Matched {
                employee_id: record.employee_id.clone(),
                name: record.name.clone(),
                similarity,
            },
            None => MatchResult::NoMatch,
        };

        tracing::debug!(
            total,
            compared,
            skipped,
            matched = result.is_match(),
            similarity = result.similarity(),
            "gallery scan complete"
        );

        Ok(Scan {
            result,
            compared,
            skipped,
        })
    }
}
