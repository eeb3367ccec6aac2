//! Attendance log contract.

use crate::store::StoreError;
use crate::types::AttendanceEvent;
use std::sync::Mutex;

/// Append-only log of attendance events.
pub trait AttendanceRecorder: Send + Sync {
    fn record(&self, event: AttendanceEvent) -> Result<(), StoreError>;

    /// Record several events. Implementations with transactions make this
    /// all-or-nothing; the default records one by one.
    fn record_all(&self, events: Vec<AttendanceEvent>) -> Result<usize, StoreError> {
        let count = events.len();
        for event in events {
            self.record(event)?;
        }
        Ok(count)
    }

    /// Every recorded event, oldest first.
    fn events(&self) -> Result<Vec<AttendanceEvent>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryAttendanceLog {
    events: Mutex<Vec<AttendanceEvent>>,
}

impl MemoryAttendanceLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttendanceRecorder for MemoryAttendanceLog {
    fn record(&self, event: AttendanceEvent) -> Result<(), StoreError> {
        event.validate()?;
        let mut events = self
            .events
            .lock()
            .map_err(|_| StoreError::WriteFailure("attendance lock poisoned".into()))?;
        tracing::info!(employee_id = %event.employee_id, location = %event.location, "attendance recorded");
        events.push(event);
        Ok(())
    }

    fn record_all(&self, batch: Vec<AttendanceEvent>) -> Result<usize, StoreError> {
        for event in &batch {
            event.validate()?;
        }
        let mut events = self
            .events
            .lock()
            .map_err(|_| StoreError::WriteFailure("attendance lock poisoned".into()))?;
        let count = batch.len();
        events.extend(batch);
        tracing::info!(count, "attendance events recorded");
        Ok(count)
    }

    fn events(&self) -> Result<Vec<AttendanceEvent>, StoreError> {
        let events = self
            .events
            .lock()
            .map_err(|_| StoreError::ReadFailure("attendance lock poisoned".into()))?;
        Ok(events.clone())
    }
}
