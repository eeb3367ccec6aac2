//! JSON interchange in the legacy check-in clients' storage layout.
//!
//! Enrollments are a JSON array of `{employeeId, faceDescriptor, name?,
//! timestamp}` and attendance a JSON array of `{employeeId, name, timestamp,
//! location}`.

use presence_core::{AttendanceEvent, AttendanceRecorder, DescriptorStore, EnrollmentRecord, StoreError};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LegacyError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub imported: usize,
    /// Entries rejected by validation (blank identifier, bad descriptor).
    pub skipped: usize,
}

/// Import every valid enrollment in `path` as one batch.
pub fn import_enrollments(store: &dyn DescriptorStore, path: &Path) -> Result<ImportSummary, LegacyError> {
    let records: Vec<EnrollmentRecord> = read_json(path)?;

    let mut valid = Vec::with_capacity(records.len());
    let mut skipped = 0;
    for (index, record) in records.into_iter().enumerate() {
        match record.validate() {
            Ok(()) => valid.push(record),
            Err(e) => {
                tracing::warn!(index, employee_id = %record.employee_id, error = %e, "skipping invalid enrollment");
                skipped += 1;
            }
        }
    }

    let imported = store.append_all(valid)?;
    tracing::info!(path = %path.display(), imported, skipped, "enrollments imported");
    Ok(ImportSummary { imported, skipped })
}

/// Write the store's current snapshot to `path`. Returns the record count.
pub fn export_enrollments(store: &dyn DescriptorStore, path: &Path) -> Result<usize, LegacyError> {
    let snapshot = store.all()?;
    write_json(path, snapshot.as_slice())?;
    tracing::info!(path = %path.display(), count = snapshot.len(), "enrollments exported");
    Ok(snapshot.len())
}

/// Import every valid attendance event in `path` as one batch.
pub fn import_attendance(recorder: &dyn AttendanceRecorder, path: &Path) -> Result<ImportSummary, LegacyError> {
    let events: Vec<AttendanceEvent> = read_json(path)?;

    let mut valid = Vec::with_capacity(events.len());
    let mut skipped = 0;
    for (index, event) in events.into_iter().enumerate() {
        match event.validate() {
            Ok(()) => valid.push(event),
            Err(e) => {
                tracing::warn!(index, error = %e, "skipping invalid attendance event");
                skipped += 1;
            }
        }
    }

    let imported = recorder.record_all(valid)?;
    tracing::info!(path = %path.display(), imported, skipped, "attendance imported");
    Ok(ImportSummary { imported, skipped })
}

pub fn export_attendance(recorder: &dyn AttendanceRecorder, path: &Path) -> Result<usize, LegacyError> {
    let events = recorder.events()?;
    write_json(path, &events)?;
    tracing::info!(path = %path.display(), count = events.len(), "attendance exported");
    Ok(events.len())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, LegacyError> {
    let file = File::open(path).map_err(|source| io_error(path, source))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| LegacyError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Write to a sibling temp file, then rename over `path`.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), LegacyError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let file = File::create(&tmp).map_err(|source| io_error(&tmp, source))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| LegacyError::Json {
        path: tmp.display().to_string(),
        source,
    })?;
    writer.flush().map_err(|source| io_error(&tmp, source))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|source| io_error(&tmp, source))?;

    std::fs::rename(&tmp, path).map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> LegacyError {
    LegacyError::Io {
        path: path.display().to_string(),
        source,
    }
}
