//! SQLite-backed enrollment store and attendance log.
//!
//! All writes go through one connection behind a mutex, each inside its own
//! transaction. Reads open a short-lived read-only connection and run inside
//! a deferred transaction, so with the WAL journal they see one committed
//! state and never block on the writer.

use presence_core::{
    AttendanceEvent, AttendanceRecorder, Descriptor, DescriptorStore, EnrollmentRecord, Snapshot,
    StoreError,
};
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Version 1 stored descriptor components as f32; version 2 stores f64.
const SCHEMA_VERSION: i64 = 2;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS enrollments (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    employee_id TEXT    NOT NULL CHECK (length(trim(employee_id)) > 0),
    name        TEXT,
    dims        INTEGER NOT NULL,
    descriptor  BLOB    NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_enrollments_employee ON enrollments (employee_id);

CREATE TABLE IF NOT EXISTS attendance (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    employee_id TEXT    NOT NULL,
    name        TEXT    NOT NULL,
    location    TEXT    NOT NULL,
    recorded_at INTEGER NOT NULL
);
";

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
}

/// Counts reported by `presence status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Readable enrollments; corrupt rows are not counted.
    pub enrollments: usize,
    pub employees: usize,
    pub attendance_events: usize,
}

pub struct SqliteStore {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`, upgrading older schemas.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OpenError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        let found: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if found > SCHEMA_VERSION {
            return Err(OpenError::UnsupportedSchema {
                found,
                supported: SCHEMA_VERSION,
            });
        }
        conn.execute_batch(SCHEMA_SQL)?;
        if found == 1 {
            let widened = widen_v1_descriptors(&mut conn)?;
            tracing::info!(path = %path.display(), widened, "migrated enrollment descriptors to f64");
        } else {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        tracing::info!(path = %path.display(), journal_mode = %mode, "enrollment database opened");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counts taken from one read snapshot.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut conn = self.reader()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(read_failure)?;
        let records = read_enrollments(&tx)?;
        let attendance_events: i64 = tx
            .query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))
            .map_err(read_failure)?;
        tx.commit().map_err(read_failure)?;

        let employees = records
            .iter()
            .map(|r| r.employee_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        Ok(StoreStats {
            enrollments: records.len(),
            employees,
            attendance_events: attendance_events as usize,
        })
    }

    fn reader(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(read_failure)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(read_failure)?;
        Ok(conn)
    }

    fn insert_enrollments(&self, records: &[EnrollmentRecord]) -> Result<(), StoreError> {
        for record in records {
            record.validate()?;
        }

        let mut conn = self
            .writer
            .lock()
            .map_err(|_| StoreError::WriteFailure("writer lock poisoned".into()))?;
        let tx = conn.transaction().map_err(write_failure)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO enrollments (employee_id, name, dims, descriptor, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(write_failure)?;
            for record in records {
                stmt.execute(params![
                    record.employee_id,
                    record.name,
                    record.descriptor.len() as i64,
                    encode_descriptor(&record.descriptor),
                    record.timestamp,
                ])
                .map_err(write_failure)?;
            }
        }
        tx.commit().map_err(write_failure)
    }

    fn insert_events(&self, events: &[AttendanceEvent]) -> Result<(), StoreError> {
        for event in events {
            event.validate()?;
        }

        let mut conn = self
            .writer
            .lock()
            .map_err(|_| StoreError::WriteFailure("writer lock poisoned".into()))?;
        let tx = conn.transaction().map_err(write_failure)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO attendance (employee_id, name, location, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(write_failure)?;
            for event in events {
                stmt.execute(params![event.employee_id, event.name, event.location, event.timestamp])
                    .map_err(write_failure)?;
            }
        }
        tx.commit().map_err(write_failure)
    }
}

impl DescriptorStore for SqliteStore {
    fn append(&self, record: EnrollmentRecord) -> Result<(), StoreError> {
        self.insert_enrollments(std::slice::from_ref(&record))?;
        tracing::info!(
            employee_id = %record.employee_id,
            dims = record.descriptor.len(),
            "enrollment stored"
        );
        Ok(())
    }

    fn append_all(&self, records: Vec<EnrollmentRecord>) -> Result<usize, StoreError> {
        self.insert_enrollments(&records)?;
        tracing::info!(count = records.len(), "enrollments stored");
        Ok(records.len())
    }

    fn all(&self) -> Result<Snapshot, StoreError> {
        let mut conn = self.reader()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(read_failure)?;
        let records = read_enrollments(&tx)?;
        tx.commit().map_err(read_failure)?;
        Ok(Arc::new(records))
    }

    /// Counts the same decoded rows [`all`](Self::all) returns.
    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.all()?.len())
    }
}

impl AttendanceRecorder for SqliteStore {
    fn record(&self, event: AttendanceEvent) -> Result<(), StoreError> {
        self.insert_events(std::slice::from_ref(&event))?;
        tracing::info!(
            employee_id = %event.employee_id,
            location = %event.location,
            "attendance recorded"
        );
        Ok(())
    }

    fn record_all(&self, events: Vec<AttendanceEvent>) -> Result<usize, StoreError> {
        self.insert_events(&events)?;
        tracing::info!(count = events.len(), "attendance events recorded");
        Ok(events.len())
    }

    fn events(&self) -> Result<Vec<AttendanceEvent>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn
            .prepare(
                "SELECT employee_id, name, location, recorded_at
                 FROM attendance ORDER BY seq",
            )
            .map_err(read_failure)?;

        let events = stmt
            .query_map([], |row| {
                Ok(AttendanceEvent {
                    employee_id: row.get(0)?,
                    name: row.get(1)?,
                    location: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })
            .map_err(read_failure)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_failure)?;

        Ok(events)
    }
}

/// Decode every enrollment row, skipping corrupt ones.
fn read_enrollments(conn: &Connection) -> Result<Vec<EnrollmentRecord>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT seq, employee_id, name, dims, descriptor, created_at
             FROM enrollments ORDER BY seq",
        )
        .map_err(read_failure)?;

    let rows = stmt
        .query_map([], |row| {
            Ok(EnrollmentRow {
                seq: row.get(0)?,
                employee_id: row.get(1)?,
                name: row.get(2)?,
                dims: row.get(3)?,
                descriptor: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .map_err(read_failure)?;

    let mut records = Vec::new();
    for row in rows {
        let row = row.map_err(read_failure)?;
        let seq = row.seq;
        match row.into_record() {
            Ok(record) => records.push(record),
            Err(reason) => {
                tracing::warn!(seq, reason = %reason, "skipping corrupt enrollment row");
            }
        }
    }
    Ok(records)
}

/// Rewrite version-1 f32 blobs as f64 and bump the schema version, in one
/// transaction. Rows whose blob does not match `dims` are left as they are.
fn widen_v1_descriptors(conn: &mut Connection) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    let rows: Vec<(i64, Vec<u8>)> = {
        let mut stmt =
            tx.prepare("SELECT seq, descriptor FROM enrollments WHERE length(descriptor) = dims * 4")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    {
        let mut update = tx.prepare("UPDATE enrollments SET descriptor = ?1 WHERE seq = ?2")?;
        for (seq, blob) in &rows {
            let widened: Vec<u8> = blob
                .chunks_exact(4)
                .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .flat_map(f64::to_le_bytes)
                .collect();
            update.execute(params![widened, seq])?;
        }
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(rows.len())
}

struct EnrollmentRow {
    seq: i64,
    employee_id: String,
    name: Option<String>,
    dims: i64,
    descriptor: Vec<u8>,
    created_at: i64,
}

impl EnrollmentRow {
    fn into_record(self) -> Result<EnrollmentRecord, String> {
        let values = decode_descriptor(&self.descriptor)?;
        if values.len() as i64 != self.dims {
            return Err(format!(
                "descriptor blob holds {} values, row says {}",
                values.len(),
                self.dims
            ));
        }
        let descriptor = Descriptor::new(values).map_err(|e| e.to_string())?;

        Ok(EnrollmentRecord {
            employee_id: self.employee_id,
            descriptor,
            name: self.name,
            timestamp: self.created_at,
        })
    }
}

/// Little-endian `f64` components, back to back.
fn encode_descriptor(descriptor: &Descriptor) -> Vec<u8> {
    descriptor
        .as_slice()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_descriptor(blob: &[u8]) -> Result<Vec<f64>, String> {
    if blob.len() % 8 != 0 {
        return Err(format!("descriptor blob length {} is not a multiple of 8", blob.len()));
    }
    Ok(blob
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

fn read_failure(e: rusqlite::Error) -> StoreError {
    StoreError::ReadFailure(e.to_string())
}

fn write_failure(e: rusqlite::Error) -> StoreError {
    StoreError::WriteFailure(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{CosineMatcher, MatchResult, Matcher, RecordError};

    fn record(id: &str, values: Vec<f64>, name: Option<&str>, timestamp: i64) -> EnrollmentRecord {
        EnrollmentRecord {
            employee_id: id.into(),
            descriptor: Descriptor::new(values).unwrap(),
            name: name.map(String::from),
            timestamp,
        }
    }

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("presence.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_new_database_is_empty() {
        let (_dir, store) = open_temp();
        assert!(store.is_empty().unwrap());
        assert!(store.all().unwrap().is_empty());
        assert!(store.events().unwrap().is_empty());
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/presence.db");
        SqliteStore::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_round_trip_and_durability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.db");
        let records: Vec<_> = (0..10)
            .map(|i| {
                record(
                    &format!("EMP{i:03}"),
                    (0..128).map(|j| ((i * 128 + j) as f64).sin()).collect(),
                    (i % 3 != 0).then_some("Worker"),
                    1_700_000_000_000 + i as i64,
                )
            })
            .collect();

        {
            let store = SqliteStore::open(&path).unwrap();
            for r in &records {
                store.append(r.clone()).unwrap();
            }
        }

        let store = SqliteStore::open(&path).unwrap();
        let all = store.all().unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all.as_slice(), records.as_slice());
        assert_eq!(store.len().unwrap(), 10);
    }

    #[test]
    fn test_append_rejects_invalid_record() {
        let (_dir, store) = open_temp();
        let err = store.append(record(" ", vec![1.0], None, 1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(RecordError::EmptyEmployeeId)));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_append_all_is_atomic() {
        let (_dir, store) = open_temp();
        let batch = vec![record("A", vec![1.0], None, 1), record("", vec![1.0], None, 2)];
        assert!(store.append_all(batch).is_err());
        assert!(store.is_empty().unwrap());

        let batch = vec![record("A", vec![1.0], None, 1), record("B", vec![1.0], None, 2)];
        assert_eq!(store.append_all(batch).unwrap(), 2);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_append() {
        let (_dir, store) = open_temp();
        store.append(record("A", vec![1.0, 0.0], None, 1)).unwrap();
        let snapshot = store.all().unwrap();
        store.append(record("B", vec![0.0, 1.0], None, 2)).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_rows_skipped() {
        let (_dir, store) = open_temp();
        store.append(record("good", vec![1.0, 0.0], None, 1)).unwrap();
        {
            let conn = store.writer.lock().unwrap();
            conn.execute(
                "INSERT INTO enrollments (employee_id, name, dims, descriptor, created_at)
                 VALUES ('torn', NULL, 2, x'0000803F00', 2)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO enrollments (employee_id, name, dims, descriptor, created_at)
                 VALUES ('lying', NULL, 3, x'0000803F00000000', 3)",
                [],
            )
            .unwrap();
        }

        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].employee_id, "good");
        assert_eq!(store.len().unwrap(), all.len());
        assert_eq!(store.stats().unwrap().enrollments, 1);
    }

    #[test]
    fn test_only_corrupt_rows_counts_as_empty() {
        let (_dir, store) = open_temp();
        store
            .writer
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO enrollments (employee_id, name, dims, descriptor, created_at)
                 VALUES ('torn', NULL, 2, x'00', 1)",
                [],
            )
            .unwrap();

        assert!(store.all().unwrap().is_empty());
        assert!(store.is_empty().unwrap());
        assert_eq!(store.stats().unwrap().employees, 0);
    }

    #[test]
    fn test_full_precision_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.db");
        let values = vec![0.12345678901234568, -0.9876543210987654, 1e-300];
        SqliteStore::open(&path)
            .unwrap()
            .append(record("EMP001", values.clone(), None, 1))
            .unwrap();

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.all().unwrap()[0].descriptor.as_slice(), values.as_slice());
    }

    #[test]
    fn test_upgrades_f32_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(SCHEMA_SQL).unwrap();
            let blob: Vec<u8> = [0.5f32, -0.25].iter().flat_map(|v| v.to_le_bytes()).collect();
            conn.execute(
                "INSERT INTO enrollments (employee_id, name, dims, descriptor, created_at)
                 VALUES ('EMP001', 'Ana', 2, ?1, 7)",
                params![blob],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO enrollments (employee_id, name, dims, descriptor, created_at)
                 VALUES ('torn', NULL, 2, x'0000', 8)",
                [],
            )
            .unwrap();
            conn.pragma_update(None, "user_version", 1).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].employee_id, "EMP001");
        assert_eq!(all[0].descriptor.as_slice(), &[0.5, -0.25]);

        let conn = Connection::open(&path).unwrap();
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_attendance_round_trip() {
        let (_dir, store) = open_temp();
        let first = AttendanceEvent {
            employee_id: "EMP001".into(),
            name: "Ana".into(),
            timestamp: 10,
            location: "field".into(),
        };
        let second = AttendanceEvent::new("EMP002", None, "gate");
        store.record(first.clone()).unwrap();
        store.record(second.clone()).unwrap();

        assert_eq!(store.events().unwrap(), vec![first, second]);
        assert!(store.is_empty().unwrap(), "attendance does not enroll anyone");
    }

    #[test]
    fn test_record_all_is_atomic() {
        let (_dir, store) = open_temp();
        let batch = vec![
            AttendanceEvent::new("EMP001", None, "field"),
            AttendanceEvent::new("EMP002", None, " "),
        ];
        assert!(store.record_all(batch).is_err());
        assert!(store.events().unwrap().is_empty());

        let batch = vec![
            AttendanceEvent::new("EMP001", None, "field"),
            AttendanceEvent::new("EMP002", None, "gate"),
        ];
        assert_eq!(store.record_all(batch).unwrap(), 2);
        assert_eq!(store.events().unwrap().len(), 2);
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = open_temp();
        store.append(record("A", vec![1.0], None, 1)).unwrap();
        store.append(record("A", vec![0.5], None, 2)).unwrap();
        store.append(record("B", vec![1.0], None, 3)).unwrap();
        store.record(AttendanceEvent::new("A", None, "field")).unwrap();

        assert_eq!(
            store.stats().unwrap(),
            StoreStats {
                enrollments: 3,
                employees: 2,
                attendance_events: 1,
            }
        );
    }

    #[test]
    fn test_rejects_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        }
        assert!(matches!(
            SqliteStore::open(&path),
            Err(OpenError::UnsupportedSchema { found, .. }) if found == SCHEMA_VERSION + 1
        ));
    }

    #[test]
    fn test_recognize_against_sqlite() {
        let (_dir, store) = open_temp();
        store.append(record("A", vec![1.0, 0.0, 0.0], Some("Ana"), 1)).unwrap();
        store.append(record("B", vec![0.0, 1.0, 0.0], None, 2)).unwrap();

        let probe = Descriptor::new(vec![0.9, 0.1, 0.0]).unwrap();
        let result = CosineMatcher.recognize(&store, &probe, 0.8).unwrap();
        assert_eq!(result.employee_id(), Some("A"));

        let probe = Descriptor::new(vec![0.0, 0.0, 1.0]).unwrap();
        assert_eq!(CosineMatcher.recognize(&store, &probe, 0.8).unwrap(), MatchResult::NoMatch);
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let (_dir, store) = open_temp();
        store.append(record("seed", vec![1.0, 0.0], None, 0)).unwrap();
        let store = Arc::new(store);
        let probe = Descriptor::new(vec![1.0, 0.0]).unwrap();

        std::thread::scope(|s| {
            let writer = {
                let store = Arc::clone(&store);
                s.spawn(move || {
                    for i in 0..50 {
                        store.append(record(&format!("W{i}"), vec![0.0, 1.0], None, i)).unwrap();
                    }
                })
            };
            for _ in 0..4 {
                let store = Arc::clone(&store);
                let probe = probe.clone();
                s.spawn(move || {
                    for _ in 0..20 {
                        let snapshot = store.all().unwrap();
                        assert!(snapshot.iter().all(|r| r.descriptor.len() == 2));
                        let result = CosineMatcher.recognize(store.as_ref(), &probe, 0.8).unwrap();
                        assert_eq!(result.employee_id(), Some("seed"));
                    }
                });
            }
            writer.join().unwrap();
        });

        assert_eq!(store.len().unwrap(), 51);
    }
}
