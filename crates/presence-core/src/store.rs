//! Enrollment storage contract and an in-memory implementation.

use crate::types::{EnrollmentRecord, RecordError};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("write failure: {0}")]
    WriteFailure(String),
    #[error("read failure: {0}")]
    ReadFailure(String),
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordError),
}

/// Point-in-time view of every enrollment, in insertion order.
pub type Snapshot = Arc<Vec<EnrollmentRecord>>;

/// Durable mapping from employee identifiers to enrolled descriptors.
///
/// Implementations serialize `append` calls and hand out snapshots that
/// never observe a partially written record.
pub trait DescriptorStore: Send + Sync {
    /// Persist a new enrollment.
    fn append(&self, record: EnrollmentRecord) -> Result<(), StoreError>;

    /// Persist several enrollments. Implementations with transactions make
    /// this all-or-nothing; the default appends one by one.
    fn append_all(&self, records: Vec<EnrollmentRecord>) -> Result<usize, StoreError> {
        let count = records.len();
        for record in records {
            self.append(record)?;
        }
        Ok(count)
    }

    /// Every enrollment currently stored.
    fn all(&self) -> Result<Snapshot, StoreError>;

    /// Number of stored enrollments.
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Copy-on-write in-memory store.
///
/// Readers hold an `Arc` to the vector they saw; an append clones the
/// vector only while such a snapshot is still alive.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Arc<Vec<EnrollmentRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing records, validating each.
    pub fn with_records(records: Vec<EnrollmentRecord>) -> Result<Self, StoreError> {
        for record in &records {
            record.validate()?;
        }
        Ok(Self {
            records: RwLock::new(Arc::new(records)),
        })
    }
}

impl DescriptorStore for MemoryStore {
    fn append(&self, record: EnrollmentRecord) -> Result<(), StoreError> {
        record.validate()?;

        let mut guard = self
            .records
            .write()
            .map_err(|_| StoreError::WriteFailure("enrollment lock poisoned".into()))?;

        tracing::debug!(
            employee_id = %record.employee_id,
            dims = record.descriptor.len(),
            "enrollment appended"
        );
        Arc::make_mut(&mut guard).push(record);
        Ok(())
    }

    fn append_all(&self, records: Vec<EnrollmentRecord>) -> Result<usize, StoreError> {
        for record in &records {
            record.validate()?;
        }

        let mut guard = self
            .records
            .write()
            .map_err(|_| StoreError::WriteFailure("enrollment lock poisoned".into()))?;

        let count = records.len();
        Arc::make_mut(&mut guard).extend(records);
        tracing::debug!(count, "enrollments appended");
        Ok(count)
    }

    fn all(&self) -> Result<Snapshot, StoreError> {
        let guard = self
            .records
            .read()
            .map_err(|_| StoreError::ReadFailure("enrollment lock poisoned".into()))?;
        Ok(Arc::clone(&guard))
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.all()?.len())
    }
}

impl<S: DescriptorStore + ?Sized> DescriptorStore for Arc<S> {
    fn append(&self, record: EnrollmentRecord) -> Result<(), StoreError> {
        (**self).append(record)
    }

    fn append_all(&self, records: Vec<EnrollmentRecord>) -> Result<usize, StoreError> {
        (**self).append_all(records)
    }

    fn all(&self) -> Result<Snapshot, StoreError> {
        (**self).all()
    }

    fn len(&self) -> Result<usize, StoreError> {
        (**self).len()
    }

    fn is_empty(&self) -> Result<bool, StoreError> {
        (**self).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Descriptor;

    fn record(id: &str, values: Vec<f64>, name: Option<&str>, timestamp: i64) -> EnrollmentRecord {
        EnrollmentRecord {
            employee_id: id.into(),
            descriptor: Descriptor::new(values).unwrap(),
            name: name.map(String::from),
            timestamp,
        }
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = MemoryStore::new();
        assert!(store.is_empty().unwrap());
        assert_eq!(store.len().unwrap(), 0);
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn test_append_round_trips_all_fields() {
        let store = MemoryStore::new();
        let records: Vec<_> = (0..5)
            .map(|i| {
                record(
                    &format!("EMP{i:03}"),
                    vec![i as f64, 1.0, -0.5],
                    (i % 2 == 0).then_some("Named"),
                    1_700_000_000_000 + i,
                )
            })
            .collect();

        for r in &records {
            store.append(r.clone()).unwrap();
        }

        let all = store.all().unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all.as_slice(), records.as_slice());
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn test_multiple_enrollments_per_employee() {
        let store = MemoryStore::new();
        store.append(record("EMP001", vec![1.0, 0.0], None, 1)).unwrap();
        store.append(record("EMP001", vec![0.0, 1.0], None, 2)).unwrap();
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_append_rejects_empty_employee_id() {
        let store = MemoryStore::new();
        let err = store.append(record("", vec![1.0], None, 1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(RecordError::EmptyEmployeeId)));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_append() {
        let store = MemoryStore::new();
        store.append(record("EMP001", vec![1.0], None, 1)).unwrap();

        let snapshot = store.all().unwrap();
        store.append(record("EMP002", vec![1.0], None, 2)).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[test]
    fn test_append_all_is_all_or_nothing() {
        let store = MemoryStore::new();
        let batch = vec![
            record("EMP001", vec![1.0], None, 1),
            record(" ", vec![1.0], None, 2),
        ];
        assert!(store.append_all(batch).is_err());
        assert!(store.is_empty().unwrap());

        let batch = vec![
            record("EMP001", vec![1.0], None, 1),
            record("EMP002", vec![1.0], None, 2),
        ];
        assert_eq!(store.append_all(batch).unwrap(), 2);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_appends_all_land() {
        let store = Arc::new(MemoryStore::new());
        std::thread::scope(|s| {
            for t in 0..4 {
                let store = Arc::clone(&store);
                s.spawn(move || {
                    for i in 0..25 {
                        store
                            .append(record(&format!("T{t}-{i}"), vec![1.0, t as f64], None, i))
                            .unwrap();
                    }
                });
            }
        });
        assert_eq!(store.len().unwrap(), 100);
    }
}
