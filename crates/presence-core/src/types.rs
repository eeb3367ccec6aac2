use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::similarity::{cosine_similarity, DimensionMismatch};

/// Descriptor length produced by the bundled extractor.
pub const DEFAULT_DESCRIPTOR_LEN: usize = 128;

/// Cosine similarity a match must strictly exceed.
pub const DEFAULT_THRESHOLD: f32 = 0.8;

/// Display name recorded on attendance events for unnamed enrollments.
pub const UNKNOWN_EMPLOYEE_NAME: &str = "Unknown";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor has no components")]
    Empty,
    #[error("descriptor component {index} is not finite ({value})")]
    NonFinite { index: usize, value: f64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("employee identifier must not be empty")]
    EmptyEmployeeId,
    #[error("location tag must not be empty")]
    EmptyLocation,
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Face descriptor: a fixed-length feature vector produced by an extractor.
///
/// Serialized as a bare JSON array so stored records keep the
/// `faceDescriptor: number[]` shape. Components are f64 so values written by
/// JavaScript clients survive import and export unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    values: Vec<f64>,
}

impl Descriptor {
    /// Build a descriptor, rejecting empty vectors and NaN/infinite components.
    pub fn new(values: Vec<f64>) -> Result<Self, DescriptorError> {
        let descriptor = Self { values };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check the invariants enforced by [`new`](Self::new).
    ///
    /// Deserialized descriptors skip construction, so stores re-check them
    /// before persisting.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some((index, &value)) = self.values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index, value });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.values
    }

    /// Cosine similarity in [-1, 1]; zero-norm vectors score 0.
    pub fn similarity(&self, other: &Descriptor) -> Result<f32, DimensionMismatch> {
        cosine_similarity(&self.values, &other.values)
    }
}

/// One enrolled face for an employee. Employees may have several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRecord {
    pub employee_id: String,
    #[serde(rename = "faceDescriptor")]
    pub descriptor: Descriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Creation time, epoch milliseconds.
    pub timestamp: i64,
}

impl EnrollmentRecord {
    /// New enrollment stamped with the current time.
    pub fn new(employee_id: impl Into<String>, descriptor: Descriptor, name: Option<String>) -> Self {
        Self {
            employee_id: employee_id.into(),
            descriptor,
            name: name.filter(|n| !n.trim().is_empty()),
            timestamp: now_millis(),
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.employee_id.trim().is_empty() {
            return Err(RecordError::EmptyEmployeeId);
        }
        self.descriptor.validate()?;
        Ok(())
    }

    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Outcome of a recognition attempt. `NoMatch` is a normal result, not a fault.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchResult {
    Matched {
        employee_id: String,
        name: Option<String>,
        /// Cosine similarity of the winning enrollment.
        similarity: f32,
    },
    NoMatch,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    pub fn employee_id(&self) -> Option<&str> {
        match self {
            MatchResult::Matched { employee_id, .. } => Some(employee_id),
            MatchResult::NoMatch => None,
        }
    }

    pub fn similarity(&self) -> Option<f32> {
        match self {
            MatchResult::Matched { similarity, .. } => Some(*similarity),
            MatchResult::NoMatch => None,
        }
    }
}

/// Append-only attendance log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEvent {
    pub employee_id: String,
    pub name: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub location: String,
}

impl AttendanceEvent {
    pub fn new(employee_id: impl Into<String>, name: Option<&str>, location: impl Into<String>) -> Self {
        Self {
            employee_id: employee_id.into(),
            name: name.unwrap_or(UNKNOWN_EMPLOYEE_NAME).to_string(),
            timestamp: now_millis(),
            location: location.into(),
        }
    }

    /// Event for a positive match; `None` for `NoMatch`.
    pub fn from_match(result: &MatchResult, location: &str) -> Option<Self> {
        match result {
            MatchResult::Matched { employee_id, name, .. } => {
                Some(Self::new(employee_id.clone(), name.as_deref(), location))
            }
            MatchResult::NoMatch => None,
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.employee_id.trim().is_empty() {
            return Err(RecordError::EmptyEmployeeId);
        }
        if self.location.trim().is_empty() {
            return Err(RecordError::EmptyLocation);
        }
        Ok(())
    }

    pub fn recorded_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
