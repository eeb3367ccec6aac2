//! presence-core — Face descriptor matching engine.
//!
//! Scores probe descriptors against enrolled ones with cosine similarity and
//! applies a decision threshold. Storage and attendance logging are traits so
//! callers inject their own backends.

pub mod extractor;
pub mod matcher;
pub mod recorder;
pub mod similarity;
pub mod store;
pub mod types;

pub use extractor::{ExtractError, FeatureExtractor, SimulatedExtractor};
pub use matcher::{CancelFlag, CosineMatcher, MatchError, Matcher, Scan, ScanLimits};
pub use recorder::{AttendanceRecorder, MemoryAttendanceLog};
pub use similarity::{cosine_similarity, DimensionMismatch};
pub use store::{DescriptorStore, MemoryStore, Snapshot, StoreError};
pub use types::{
    AttendanceEvent, Descriptor, DescriptorError, EnrollmentRecord, MatchResult, RecordError,
    DEFAULT_DESCRIPTOR_LEN, DEFAULT_THRESHOLD, UNKNOWN_EMPLOYEE_NAME,
};
