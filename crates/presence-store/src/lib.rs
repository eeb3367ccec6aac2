//! presence-store — Durable storage for enrollments and attendance.
//!
//! SQLite for the live database, plus JSON import/export in the legacy
//! `employeeId`/`faceDescriptor` layout kept by older check-in clients.

pub mod legacy;
pub mod sqlite;

pub use legacy::{
    export_attendance, export_enrollments, import_attendance, import_enrollments, ImportSummary,
    LegacyError,
};
pub use sqlite::{OpenError, SqliteStore, StoreStats};
