//! classlens-store - persistence for the ClassLens attendance daemon.
//!
//! One SQLite database holds student profiles with their face embeddings,
//! faculties, classes, attendance marks and generated reports. Embeddings
//! are stored as bracketed comma-separated text and queried through a
//! distance function registered on the connection, with a plain scan as
//! the fallback path.

pub mod store;
pub mod vector;

pub use store::{
    AttendanceRecord, ClassRecord, Faculty, NewClass, NewFaculty, NewStudent, Report, Store,
    StoreError, Student, STATUS_PRESENT,
};
pub use vector::{encode_vector, parse_vector, VectorError};
