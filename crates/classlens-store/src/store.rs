//! SQLite-backed enrollment, attendance and reporting store.
//!
//! The store owns one connection behind a mutex; every public call is a
//! single transaction. Nearest-enrollment lookups run in SQL through a
//! registered `vec_distance` function and fall back to a direct scan of
//! the same rows when the SQL path fails, with the same metric either way.

use crate::vector::{self, VectorError};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use classlens_core::index::{scan_nearest, IndexError, Neighbor, SimilarityIndex};
use classlens_core::types::{DistanceMetric, Embedding};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Status written for every accepted match.
pub const STATUS_PRESENT: &str = "Present";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS faculties (
    faculty_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL,
    email        TEXT UNIQUE,
    phone_number TEXT,
    role         TEXT
);
CREATE TABLE IF NOT EXISTS classes (
    class_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    class_name          TEXT NOT NULL,
    faculty_id          INTEGER REFERENCES faculties(faculty_id),
    schedule_start_time TEXT,
    schedule_end_time   TEXT
);
CREATE TABLE IF NOT EXISTS students (
    student_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT NOT NULL,
    email          TEXT NOT NULL UNIQUE,
    phone_number   TEXT,
    department     TEXT,
    face_embedding TEXT NOT NULL,
    passport_path  TEXT,
    created_at     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    attendance_id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id    INTEGER NOT NULL REFERENCES students(student_id),
    class_id      INTEGER REFERENCES classes(class_id),
    date          TEXT NOT NULL,
    in_time       TEXT NOT NULL,
    out_time      TEXT,
    status        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS reports (
    report_id             INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id            INTEGER NOT NULL REFERENCES students(student_id),
    attendance_percentage REAL NOT NULL,
    remarks               TEXT NOT NULL,
    generated_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id);
CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("already registered: {0}")]
    Conflict(String),
    #[error("embedding dimension mismatch: store holds {expected}-dim vectors, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("stored vector malformed: {0}")]
    Vector(#[from] VectorError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("no reports to export")]
    NoReports,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Enrolled student profile. The face template is not part of the read
/// model; it only travels through the index queries.
#[derive(Debug, Clone, Serialize)]
pub struct Student {
    pub student_id: i64,
    pub name: String,
    pub email: String,
    pub phone_number: Option<String>,
    pub department: Option<String>,
    pub passport_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input profile for registration.
#[derive(Debug, Clone, Default)]
pub struct NewStudent {
    pub name: String,
    pub email: String,
    pub phone_number: Option<String>,
    pub department: Option<String>,
    pub passport_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub attendance_id: i64,
    pub student_id: i64,
    pub class_id: Option<i64>,
    pub date: NaiveDate,
    pub in_time: DateTime<Utc>,
    pub out_time: Option<DateTime<Utc>>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Faculty {
    pub faculty_id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewFaculty {
    pub name: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassRecord {
    pub class_id: i64,
    pub class_name: String,
    pub faculty_id: Option<i64>,
    pub schedule_start_time: Option<NaiveTime>,
    pub schedule_end_time: Option<NaiveTime>,
}

#[derive(Debug, Clone, Default)]
pub struct NewClass {
    pub class_name: String,
    pub faculty_id: Option<i64>,
    pub schedule_start_time: Option<NaiveTime>,
    pub schedule_end_time: Option<NaiveTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub report_id: i64,
    pub student_id: i64,
    pub attendance_percentage: f64,
    pub remarks: String,
    pub generated_at: DateTime<Utc>,
}

pub struct Store {
    conn: Mutex<Connection>,
    dimension: usize,
    metric: DistanceMetric,
}

impl Store {
    /// Open (or create) the store at `path`.
    ///
    /// The embedding dimension is pinned in the database on first open;
    /// reopening with a different encoder dimension is a configuration
    /// error, not something to paper over.
    pub fn open(path: &Path, dimension: usize, metric: DistanceMetric) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self::setup(conn, dimension, metric, true)?;
        tracing::info!(path = %path.display(), dimension, metric = %metric, "opened store");
        Ok(store)
    }

    /// In-memory store, for tests and ephemeral runs.
    pub fn open_in_memory(dimension: usize, metric: DistanceMetric) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::setup(conn, dimension, metric, true)
    }

    /// Store whose connection lacks the `vec_distance` function, so every
    /// lookup exercises the fallback scan.
    #[cfg(test)]
    fn open_in_memory_without_vec_distance(
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::setup(conn, dimension, metric, false)
    }

    fn setup(
        conn: Connection,
        dimension: usize,
        metric: DistanceMetric,
        with_vec_distance: bool,
    ) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('embedding_dimension', ?1)",
            params![dimension.to_string()],
        )?;
        let stored: String = conn.query_row(
            "SELECT value FROM meta WHERE key = 'embedding_dimension'",
            [],
            |row| row.get(0),
        )?;
        let stored: usize = stored
            .parse()
            .map_err(|_| StoreError::Unavailable(format!("corrupt embedding_dimension: {stored}")))?;
        if stored != dimension {
            return Err(StoreError::DimensionMismatch { expected: stored, got: dimension });
        }

        if with_vec_distance {
            register_vec_distance(&conn, metric)?;
        }

        Ok(Self { conn: Mutex::new(conn), dimension, metric })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    // --- students ---

    /// Register a student profile together with their face embedding.
    ///
    /// All-or-nothing: either the profile and the template both commit, or
    /// neither does. Duplicate emails are a [`StoreError::Conflict`].
    pub fn register_student(
        &self,
        new: &NewStudent,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<Student, StoreError> {
        if new.name.trim().is_empty() || new.email.trim().is_empty() {
            return Err(StoreError::Invalid("name and email are required".to_string()));
        }
        if embedding.dimension() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.dimension(),
            });
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let result = tx.execute(
            "INSERT INTO students (name, email, phone_number, department, face_embedding, passport_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.name,
                new.email,
                new.phone_number,
                new.department,
                vector::encode_vector(&embedding.values),
                new.passport_path,
                now.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict(new.email.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        let student_id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::info!(student_id, email = %new.email, "registered student");
        Ok(Student {
            student_id,
            name: new.name.clone(),
            email: new.email.clone(),
            phone_number: new.phone_number.clone(),
            department: new.department.clone(),
            passport_path: new.passport_path.clone(),
            created_at: now,
        })
    }

    pub fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT student_id, name, email, phone_number, department, passport_path, created_at
             FROM students ORDER BY created_at DESC, student_id DESC",
        )?;
        let students = stmt
            .query_map([], row_to_student)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(students)
    }

    pub fn get_student(&self, student_id: i64) -> Result<Student, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT student_id, name, email, phone_number, department, passport_path, created_at
             FROM students WHERE student_id = ?1",
            params![student_id],
            row_to_student,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("student {student_id}")))
    }

    pub fn student_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // --- attendance ---

    /// Record a Present mark for an already-matched student.
    pub fn record_attendance(
        &self,
        student_id: i64,
        class_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<AttendanceRecord, StoreError> {
        let conn = self.lock()?;
        let enrolled: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM students WHERE student_id = ?1)",
            params![student_id],
            |row| row.get(0),
        )?;
        if !enrolled {
            return Err(StoreError::NotFound(format!("student {student_id}")));
        }

        let date = now.date_naive();
        let result = conn.execute(
            "INSERT INTO attendance (student_id, class_id, date, in_time, out_time, status)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![student_id, class_id, date.to_string(), now.to_rfc3339(), STATUS_PRESENT],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_foreign_key_violation(&e) => {
                let class = class_id.map(|id| id.to_string()).unwrap_or_default();
                return Err(StoreError::NotFound(format!("class {class}")));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(AttendanceRecord {
            attendance_id: conn.last_insert_rowid(),
            student_id,
            class_id,
            date,
            in_time: now,
            out_time: None,
            status: STATUS_PRESENT.to_string(),
        })
    }

    /// Most recent attendance first.
    pub fn list_attendance(&self, limit: u32) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT attendance_id, student_id, class_id, date, in_time, out_time, status
             FROM attendance ORDER BY date DESC, in_time DESC, attendance_id DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map(params![limit], row_to_attendance)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // --- faculties and classes ---

    pub fn create_faculty(&self, new: &NewFaculty) -> Result<Faculty, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::Invalid("faculty name is required".to_string()));
        }
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO faculties (name, email, phone_number, role) VALUES (?1, ?2, ?3, ?4)",
            params![new.name, new.email, new.phone_number, new.role],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict(new.email.clone().unwrap_or_default()));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Faculty {
            faculty_id: conn.last_insert_rowid(),
            name: new.name.clone(),
            email: new.email.clone(),
            phone_number: new.phone_number.clone(),
            role: new.role.clone(),
        })
    }

    pub fn list_faculties(&self) -> Result<Vec<Faculty>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT faculty_id, name, email, phone_number, role FROM faculties ORDER BY faculty_id",
        )?;
        let faculties = stmt
            .query_map([], |row| {
                Ok(Faculty {
                    faculty_id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    phone_number: row.get(3)?,
                    role: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(faculties)
    }

    pub fn create_class(&self, new: &NewClass) -> Result<ClassRecord, StoreError> {
        if new.class_name.trim().is_empty() {
            return Err(StoreError::Invalid("class name is required".to_string()));
        }
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO classes (class_name, faculty_id, schedule_start_time, schedule_end_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                new.class_name,
                new.faculty_id,
                new.schedule_start_time.map(|t| t.format("%H:%M:%S").to_string()),
                new.schedule_end_time.map(|t| t.format("%H:%M:%S").to_string()),
            ],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_foreign_key_violation(&e) => {
                let faculty = new.faculty_id.map(|id| id.to_string()).unwrap_or_default();
                return Err(StoreError::NotFound(format!("faculty {faculty}")));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(ClassRecord {
            class_id: conn.last_insert_rowid(),
            class_name: new.class_name.clone(),
            faculty_id: new.faculty_id,
            schedule_start_time: new.schedule_start_time,
            schedule_end_time: new.schedule_end_time,
        })
    }

    pub fn list_classes(&self) -> Result<Vec<ClassRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT class_id, class_name, faculty_id, schedule_start_time, schedule_end_time
             FROM classes ORDER BY class_id",
        )?;
        let classes = stmt
            .query_map([], |row| {
                Ok(ClassRecord {
                    class_id: row.get(0)?,
                    class_name: row.get(1)?,
                    faculty_id: row.get(2)?,
                    schedule_start_time: parse_time_opt(3, row.get(3)?)?,
                    schedule_end_time: parse_time_opt(4, row.get(4)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(classes)
    }

    // --- reports ---

    /// Generate one report per student: share of distinct attendance dates
    /// on which the student was marked Present.
    pub fn generate_reports(&self, now: DateTime<Utc>) -> Result<Vec<Report>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let total_days: i64 =
            tx.query_row("SELECT COUNT(DISTINCT date) FROM attendance", [], |row| row.get(0))?;
        // A roster with no attendance yet reports 0% rather than dividing by zero.
        let total_days = total_days.max(1);

        let student_ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT student_id FROM students ORDER BY student_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut reports = Vec::with_capacity(student_ids.len());
        for student_id in student_ids {
            let present: i64 = tx.query_row(
                "SELECT COUNT(*) FROM attendance WHERE student_id = ?1 AND status = ?2",
                params![student_id, STATUS_PRESENT],
                |row| row.get(0),
            )?;
            let percentage = round2(present as f64 / total_days as f64 * 100.0);
            let remarks = remarks_for(percentage);
            tx.execute(
                "INSERT INTO reports (student_id, attendance_percentage, remarks, generated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![student_id, percentage, remarks, now.to_rfc3339()],
            )?;
            reports.push(Report {
                report_id: tx.last_insert_rowid(),
                student_id,
                attendance_percentage: percentage,
                remarks: remarks.to_string(),
                generated_at: now,
            });
        }
        tx.commit()?;

        tracing::info!(count = reports.len(), total_days, "generated reports");
        Ok(reports)
    }

    pub fn list_reports(&self) -> Result<Vec<Report>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT report_id, student_id, attendance_percentage, remarks, generated_at
             FROM reports ORDER BY generated_at DESC, report_id DESC",
        )?;
        let reports = stmt
            .query_map([], |row| {
                Ok(Report {
                    report_id: row.get(0)?,
                    student_id: row.get(1)?,
                    attendance_percentage: row.get(2)?,
                    remarks: row.get(3)?,
                    generated_at: parse_utc(4, row.get(4)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reports)
    }

    /// Render all reports as CSV, newest first.
    pub fn export_reports_csv(&self) -> Result<String, StoreError> {
        let reports = self.list_reports()?;
        if reports.is_empty() {
            return Err(StoreError::NoReports);
        }
        let mut csv =
            String::from("report_id,student_id,attendance_percentage,remarks,generated_at\n");
        for r in &reports {
            csv.push_str(&format!(
                "{},{},{:.2},{},{}\n",
                r.report_id,
                r.student_id,
                r.attendance_percentage,
                r.remarks,
                r.generated_at.to_rfc3339(),
            ));
        }
        Ok(csv)
    }

    // --- nearest-neighbor lookup ---

    fn nearest_impl(&self, probe: &[f32]) -> Result<Option<Neighbor>, StoreError> {
        let conn = self.lock()?;
        match self.nearest_sql(&conn, probe) {
            Ok(neighbor) => Ok(neighbor),
            Err(e) => {
                tracing::warn!(error = %e, "vector query failed, scanning enrollments directly");
                self.nearest_scan(&conn, probe)
            }
        }
    }

    fn nearest_sql(
        &self,
        conn: &Connection,
        probe: &[f32],
    ) -> Result<Option<Neighbor>, StoreError> {
        let probe_text = vector::encode_vector(probe);
        let neighbor = conn
            .query_row(
                "SELECT student_id, vec_distance(face_embedding, ?1) AS distance
                 FROM students ORDER BY distance, student_id LIMIT 1",
                params![probe_text],
                |row| {
                    Ok(Neighbor {
                        student_id: row.get(0)?,
                        distance: row.get::<_, f64>(1)? as f32,
                    })
                },
            )
            .optional()?;
        Ok(neighbor)
    }

    /// Fallback: pull every enrollment and scan with the shared metric
    /// code. Unparseable rows are skipped, matching how a partial index
    /// outage should degrade.
    fn nearest_scan(
        &self,
        conn: &Connection,
        probe: &[f32],
    ) -> Result<Option<Neighbor>, StoreError> {
        let mut stmt =
            conn.prepare("SELECT student_id, face_embedding FROM students ORDER BY student_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries: Vec<(i64, Vec<f32>)> = Vec::new();
        for row in rows {
            let (student_id, text) = row?;
            match vector::parse_vector(&text) {
                Ok(values) => entries.push((student_id, values)),
                Err(e) => {
                    tracing::warn!(student_id, error = %e, "skipping unparseable enrollment vector");
                }
            }
        }
        Ok(scan_nearest(
            probe,
            entries.iter().map(|(id, v)| (*id, v.as_slice())),
            self.metric,
        ))
    }
}

impl SimilarityIndex for Store {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn nearest(&self, probe: &Embedding) -> Result<Option<Neighbor>, IndexError> {
        if probe.dimension() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: probe.dimension(),
            });
        }
        self.nearest_impl(&probe.values)
            .map_err(|e| IndexError::Unavailable(e.to_string()))
    }
}

/// Register `vec_distance(stored_text, probe_text)` on the connection.
///
/// The function parses both bracketed vectors and measures with the exact
/// [`DistanceMetric::distance`] the fallback scan uses, so the two paths
/// cannot disagree.
fn register_vec_distance(conn: &Connection, metric: DistanceMetric) -> Result<(), StoreError> {
    conn.create_scalar_function(
        "vec_distance",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let stored: String = ctx.get(0)?;
            let probe: String = ctx.get(1)?;
            let a = vector::parse_vector(&stored)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let b = vector::parse_vector(&probe)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(metric.distance(&a, &b) as f64)
        },
    )?;
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

fn remarks_for(percentage: f64) -> &'static str {
    if percentage >= 75.0 {
        "Good"
    } else if percentage >= 50.0 {
        "Average"
    } else {
        "Poor"
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn row_to_student(row: &rusqlite::Row<'_>) -> Result<Student, rusqlite::Error> {
    Ok(Student {
        student_id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone_number: row.get(3)?,
        department: row.get(4)?,
        passport_path: row.get(5)?,
        created_at: parse_utc(6, row.get(6)?)?,
    })
}

fn row_to_attendance(row: &rusqlite::Row<'_>) -> Result<AttendanceRecord, rusqlite::Error> {
    Ok(AttendanceRecord {
        attendance_id: row.get(0)?,
        student_id: row.get(1)?,
        class_id: row.get(2)?,
        date: parse_date(3, row.get(3)?)?,
        in_time: parse_utc(4, row.get(4)?)?,
        out_time: match row.get::<_, Option<String>>(5)? {
            Some(text) => Some(parse_utc(5, text)?),
            None => None,
        },
        status: row.get(6)?,
    })
}

fn parse_utc(idx: usize, text: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_date(idx: usize, text: String) -> Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn parse_time_opt(idx: usize, text: Option<String>) -> Result<Option<NaiveTime>, rusqlite::Error> {
    text.map(|t| NaiveTime::parse_from_str(&t, "%H:%M:%S").map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn conversion_error(idx: usize, e: chrono::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn embedding(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: Some("test".to_string()) }
    }

    fn student(name: &str, email: &str) -> NewStudent {
        NewStudent {
            name: name.to_string(),
            email: email.to_string(),
            ..NewStudent::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store() -> Store {
        Store::open_in_memory(3, DistanceMetric::Cosine).unwrap()
    }

    #[test]
    fn test_register_and_read_your_writes() {
        let store = store();
        let enrolled = store
            .register_student(&student("Ada", "ada@example.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
            .unwrap();

        // A lookup issued right after registration must see the new vector.
        let hit = store.nearest(&embedding(vec![1.0, 0.0, 0.0])).unwrap().unwrap();
        assert_eq!(hit.student_id, enrolled.student_id);
        assert!(hit.distance.abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_email_conflicts_and_store_unchanged() {
        let store = store();
        store
            .register_student(&student("Ada", "ada@example.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
            .unwrap();

        match store.register_student(
            &student("Imposter", "ada@example.edu"),
            &embedding(vec![0.0, 1.0, 0.0]),
            at(1),
        ) {
            Err(StoreError::Conflict(email)) => assert_eq!(email, "ada@example.edu"),
            other => panic!("expected Conflict, got {other:?}"),
        }
        assert_eq!(store.student_count().unwrap(), 1);

        // The original template must still answer lookups.
        let hit = store.nearest(&embedding(vec![1.0, 0.0, 0.0])).unwrap().unwrap();
        assert!(hit.distance.abs() < 1e-6);
    }

    #[test]
    fn test_register_rejects_wrong_dimension() {
        let store = store();
        match store.register_student(&student("Ada", "a@e.edu"), &embedding(vec![1.0, 0.0]), at(0)) {
            Err(StoreError::DimensionMismatch { expected: 3, got: 2 }) => {}
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
        assert_eq!(store.student_count().unwrap(), 0);
    }

    #[test]
    fn test_register_requires_name_and_email() {
        let store = store();
        match store.register_student(&student("", "a@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0)) {
            Err(StoreError::Invalid(_)) => {}
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_nearest_empty_store() {
        let store = store();
        assert!(store.nearest(&embedding(vec![1.0, 0.0, 0.0])).unwrap().is_none());
    }

    #[test]
    fn test_nearest_returns_closest() {
        let store = store();
        let a = store
            .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
            .unwrap();
        store
            .register_student(&student("Bo", "bo@e.edu"), &embedding(vec![0.0, 1.0, 0.0]), at(1))
            .unwrap();

        let hit = store.nearest(&embedding(vec![0.9, 0.1, 0.0])).unwrap().unwrap();
        assert_eq!(hit.student_id, a.student_id);
    }

    #[test]
    fn test_nearest_rejects_wrong_dimension_probe() {
        let store = store();
        match store.nearest(&embedding(vec![1.0, 0.0])) {
            Err(IndexError::DimensionMismatch { expected: 3, got: 2 }) => {}
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_fallback_scan_agrees_with_sql_path() {
        let with_udf = store();
        let without_udf =
            Store::open_in_memory_without_vec_distance(3, DistanceMetric::Cosine).unwrap();

        for (i, values) in [[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.6, 0.8, 0.0]]
            .iter()
            .enumerate()
        {
            let new = student(&format!("s{i}"), &format!("s{i}@e.edu"));
            let e = embedding(values.to_vec());
            with_udf.register_student(&new, &e, at(i as i64)).unwrap();
            without_udf.register_student(&new, &e, at(i as i64)).unwrap();
        }

        let probe = embedding(vec![0.5, 0.85, 0.0]);
        let primary = with_udf.nearest(&probe).unwrap().unwrap();
        let fallback = without_udf.nearest(&probe).unwrap().unwrap();

        assert_eq!(primary.student_id, fallback.student_id);
        assert!((primary.distance - fallback.distance).abs() < 1e-6);
    }

    #[test]
    fn test_vector_persisted_as_bracketed_text() {
        let store = store();
        store
            .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![0.25, -0.5, 1.0]), at(0))
            .unwrap();
        let conn = store.lock().unwrap();
        let text: String =
            conn.query_row("SELECT face_embedding FROM students", [], |row| row.get(0)).unwrap();
        assert_eq!(text, "[0.25,-0.5,1]");
    }

    #[test]
    fn test_get_student_not_found() {
        let store = store();
        match store.get_student(99) {
            Err(StoreError::NotFound(msg)) => assert!(msg.contains("99")),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_list_students_newest_first() {
        let store = store();
        store
            .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
            .unwrap();
        store
            .register_student(&student("Bo", "bo@e.edu"), &embedding(vec![0.0, 1.0, 0.0]), at(60))
            .unwrap();

        let students = store.list_students().unwrap();
        assert_eq!(students.len(), 2);
        assert_eq!(students[0].name, "Bo");
        assert_eq!(students[1].name, "Ada");
    }

    #[test]
    fn test_record_attendance_present() {
        let store = store();
        let ada = store
            .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
            .unwrap();

        let rec = store.record_attendance(ada.student_id, None, at(3600)).unwrap();
        assert_eq!(rec.status, STATUS_PRESENT);
        assert_eq!(rec.student_id, ada.student_id);
        assert_eq!(rec.date, at(3600).date_naive());

        let listed = store.list_attendance(10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attendance_id, rec.attendance_id);
        assert_eq!(listed[0].in_time, at(3600));
    }

    #[test]
    fn test_record_attendance_unknown_student() {
        let store = store();
        match store.record_attendance(42, None, at(0)) {
            Err(StoreError::NotFound(msg)) => assert!(msg.contains("42")),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_attendance_listed_newest_first() {
        let store = store();
        let ada = store
            .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
            .unwrap();
        let first = store.record_attendance(ada.student_id, None, at(100)).unwrap();
        let second = store.record_attendance(ada.student_id, None, at(200)).unwrap();

        let listed = store.list_attendance(10).unwrap();
        assert_eq!(listed[0].attendance_id, second.attendance_id);
        assert_eq!(listed[1].attendance_id, first.attendance_id);
    }

    #[test]
    fn test_faculty_roundtrip_and_conflict() {
        let store = store();
        let f = store
            .create_faculty(&NewFaculty {
                name: "Dr. Gray".to_string(),
                email: Some("gray@e.edu".to_string()),
                role: Some("Lecturer".to_string()),
                ..NewFaculty::default()
            })
            .unwrap();

        let listed = store.list_faculties().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].faculty_id, f.faculty_id);
        assert_eq!(listed[0].role.as_deref(), Some("Lecturer"));

        match store.create_faculty(&NewFaculty {
            name: "Other".to_string(),
            email: Some("gray@e.edu".to_string()),
            ..NewFaculty::default()
        }) {
            Err(StoreError::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_class_roundtrip_with_schedule() {
        let store = store();
        let f = store
            .create_faculty(&NewFaculty { name: "Dr. Gray".to_string(), ..NewFaculty::default() })
            .unwrap();
        let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(10, 30, 0).unwrap();
        store
            .create_class(&NewClass {
                class_name: "Databases".to_string(),
                faculty_id: Some(f.faculty_id),
                schedule_start_time: Some(start),
                schedule_end_time: Some(end),
            })
            .unwrap();

        let classes = store.list_classes().unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].class_name, "Databases");
        assert_eq!(classes[0].schedule_start_time, Some(start));
        assert_eq!(classes[0].schedule_end_time, Some(end));
    }

    #[test]
    fn test_class_with_unknown_faculty() {
        let store = store();
        match store.create_class(&NewClass {
            class_name: "Ghost".to_string(),
            faculty_id: Some(7),
            ..NewClass::default()
        }) {
            Err(StoreError::NotFound(msg)) => assert!(msg.contains("7")),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_generate_reports_percentages_and_remarks() {
        let store = store();
        let ada = store
            .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
            .unwrap();
        let bo = store
            .register_student(&student("Bo", "bo@e.edu"), &embedding(vec![0.0, 1.0, 0.0]), at(1))
            .unwrap();

        // Two distinct dates; Ada present both, Bo present one.
        let day1 = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        store.record_attendance(ada.student_id, None, day1).unwrap();
        store.record_attendance(ada.student_id, None, day2).unwrap();
        store.record_attendance(bo.student_id, None, day1).unwrap();

        let reports = store.generate_reports(at(0)).unwrap();
        assert_eq!(reports.len(), 2);

        let ada_report = reports.iter().find(|r| r.student_id == ada.student_id).unwrap();
        assert_eq!(ada_report.attendance_percentage, 100.0);
        assert_eq!(ada_report.remarks, "Good");

        let bo_report = reports.iter().find(|r| r.student_id == bo.student_id).unwrap();
        assert_eq!(bo_report.attendance_percentage, 50.0);
        assert_eq!(bo_report.remarks, "Average");
    }

    #[test]
    fn test_reports_with_no_attendance_are_zero() {
        let store = store();
        store
            .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
            .unwrap();
        let reports = store.generate_reports(at(0)).unwrap();
        assert_eq!(reports[0].attendance_percentage, 0.0);
        assert_eq!(reports[0].remarks, "Poor");
    }

    #[test]
    fn test_remarks_boundaries() {
        assert_eq!(remarks_for(75.0), "Good");
        assert_eq!(remarks_for(74.99), "Average");
        assert_eq!(remarks_for(50.0), "Average");
        assert_eq!(remarks_for(49.99), "Poor");
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(100.0 / 3.0), 33.33);
        assert_eq!(round2(200.0 / 3.0), 66.67);
    }

    #[test]
    fn test_export_csv_shape() {
        let store = store();
        let ada = store
            .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
            .unwrap();
        let day1 = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        let day3 = Utc.with_ymd_and_hms(2024, 3, 6, 9, 0, 0).unwrap();
        store.record_attendance(ada.student_id, None, day1).unwrap();
        // Bo covers two more dates so the denominator is 3.
        let bo = store
            .register_student(&student("Bo", "bo@e.edu"), &embedding(vec![0.0, 1.0, 0.0]), at(1))
            .unwrap();
        store.record_attendance(bo.student_id, None, day2).unwrap();
        store.record_attendance(bo.student_id, None, day3).unwrap();

        store.generate_reports(at(0)).unwrap();
        let csv = store.export_reports_csv().unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "report_id,student_id,attendance_percentage,remarks,generated_at"
        );
        assert_eq!(lines.count(), 2);
        // 1 of 3 days.
        assert!(csv.contains("33.33"), "csv was: {csv}");
        assert!(csv.contains("66.67"), "csv was: {csv}");
    }

    #[test]
    fn test_export_csv_without_reports() {
        let store = store();
        match store.export_reports_csv() {
            Err(StoreError::NoReports) => {}
            other => panic!("expected NoReports, got {other:?}"),
        }
    }

    #[test]
    fn test_reopen_with_different_dimension_fails() {
        let path = std::env::temp_dir().join(format!("classlens-test-{}.db", uuid::Uuid::new_v4()));
        {
            let store = Store::open(&path, 3, DistanceMetric::Cosine).unwrap();
            store
                .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
                .unwrap();
        }
        match Store::open(&path, 512, DistanceMetric::Cosine) {
            Err(StoreError::DimensionMismatch { expected: 3, got: 512 }) => {}
            other => panic!("expected DimensionMismatch, got {:?}", other.err()),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_reopen_preserves_enrollments() {
        let path = std::env::temp_dir().join(format!("classlens-test-{}.db", uuid::Uuid::new_v4()));
        let id = {
            let store = Store::open(&path, 3, DistanceMetric::Cosine).unwrap();
            store
                .register_student(&student("Ada", "ada@e.edu"), &embedding(vec![1.0, 0.0, 0.0]), at(0))
                .unwrap()
                .student_id
        };
        {
            let store = Store::open(&path, 3, DistanceMetric::Cosine).unwrap();
            let hit = store.nearest(&embedding(vec![1.0, 0.0, 0.0])).unwrap().unwrap();
            assert_eq!(hit.student_id, id);
        }
        let _ = std::fs::remove_file(&path);
    }
}
