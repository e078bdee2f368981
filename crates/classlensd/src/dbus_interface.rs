use crate::engine::{EngineError, EngineHandle, MarkOutcome};
use chrono::NaiveTime;
use classlens_core::detector::DetectorError;
use classlens_core::index::SimilarityIndex;
use classlens_core::types::MatchPolicy;
use classlens_core::MatchError;
use classlens_store::{NewClass, NewFaculty, NewStudent, Store, StoreError};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

/// Well-known bus name the daemon claims.
pub const BUS_NAME: &str = "org.classlens.Attendance1";
/// Object path the interface is served at.
pub const OBJECT_PATH: &str = "/org/classlens/Attendance1";

/// Errors surfaced to D-Bus callers, one name per failure class.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.classlens.Attendance1.Error")]
pub enum ServiceError {
    #[zbus(error)]
    ZBus(zbus::Error),
    /// The submitted bytes could not be decoded as an image.
    ImageDecode(String),
    /// The detector found no face in the image.
    NoFaceDetected(String),
    /// The embedding stage failed.
    Embedding(String),
    /// A uniqueness rule was violated (duplicate email).
    Conflict(String),
    /// A referenced record does not exist.
    NotFound(String),
    /// A request argument was rejected.
    Invalid(String),
    /// Export requested with no generated reports.
    NoReports(String),
    /// The operation did not finish within the configured timeout.
    Timeout(String),
    /// Anything else; details are in the daemon log.
    Internal(String),
}

/// D-Bus interface for the ClassLens attendance daemon.
///
/// Bus name: org.classlens.Attendance1
/// Object path: /org/classlens/Attendance1
///
/// Methods return JSON strings; `ExportReportsCsv` returns raw CSV. The
/// `AttendanceMarked` signal carries the same payload the attendance feed
/// publishes.
pub struct AttendanceService {
    engine: EngineHandle,
    store: Arc<Store>,
    policy: MatchPolicy,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, store: Arc<Store>, policy: MatchPolicy) -> Self {
        Self { engine, store, policy }
    }

    /// Run a store call off the async executor. Queries are short, but
    /// they still hold the connection mutex and touch disk.
    async fn with_store<T, F>(&self, op: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?
            .map_err(map_store)
    }
}

#[interface(name = "org.classlens.Attendance1")]
impl AttendanceService {
    /// Enroll a student: profile fields plus one face photo. Empty
    /// `phone_number` or `department` mean not provided.
    async fn register_student(
        &self,
        name: &str,
        email: &str,
        phone_number: &str,
        department: &str,
        image: Vec<u8>,
    ) -> Result<String, ServiceError> {
        tracing::info!(email, "register_student requested");
        let profile = NewStudent {
            name: name.trim().to_string(),
            email: email.trim().to_string(),
            phone_number: optional(phone_number),
            department: optional(department),
            passport_path: None,
        };
        let student = self.engine.register(profile, image).await.map_err(map_engine)?;
        to_json(&student)
    }

    /// Run a match attempt. `class_id` 0 means no class context. An
    /// accepted match records attendance and emits `AttendanceMarked`.
    async fn mark_attendance(&self, class_id: i64, image: Vec<u8>) -> Result<String, ServiceError> {
        tracing::info!(class_id, "mark_attendance requested");
        let class_id = (class_id > 0).then_some(class_id);
        match self.engine.mark(class_id, image).await.map_err(map_engine)? {
            MarkOutcome::NoMatch => Ok(serde_json::json!({
                "matched": false,
                "message": "Match Not Found",
            })
            .to_string()),
            MarkOutcome::Marked { record, distance } => Ok(serde_json::json!({
                "matched": true,
                "message": "Matched",
                "distance": distance,
                "attendance": record,
            })
            .to_string()),
        }
    }

    /// List enrolled students, newest first.
    async fn list_students(&self) -> Result<String, ServiceError> {
        let students = self.with_store(|s| s.list_students()).await?;
        to_json(&students)
    }

    /// Fetch one student profile by id.
    async fn get_student(&self, student_id: i64) -> Result<String, ServiceError> {
        let student = self.with_store(move |s| s.get_student(student_id)).await?;
        to_json(&student)
    }

    /// List attendance records, most recent first, up to `limit`.
    async fn list_attendance(&self, limit: u32) -> Result<String, ServiceError> {
        let records = self.with_store(move |s| s.list_attendance(limit)).await?;
        to_json(&records)
    }

    /// Create a faculty member. Empty optional fields mean not provided.
    async fn create_faculty(
        &self,
        name: &str,
        email: &str,
        phone_number: &str,
        role: &str,
    ) -> Result<String, ServiceError> {
        tracing::info!(name, "create_faculty requested");
        let new = NewFaculty {
            name: name.trim().to_string(),
            email: optional(email),
            phone_number: optional(phone_number),
            role: optional(role),
        };
        let faculty = self.with_store(move |s| s.create_faculty(&new)).await?;
        to_json(&faculty)
    }

    async fn list_faculties(&self) -> Result<String, ServiceError> {
        let faculties = self.with_store(|s| s.list_faculties()).await?;
        to_json(&faculties)
    }

    /// Create a class. `faculty_id` 0 means unassigned; schedule times are
    /// `HH:MM:SS` or empty.
    async fn create_class(
        &self,
        class_name: &str,
        faculty_id: i64,
        schedule_start: &str,
        schedule_end: &str,
    ) -> Result<String, ServiceError> {
        tracing::info!(class_name, "create_class requested");
        let new = NewClass {
            class_name: class_name.trim().to_string(),
            faculty_id: (faculty_id > 0).then_some(faculty_id),
            schedule_start_time: parse_schedule_time(schedule_start)?,
            schedule_end_time: parse_schedule_time(schedule_end)?,
        };
        let class = self.with_store(move |s| s.create_class(&new)).await?;
        to_json(&class)
    }

    async fn list_classes(&self) -> Result<String, ServiceError> {
        let classes = self.with_store(|s| s.list_classes()).await?;
        to_json(&classes)
    }

    /// Generate a fresh attendance report per student and return the batch.
    async fn generate_reports(&self) -> Result<String, ServiceError> {
        tracing::info!("generate_reports requested");
        let now = chrono::Utc::now();
        let reports = self.with_store(move |s| s.generate_reports(now)).await?;
        to_json(&reports)
    }

    /// List all generated reports, newest first.
    async fn list_reports(&self) -> Result<String, ServiceError> {
        let reports = self.with_store(|s| s.list_reports()).await?;
        to_json(&reports)
    }

    /// All reports as CSV. Fails with NoReports when none were generated.
    async fn export_reports_csv(&self) -> Result<String, ServiceError> {
        self.with_store(|s| s.export_reports_csv()).await
    }

    /// Daemon status information.
    async fn status(&self) -> Result<String, ServiceError> {
        let students = self.with_store(|s| s.student_count()).await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "students": students,
            "embedding_dimension": self.store.dimension(),
            "distance_metric": self.policy.metric.to_string(),
            "match_threshold": self.policy.threshold,
        })
        .to_string())
    }

    /// Emitted after every recorded match. Payload is the attendance event
    /// as JSON.
    #[zbus(signal)]
    pub async fn attendance_marked(
        emitter: &SignalEmitter<'_>,
        payload: &str,
    ) -> zbus::Result<()>;
}

fn optional(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_schedule_time(text: &str) -> Result<Option<NaiveTime>, ServiceError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .map(Some)
        .map_err(|_| ServiceError::Invalid(format!("bad time '{trimmed}', expected HH:MM:SS")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ServiceError> {
    serde_json::to_string(value).map_err(|e| ServiceError::Internal(e.to_string()))
}

fn map_engine(err: EngineError) -> ServiceError {
    match err {
        EngineError::Match(MatchError::ImageDecode(e)) => ServiceError::ImageDecode(e.to_string()),
        EngineError::Match(MatchError::Detector(DetectorError::NoFaceDetected)) => {
            ServiceError::NoFaceDetected("no face detected in image".to_string())
        }
        EngineError::Match(MatchError::Encoder(e)) => ServiceError::Embedding(e.to_string()),
        EngineError::Match(e) => ServiceError::Internal(e.to_string()),
        EngineError::Store(e) => map_store(e),
        EngineError::Encoder(e) => ServiceError::Embedding(e.to_string()),
        EngineError::Timeout(secs) => {
            ServiceError::Timeout(format!("no decision within {secs} seconds"))
        }
        other => ServiceError::Internal(other.to_string()),
    }
}

fn map_store(err: StoreError) -> ServiceError {
    match err {
        StoreError::Conflict(email) => {
            ServiceError::Conflict(format!("already registered: {email}"))
        }
        StoreError::NotFound(what) => ServiceError::NotFound(what),
        StoreError::Invalid(msg) => ServiceError::Invalid(msg),
        StoreError::NoReports => ServiceError::NoReports("no reports to export".to_string()),
        StoreError::DimensionMismatch { .. } => ServiceError::Invalid(err.to_string()),
        other => ServiceError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_blank_is_none() {
        assert_eq!(optional(""), None);
        assert_eq!(optional("   "), None);
        assert_eq!(optional(" CS "), Some("CS".to_string()));
    }

    #[test]
    fn test_parse_schedule_time() {
        assert_eq!(parse_schedule_time("").unwrap(), None);
        assert_eq!(
            parse_schedule_time("09:30:00").unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0)
        );
        assert!(matches!(
            parse_schedule_time("9h30"),
            Err(ServiceError::Invalid(_))
        ));
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            map_store(StoreError::Conflict("a@e.edu".to_string())),
            ServiceError::Conflict(_)
        ));
        assert!(matches!(
            map_store(StoreError::NotFound("student 9".to_string())),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(map_store(StoreError::NoReports), ServiceError::NoReports(_)));
        assert!(matches!(
            map_store(StoreError::Unavailable("poisoned".to_string())),
            ServiceError::Internal(_)
        ));
    }

    #[test]
    fn test_engine_error_mapping() {
        assert!(matches!(
            map_engine(EngineError::Match(MatchError::Detector(DetectorError::NoFaceDetected))),
            ServiceError::NoFaceDetected(_)
        ));
        assert!(matches!(
            map_engine(EngineError::Timeout(10)),
            ServiceError::Timeout(_)
        ));
        assert!(matches!(
            map_engine(EngineError::ChannelClosed),
            ServiceError::Internal(_)
        ));
    }
}
