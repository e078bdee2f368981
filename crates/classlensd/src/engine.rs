use crate::config::Config;
use crate::events::{AttendanceEvent, EventBus};
use chrono::Utc;
use classlens_core::detector::DetectorError;
use classlens_core::encoder::{EncoderError, ImageEncoder};
use classlens_core::matcher;
use classlens_core::{ClipEncoder, FaceDetector, FacePipeline, MatchError, MatchResult};
use classlens_store::{AttendanceRecord, NewStudent, Store, StoreError, Student};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("no decision within {0} seconds")]
    Timeout(u64),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Outcome of a mark-attendance request.
#[derive(Debug)]
pub enum MarkOutcome {
    /// Nearest enrollment was beyond the threshold, or the roster is empty.
    NoMatch,
    /// Attendance was recorded for the matched student.
    Marked {
        record: AttendanceRecord,
        distance: f32,
    },
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        profile: NewStudent,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Student, EngineError>>,
    },
    Mark {
        class_id: Option<i64>,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<MarkOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Request enrollment: detect the face in `image`, embed it, store the
    /// profile and template together.
    pub async fn register(
        &self,
        profile: NewStudent,
        image: Vec<u8>,
    ) -> Result<Student, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.call(EngineRequest::Register { profile, image, reply: reply_tx }, reply_rx)
            .await
    }

    /// Request a match attempt: detect, embed, look up, and on an accepted
    /// match record attendance and publish it on the feed.
    pub async fn mark(
        &self,
        class_id: Option<i64>,
        image: Vec<u8>,
    ) -> Result<MarkOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.call(EngineRequest::Mark { class_id, image, reply: reply_tx }, reply_rx)
            .await
    }

    /// Send a request and wait for the reply, under one deadline covering
    /// both queue admission and the reply. Timing out abandons the attempt;
    /// work the engine already committed (a recorded mark, a stored
    /// enrollment) stays committed.
    async fn call<T>(
        &self,
        request: EngineRequest,
        reply_rx: oneshot::Receiver<Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let exchange = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.timeout.as_secs())),
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the cascade and the encoder model, then opens the store with the
/// encoder's vector width so a model swap with a different width refuses
/// to start. Requests run strictly one at a time; the store is only locked
/// for its own query, never across detection or embedding.
pub fn spawn_engine(
    config: &Config,
    events: EventBus,
) -> Result<(EngineHandle, Arc<Store>), EngineError> {
    let cascade_path = config.cascade_path();
    let detector = FaceDetector::load(&cascade_path, config.detector)?;
    tracing::info!(path = %cascade_path, "face cascade loaded");

    let encoder_path = config.encoder_model_path();
    let encoder = ClipEncoder::load(&encoder_path)?;
    tracing::info!(
        path = %encoder_path,
        dimension = encoder.dimension(),
        model = encoder.model_version(),
        "encoder loaded"
    );

    let store = Arc::new(Store::open(
        &config.db_path,
        encoder.dimension(),
        config.policy.metric,
    )?);

    let mut pipeline = FacePipeline::new(detector, encoder, config.policy);
    let passports_dir = config.passports_dir();
    let engine_store = Arc::clone(&store);

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("classlens-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register { profile, image, reply } => {
                        let result = run_register(
                            &mut pipeline,
                            &engine_store,
                            &passports_dir,
                            profile,
                            &image,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::Mark { class_id, image, reply } => {
                        let result =
                            run_mark(&mut pipeline, &engine_store, &events, class_id, &image);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    let timeout = Duration::from_secs(config.decision_timeout_secs);
    Ok((EngineHandle { tx, timeout }, store))
}

/// Decode, detect, embed, then store profile and template in one step.
/// The saved photo is removed again if the store insert fails, so a
/// rejected enrollment leaves nothing behind.
fn run_register<E: ImageEncoder>(
    pipeline: &mut FacePipeline<E>,
    store: &Store,
    passports_dir: &Path,
    mut profile: NewStudent,
    image_bytes: &[u8],
) -> Result<Student, EngineError> {
    let image = matcher::decode_image(image_bytes)?;
    let (face, embedding) = pipeline.embed_primary_face(&image)?;
    tracing::debug!(
        x = face.x,
        y = face.y,
        width = face.width,
        height = face.height,
        "face accepted for enrollment"
    );

    let passport_path = write_passport(passports_dir, image_bytes);
    profile.passport_path = passport_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned());

    match store.register_student(&profile, &embedding, Utc::now()) {
        Ok(student) => Ok(student),
        Err(e) => {
            if let Some(path) = passport_path {
                let _ = std::fs::remove_file(path);
            }
            Err(e.into())
        }
    }
}

/// Full match attempt. An accepted match records attendance and publishes
/// the event; a rejected one changes nothing.
fn run_mark<E: ImageEncoder>(
    pipeline: &mut FacePipeline<E>,
    store: &Store,
    events: &EventBus,
    class_id: Option<i64>,
    image_bytes: &[u8],
) -> Result<MarkOutcome, EngineError> {
    match pipeline.match_bytes(image_bytes, store)? {
        MatchResult::NoMatch => Ok(MarkOutcome::NoMatch),
        MatchResult::Matched { student_id, distance } => {
            let record = store.record_attendance(student_id, class_id, Utc::now())?;
            events.publish(AttendanceEvent::from_record(&record));
            tracing::info!(
                student_id,
                distance,
                attendance_id = record.attendance_id,
                "attendance marked"
            );
            Ok(MarkOutcome::Marked { record, distance })
        }
    }
}

/// Save the uploaded photo under the passports directory. Failure only
/// logs; the photo is a convenience copy, not part of the enrollment
/// contract.
fn write_passport(dir: &Path, bytes: &[u8]) -> Option<PathBuf> {
    let ext = image::guess_format(bytes)
        .map(|f| f.extensions_str().first().copied().unwrap_or("img"))
        .unwrap_or("img");
    let path = dir.join(format!("student-{}.{ext}", uuid::Uuid::new_v4()));
    match std::fs::write(&path, bytes) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "passport photo not saved");
            None
        }
    }
}
