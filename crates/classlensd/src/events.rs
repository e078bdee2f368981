use chrono::{DateTime, NaiveDate, Utc};
use classlens_store::AttendanceRecord;
use serde::Serialize;
use tokio::sync::broadcast;

/// Buffered events per subscriber before the feed starts dropping.
const FEED_CAPACITY: usize = 64;

/// One accepted match, as published on the attendance feed.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEvent {
    pub attendance_id: i64,
    pub student_id: i64,
    pub class_id: Option<i64>,
    pub date: NaiveDate,
    pub in_time: DateTime<Utc>,
    pub status: String,
}

impl AttendanceEvent {
    pub fn from_record(record: &AttendanceRecord) -> Self {
        Self {
            attendance_id: record.attendance_id,
            student_id: record.student_id,
            class_id: record.class_id,
            date: record.date,
            in_time: record.in_time,
            status: record.status.clone(),
        }
    }
}

/// Fan-out feed for attendance events.
///
/// Publishing never blocks the pipeline. A slow subscriber loses old
/// events instead of backing up the publisher, and a feed with no
/// subscribers at all is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AttendanceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: AttendanceEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("attendance event dropped, no feed subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttendanceEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(attendance_id: i64) -> AttendanceEvent {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        AttendanceEvent {
            attendance_id,
            student_id: 7,
            class_id: None,
            date: now.date_naive(),
            in_time: now,
            status: "Present".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(event(1));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.attendance_id, 1);
        assert_eq!(received.status, "Present");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(event(1));
    }

    #[tokio::test]
    async fn test_all_subscribers_see_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(event(1));
        bus.publish(event(2));

        assert_eq!(a.recv().await.unwrap().attendance_id, 1);
        assert_eq!(a.recv().await.unwrap().attendance_id, 2);
        assert_eq!(b.recv().await.unwrap().attendance_id, 1);
        assert_eq!(b.recv().await.unwrap().attendance_id, 2);
    }

    #[test]
    fn test_event_payload_shape() {
        let payload = serde_json::to_value(event(5)).unwrap();
        assert_eq!(payload["attendance_id"], 5);
        assert_eq!(payload["student_id"], 7);
        assert!(payload["class_id"].is_null());
        assert_eq!(payload["status"], "Present");
    }
}
