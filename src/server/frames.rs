//! JSON documents written to network clients.

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use crate::diff::ChangeSet;
use crate::error::{DeliveryError, ResyncRequired};
use crate::storage::{Snapshot, SnapshotStore};
use crate::sync::CycleFailure;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage<'a> {
    Snapshot(&'a Snapshot),
    ChangeSet(&'a ChangeSet),
    CycleError(&'a CycleFailure),
    ResyncRequired(&'a ResyncRequired),
}

impl WireMessage<'_> {
    fn label(&self) -> &'static str {
        match self {
            WireMessage::Snapshot(_) => "snapshot",
            WireMessage::ChangeSet(_) => "change set",
            WireMessage::CycleError(_) => "cycle error",
            WireMessage::ResyncRequired(_) => "resync notice",
        }
    }

    pub fn encode(&self) -> Result<Utf8Bytes, DeliveryError> {
        encode(self.label(), self)
    }
}

/// Channel-scoped document used by the pub/sub broadcaster.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    pub channel: &'a str,
    pub sequence: Option<u64>,
    pub payload: T,
}

impl<'a, T: Serialize> Envelope<'a, T> {
    pub fn new(channel: &'a str, sequence: Option<u64>, payload: T) -> Self {
        Self {
            channel,
            sequence,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Utf8Bytes, DeliveryError> {
        encode("channel envelope", self)
    }
}

pub fn encode<T: Serialize + ?Sized>(what: &'static str, value: &T) -> Result<Utf8Bytes, DeliveryError> {
    serde_json::to_string(value)
        .map(Utf8Bytes::from)
        .map_err(|source| DeliveryError::Encode { what, source })
}

/// The snapshot document of the latest sequence, encoded once and shared by
/// every greeting and resync until the next commit.
pub struct SnapshotFrames {
    encode: fn(&Snapshot) -> Result<Utf8Bytes, DeliveryError>,
    latest: Mutex<Option<(u64, Utf8Bytes)>>,
}

impl SnapshotFrames {
    pub fn new(encode: fn(&Snapshot) -> Result<Utf8Bytes, DeliveryError>) -> Self {
        Self {
            encode,
            latest: Mutex::new(None),
        }
    }

    /// Plain `{"type":"snapshot", ...}` documents.
    pub fn tagged() -> Self {
        Self::new(|snapshot| WireMessage::Snapshot(snapshot).encode())
    }

    pub fn frame(&self, snapshot: &Snapshot) -> Result<Utf8Bytes, DeliveryError> {
        let sequence = snapshot.sequence();
        if let Some((cached, frame)) = self.latest.lock().as_ref() {
            if *cached == sequence {
                return Ok(frame.clone());
            }
        }

        // encoded without the lock held; an older sequence never replaces a newer one
        let frame = (self.encode)(snapshot)?;
        let mut latest = self.latest.lock();
        if !matches!(latest.as_ref(), Some((cached, _)) if *cached >= sequence) {
            *latest = Some((sequence, frame.clone()));
        }
        Ok(frame)
    }

    /// Encode the store's current snapshot so a greeting made under a
    /// client-set lock finds it ready.
    pub fn warm(&self, store: &SnapshotStore) {
        if let Some(snapshot) = store.current() {
            if let Err(err) = self.frame(&snapshot) {
                tracing::error!(sequence = snapshot.sequence(), "could not encode snapshot: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::row::test_support::row;
    use crate::table::CellValue;
    use chrono::NaiveDate;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn parse(bytes: Utf8Bytes) -> Value {
        serde_json::from_str(bytes.as_str()).unwrap()
    }

    fn sample_row() -> crate::table::Row {
        row(&[
            ("Store ID", CellValue::Text("S001".into())),
            ("Product ID", CellValue::Text("P0001".into())),
            ("Date", CellValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())),
            ("Units Sold", CellValue::Integer(10)),
        ])
    }

    #[test]
    fn snapshot_document_is_tagged() {
        let snapshot = Snapshot::new(4, vec!["Store ID".into()], vec![sample_row()], None);
        let doc = parse(WireMessage::Snapshot(&snapshot).encode().unwrap());

        assert_eq!(doc["type"], "snapshot");
        assert_eq!(doc["sequence"], 4);
        assert_eq!(doc["row_count"], 1);
        assert_eq!(doc["rows"][0]["Units Sold"], 10);
        assert_eq!(doc["rows"][0]["Date"], "2024-01-01");
    }

    #[test]
    fn failures_and_resyncs_carry_their_kind() {
        let failure = CycleFailure::ReadError {
            current_sequence: Some(2),
            message: "gone".into(),
        };
        let doc = parse(WireMessage::CycleError(&failure).encode().unwrap());
        assert_eq!(doc["type"], "cycle_error");
        assert_eq!(doc["kind"], "read_error");
        assert_eq!(doc["current_sequence"], 2);

        let resync = ResyncRequired {
            requested: 1,
            oldest_retained: Some(5),
            current: Some(6),
        };
        let doc = parse(WireMessage::ResyncRequired(&resync).encode().unwrap());
        assert_eq!(doc["type"], "resync_required");
        assert_eq!(doc["oldest_retained"], 5);
    }

    #[test]
    fn envelope_wraps_payload() {
        let changes = ChangeSet::empty(3);
        let doc = parse(
            Envelope::new("data_update", Some(3), WireMessage::ChangeSet(&changes))
                .encode()
                .unwrap(),
        );
        assert_eq!(doc["channel"], "data_update");
        assert_eq!(doc["sequence"], 3);
        assert_eq!(doc["payload"]["type"], "change_set");
        assert_eq!(doc["payload"]["added"], Value::Array(Vec::new()));
    }

    static ENCODED: AtomicUsize = AtomicUsize::new(0);

    fn counting(snapshot: &Snapshot) -> Result<Utf8Bytes, DeliveryError> {
        ENCODED.fetch_add(1, Ordering::SeqCst);
        WireMessage::Snapshot(snapshot).encode()
    }

    #[test]
    fn snapshot_frames_encode_once_per_sequence() {
        let frames = SnapshotFrames::new(counting);
        let first = Snapshot::new(1, vec!["Store ID".into()], vec![sample_row()], None);
        let second = Snapshot::new(2, vec!["Store ID".into()], vec![sample_row()], None);

        for _ in 0..5 {
            assert_eq!(parse(frames.frame(&first).unwrap())["sequence"], 1);
        }
        assert_eq!(ENCODED.load(Ordering::SeqCst), 1);

        assert_eq!(parse(frames.frame(&second).unwrap())["sequence"], 2);
        assert_eq!(parse(frames.frame(&second).unwrap())["sequence"], 2);
        assert_eq!(ENCODED.load(Ordering::SeqCst), 2);

        // a late greeting for the older snapshot does not evict the newer frame
        frames.frame(&first).unwrap();
        frames.frame(&second).unwrap();
        assert_eq!(ENCODED.load(Ordering::SeqCst), 3);
    }
}
