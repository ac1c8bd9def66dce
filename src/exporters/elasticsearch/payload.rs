// SPDX-License-Identifier: Apache-2.0

//! Bulk request body.
//!
//! Every event becomes an action line naming the target index and a fresh
//! document id, followed by the document itself. The body ends with an
//! empty line.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::SecondsFormat;
use serde::Serialize;
use uuid::Uuid;

use crate::topology::event::LogEvent;

#[derive(Serialize)]
struct Action<'a> {
    index: IndexAction<'a>,
}

#[derive(Serialize)]
struct IndexAction<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: String,
}

#[derive(Serialize)]
struct Document<'a> {
    message: &'a str,
    #[serde(rename = "@timestamp")]
    timestamp: String,
    pod_name: &'a str,
    namespace: &'a str,
    container_name: &'a str,
    pod_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    container_id: &'a str,
}

impl<'a> Document<'a> {
    fn from_event(event: &'a LogEvent) -> Self {
        Self {
            message: &event.message,
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            pod_name: &event.meta.pod_name,
            namespace: &event.meta.namespace,
            container_name: &event.meta.container_name,
            pod_id: &event.meta.pod_id,
            container_id: &event.meta.container_id,
        }
    }
}

/// Builds the newline delimited body for one batch.
pub fn build_bulk_body(index: &str, events: &[LogEvent]) -> Result<Bytes, serde_json::Error> {
    // rough guess, documents are usually a bit larger than the message
    let estimate: usize = events.iter().map(|e| e.message.len() + 256).sum();
    let mut writer = BytesMut::with_capacity(estimate + 1).writer();

    for event in events {
        let action = Action {
            index: IndexAction {
                index,
                id: Uuid::new_v4().to_string(),
            },
        };
        serde_json::to_writer(&mut writer, &action)?;
        writer.get_mut().put_u8(b'\n');

        serde_json::to_writer(&mut writer, &Document::from_event(event))?;
        writer.get_mut().put_u8(b'\n');
    }
    writer.get_mut().put_u8(b'\n');

    Ok(writer.into_inner().freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailer::metadata::Metadata;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use std::sync::Arc;

    fn event(message: &str, meta: &Arc<Metadata>) -> LogEvent {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 0).unwrap();
        LogEvent::new(message.to_string(), ts, meta.clone())
    }

    fn hierarchical_meta() -> Arc<Metadata> {
        Arc::new(Metadata {
            namespace: "kube-system".to_string(),
            pod_name: "coredns-abc".to_string(),
            container_name: "coredns".to_string(),
            pod_id: "9f2e".to_string(),
            container_id: String::new(),
        })
    }

    #[test]
    fn test_three_events_make_six_lines_and_a_blank() {
        let meta = hierarchical_meta();
        let events = vec![event("a", &meta), event("b", &meta), event("c", &meta)];

        let body = build_bulk_body("logs-2024.03.09", &events).unwrap();
        let text = std::str::from_utf8(&body).unwrap();

        assert!(text.ends_with("\n\n"));
        let lines: Vec<&str> = text.split('\n').collect();
        // six json lines, the blank terminator and the empty tail after it
        assert_eq!(lines.len(), 8);
        assert!(lines[..6].iter().all(|l| !l.is_empty()));
        assert_eq!(lines[6], "");
        assert_eq!(lines[7], "");
    }

    #[test]
    fn test_action_and_document_fields() {
        let meta = hierarchical_meta();
        let body = build_bulk_body("logs-2024.03.09", &[event("hello \"world\"", &meta)]).unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        let mut lines = text.lines();

        let action: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(action["index"]["_index"], "logs-2024.03.09");
        let id = action["index"]["_id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());

        let doc: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(doc["message"], "hello \"world\"");
        assert_eq!(doc["@timestamp"], "2024-03-09T12:30:00.000000000Z");
        assert_eq!(doc["namespace"], "kube-system");
        assert_eq!(doc["pod_name"], "coredns-abc");
        assert_eq!(doc["container_name"], "coredns");
        assert_eq!(doc["pod_id"], "9f2e");
        assert!(doc.get("container_id").is_none());
    }

    #[test]
    fn test_ids_are_unique_per_event() {
        let meta = hierarchical_meta();
        let body = build_bulk_body("i", &[event("a", &meta), event("b", &meta)]).unwrap();
        let text = std::str::from_utf8(&body).unwrap();

        let ids: Vec<String> = text
            .lines()
            .step_by(2)
            .filter(|l| !l.is_empty())
            .map(|l| {
                let v: Value = serde_json::from_str(l).unwrap();
                v["index"]["_id"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_flat_layout_carries_container_id() {
        let meta = Arc::new(Metadata {
            namespace: "default".to_string(),
            pod_name: "web-0".to_string(),
            container_name: "nginx".to_string(),
            pod_id: String::new(),
            container_id: "ab".repeat(32),
        });
        let body = build_bulk_body("i", &[event("x", &meta)]).unwrap();
        let text = std::str::from_utf8(&body).unwrap();

        let doc: Value = serde_json::from_str(text.lines().nth(1).unwrap()).unwrap();
        assert_eq!(doc["container_id"], "ab".repeat(32));
        assert_eq!(doc["pod_id"], "");
    }
}
