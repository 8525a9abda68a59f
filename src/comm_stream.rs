//! # Client communication stream.
//!
//! Newline-delimited JSON in both directions over stdio. Inbound frames are
//! parsed by the supervisor's listener; outbound change deltas flow from the
//! store through a channel into a single writer task that owns stdout.
//! Logging goes to stderr so the frame stream stays clean.

use async_channel::{Receiver, Sender};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::store::DeltaFrame;
use crate::task::Task;

/// Frames the client sends to the core.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundFrame {
    /// A client task to run optimistically and then against the server.
    TaskQueued { task: Task },
    /// The client wants these message bodies fetched now.
    NeedBodies { ids: Vec<String> },
}

/// Channel the store publishes change deltas into.
pub fn delta_channel() -> (Sender<DeltaFrame>, Receiver<DeltaFrame>) {
    async_channel::unbounded()
}

/// Spawns the single outbound writer: one JSON frame per line on stdout.
pub fn spawn_stdout_writer(deltas: Receiver<DeltaFrame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(frame) = deltas.recv().await {
            match serde_json::to_string(&frame) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("could not serialize delta: {err:#}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    #[test]
    fn test_parse_task_queued() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"type": "task-queued",
                "task": {"id": "t1", "__cls": "MarkUnread", "accountId": "a1", "ids": ["m1"]}}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::TaskQueued { task } => {
                assert!(matches!(task.kind, TaskKind::MarkUnread { .. }));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_need_bodies() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type": "need-bodies", "ids": ["m1", "m2"]}"#).unwrap();
        match frame {
            InboundFrame::NeedBodies { ids } => assert_eq!(ids, vec!["m1", "m2"]),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_delta_frame_shape() {
        let frame = DeltaFrame {
            kind: "delta",
            object_class: "Message",
            objects: vec![serde_json::json!({"id": "m1"})],
            op: crate::store::DeltaOp::Unpersist,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "delta");
        assert_eq!(json["objectClass"], "Message");
        assert_eq!(json["op"], "unpersist");
    }
}
