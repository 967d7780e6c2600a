//! Stream events emitted by `MainRuntime::run_stream`.

use serde::{Deserialize, Serialize};

/// One event on a streaming run.
///
/// The stream ends with either `Error` or `Terminal`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text output.
    ContentBlockDelta { text: String },
    /// The run failed; `payload` carries the provider's error object.
    Error { payload: serde_json::Value },
    /// The run finished cleanly.
    Terminal,
}

impl StreamEvent {
    /// Text carried by a delta event, if any.
    pub fn delta_text(&self) -> Option<&str> {
        match self {
            StreamEvent::ContentBlockDelta { text } => Some(text),
            _ => None,
        }
    }

    /// Whether this event ends the stream.
    pub fn is_final(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Terminal)
    }
}

/// Drain a streaming run into its final text.
///
/// Deltas concatenate; an error event fails the drain; `Terminal` (or the
/// channel closing) ends it.
pub async fn drain(mut rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> anyhow::Result<String> {
    let mut out = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::ContentBlockDelta { text } => out.push_str(&text),
            StreamEvent::Error { payload } => anyhow::bail!("stream error: {payload}"),
            StreamEvent::Terminal => break,
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delta_serialization() {
        let event = StreamEvent::ContentBlockDelta {
            text: "hel".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "content_block_delta");
        assert_eq!(json["text"], "hel");
    }

    #[test]
    fn test_terminal_is_final() {
        assert!(StreamEvent::Terminal.is_final());
        assert!(StreamEvent::Error { payload: json!({}) }.is_final());
        assert!(!StreamEvent::ContentBlockDelta { text: "x".into() }.is_final());
    }

    #[test]
    fn test_delta_text() {
        let event = StreamEvent::ContentBlockDelta { text: "hi".into() };
        assert_eq!(event.delta_text(), Some("hi"));
        assert_eq!(StreamEvent::Terminal.delta_text(), None);
    }

    #[tokio::test]
    async fn test_drain_concatenates_deltas() {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        for part in ["Hel", "lo, ", "world"] {
            tx.send(StreamEvent::ContentBlockDelta { text: part.into() })
                .await
                .unwrap();
        }
        tx.send(StreamEvent::Terminal).await.unwrap();

        assert_eq!(drain(rx).await.unwrap(), "Hello, world");
    }

    #[tokio::test]
    async fn test_drain_fails_on_error_event() {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(StreamEvent::ContentBlockDelta { text: "par".into() })
            .await
            .unwrap();
        tx.send(StreamEvent::Error {
            payload: json!({"message": "overloaded"}),
        })
        .await
        .unwrap();

        let err = drain(rx).await.unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn test_drain_ends_when_channel_closes() {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(StreamEvent::ContentBlockDelta { text: "done".into() })
            .await
            .unwrap();
        drop(tx);

        assert_eq!(drain(rx).await.unwrap(), "done");
    }
}
