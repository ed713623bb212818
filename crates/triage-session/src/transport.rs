//! Event source abstraction over the server-push transport
//!
//! The session controller consumes an abstract [`EventSource`] so tests can
//! substitute scripted streams. The concrete transport is a long-lived HTTP
//! response carrying server-sent events: one POST per run, one frame per
//! envelope. Dropping the frame stream closes the connection; transport
//! failures arrive as `Err` items on the stream.

use std::pin::Pin;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event as SseEvent, EventSource as SseConnection};
use serde::Serialize;
use tokio_stream::Stream;

use crate::error::{Error, Result};

/// One server-pushed frame: an event name and its raw JSON body
#[derive(Debug, Clone)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

/// A stream of raw frames from the server
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Request parameters for opening a stream
#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    /// Conversation identifier; generated when the caller does not supply one
    pub thread_id: String,
    /// Natural-language query from the user
    pub message: String,
    /// Arbitrary JSON forwarded to the experts
    pub input: serde_json::Value,
}

impl QueryRequest {
    /// Create a request with a fresh conversation id
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            thread_id: uuid::Uuid::new_v4().simple().to_string(),
            message: message.into(),
            input: serde_json::Value::Object(Default::default()),
        }
    }

    /// Scope the request to an existing conversation id
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }
}

/// Transport for receiving a conversation's event stream
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open the stream for one run
    async fn open(&self, request: &QueryRequest) -> Result<FrameStream>;
}

/// SSE transport: POSTs the query and reads the long-lived response
pub struct SseEventSource {
    client: reqwest::Client,
    base_url: String,
}

impl SseEventSource {
    /// Create a transport against a backend base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn open(&self, request: &QueryRequest) -> Result<FrameStream> {
        let url = format!("{}/v1/stream", self.base_url.trim_end_matches('/'));
        tracing::debug!(%url, thread_id = %request.thread_id, "opening event stream");

        let request_builder = self
            .client
            .post(&url)
            .header("accept", "text/event-stream")
            .json(request);

        let mut connection = SseConnection::new(request_builder)
            .map_err(|e| Error::transport(format!("failed to create event source: {e}")))?;

        Ok(Box::pin(stream! {
            while let Some(event) = connection.next().await {
                match event {
                    Ok(SseEvent::Open) => {}
                    Ok(SseEvent::Message(message)) => {
                        yield Ok(Frame {
                            event: message.event,
                            data: message.data,
                        });
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        yield Err(Error::transport(e));
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_request_generates_thread_id() {
        let a = QueryRequest::new("analyze the dataset");
        let b = QueryRequest::new("analyze the dataset");
        assert!(!a.thread_id.is_empty());
        assert_ne!(a.thread_id, b.thread_id);
    }

    #[test]
    fn test_query_request_with_thread_id() {
        let request = QueryRequest::new("q").with_thread_id("t-42");
        assert_eq!(request.thread_id, "t-42");
    }

    #[test]
    fn test_query_request_serializes_wire_fields() {
        let request = QueryRequest::new("what is risky here?").with_thread_id("t-1");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["thread_id"], "t-1");
        assert_eq!(json["message"], "what is risky here?");
        assert!(json["input"].is_object());
    }
}
