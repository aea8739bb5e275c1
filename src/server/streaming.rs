//! Newline-delimited JSON streaming.
//!
//! The engine runs on a blocking thread and pushes each fragment into a
//! bounded channel; the response body drains it. The engine waits whenever
//! the channel is full, and once the client disconnects the next send fails
//! and generation stops.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::inference::engine::{Deliver, EngineError};
use crate::inference::GenerationResult;

/// Fragments buffered between the engine and the socket.
pub const STREAM_BUFFER: usize = 16;

pub const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Serialize)]
struct StreamError {
    error: String,
}

/// Serialize one value as a JSON line.
pub fn to_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Stream the fragments produced by `run` as NDJSON, each mapped through
/// `map`. An engine error after the response has started is sent as a
/// final `{"error": ...}` line.
pub fn ndjson_response<F, M, T>(run: F, map: M) -> Response
where
    F: FnOnce(&mut Deliver<'_>) -> Result<(), EngineError> + Send + 'static,
    M: Fn(GenerationResult) -> T + Send + 'static,
    T: Serialize,
{
    let (tx, rx) = mpsc::channel::<String>(STREAM_BUFFER);

    tokio::task::spawn_blocking(move || {
        let result = run(&mut |fragment| {
            let line = to_line(&map(fragment))?;
            tx.blocking_send(line)
                .map_err(|_| anyhow::anyhow!("client disconnected"))
        });

        match result {
            Ok(()) => {}
            Err(EngineError::Delivery(e)) => debug!(error = %e, "Stream ended early"),
            Err(e) => {
                warn!(error = %e, "Streaming generation failed");
                let line = to_line(&StreamError {
                    error: e.to_string(),
                })
                .unwrap_or_default();
                let _ = tx.blocking_send(line);
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    ([(header::CONTENT_TYPE, NDJSON)], body).into_response()
}
