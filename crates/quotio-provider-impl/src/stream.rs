use tokio::sync::mpsc;

use quotio_protocol::sse::SseStreamParser;
use quotio_provider_core::{ChunkStream, ExecuteError};

/// Wrap a raw byte stream and turn in-band SSE `error` events into error
/// chunks, so the pool counts them as a failed attempt instead of passing
/// them through to the client.
pub fn guard_sse_errors(mut upstream: ChunkStream) -> ChunkStream {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut parser = SseStreamParser::new();
        while let Some(chunk) = upstream.recv().await {
            match chunk {
                Ok(bytes) => {
                    let events = parser.feed(&bytes);
                    if let Some(event) = events.iter().find(|event| event.is_error()) {
                        let _ = tx
                            .send(Err(ExecuteError::status_error(
                                502,
                                format!("upstream error event: {}", event.data),
                                Vec::new(),
                            )))
                            .await;
                        return;
                    }
                    if tx.send(Ok(bytes)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
        if let Some(event) = parser.finish().iter().find(|event| event.is_error()) {
            let _ = tx
                .send(Err(ExecuteError::status_error(
                    502,
                    format!("upstream error event: {}", event.data),
                    Vec::new(),
                )))
                .await;
        }
    });
    rx
}
