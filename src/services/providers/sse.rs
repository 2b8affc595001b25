//! Minimal server-sent-events decoder for upstream streaming replies.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use super::AdapterError;

/// Decode an SSE byte stream into the payloads of its `data:` lines.
///
/// Events are delimited by a blank line; multi-line `data:` fields within one
/// event are joined with newlines per the SSE spec. Comment lines and other
/// fields (`event:`, `id:`, `retry:`) are skipped; the chat providers only
/// ever use `data:`.
pub fn data_events<S, E>(byte_stream: S) -> BoxStream<'static, Result<String, AdapterError>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send,
{
    let stream = async_stream::stream! {
        let mut source = std::pin::pin!(byte_stream);
        let mut buffer = String::new();

        while let Some(chunk) = source.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(AdapterError::Network(e.to_string()));
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(boundary) = find_event_boundary(&buffer) {
                let event = buffer[..boundary.start].to_string();
                buffer.drain(..boundary.end);
                if let Some(data) = extract_data(&event) {
                    yield Ok(data);
                }
            }
        }

        // Trailing event without a closing blank line.
        if let Some(data) = extract_data(&buffer) {
            yield Ok(data);
        }
    };

    Box::pin(stream)
}

struct Boundary {
    /// Bytes belonging to the event itself.
    start: usize,
    /// Bytes to drain including the delimiter.
    end: usize,
}

fn find_event_boundary(buffer: &str) -> Option<Boundary> {
    let lf = buffer.find("\n\n").map(|i| Boundary {
        start: i,
        end: i + 2,
    });
    let crlf = buffer.find("\r\n\r\n").map(|i| Boundary {
        start: i,
        end: i + 4,
    });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn extract_data(event: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in event.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
