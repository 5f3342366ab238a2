//! SSE plumbing shared by HTTP adapters.
//!
//! The pattern: receive a `reqwest::Response`, buffer chunks, split on
//! `\n\n`, extract `data:` payloads, and feed each payload to an
//! adapter-specific parser returning `Vec<Result<StreamEvent>>`.

use crewd_domain::error::{Error, Result};
use crewd_domain::stream::{BoxStream, StreamEvent};

/// Extract complete `data:` payloads from an SSE buffer.
///
/// Events are delimited by `\n\n`; only `data:` lines matter. The buffer
/// is drained in place and any trailing partial event remains for the
/// next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2); // remove the \n\n delimiter

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Build a [`BoxStream`] from an SSE `reqwest::Response` and an
/// adapter-specific parser closure.
///
/// The closure is `FnMut` because adapters keep mutable state across
/// payloads (tool-call assembly). The stream buffers chunks, drains
/// complete events, flushes the tail when the body closes, and emits a
/// fallback `Stop` if the parser never produced one.
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut stop_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    for data in drain_data_lines(&mut buffer) {
                        for event in parse_data(&data) {
                            if matches!(&event, Ok(StreamEvent::Stop)) {
                                stop_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    // Body closed; flush any remaining partial event.
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for event in parse_data(&data) {
                                if matches!(&event, Ok(StreamEvent::Stop)) {
                                    stop_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(Error::Http(format!("stream read failed: {e}")));
                    break;
                }
            }
        }

        if !stop_emitted {
            yield Ok(StreamEvent::Stop);
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
