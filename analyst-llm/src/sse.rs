use crate::error::{LlmError, Result};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;

/// One server-sent event frame. `event` defaults to `"message"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: String,
}

pub(crate) fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseFrame>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(frame) = take_frame(&mut buffer) {
                    match frame {
                        Some(frame) => return Some((Ok(frame), (stream, buffer))),
                        None => continue,
                    }
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

/// Pops one blank-line-terminated block off `buffer`.
///
/// Outer `None`: no complete block buffered yet. Inner `None`: the block held
/// neither an event name nor data (comments, keep-alives).
fn take_frame(buffer: &mut String) -> Option<Option<SseFrame>> {
    let idx = buffer.find("\n\n")?;
    let raw = buffer[..idx].to_string();
    buffer.drain(..idx + 2);

    let mut event = String::new();
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }

    if event.is_empty() && data_lines.is_empty() {
        return Some(None);
    }
    if event.is_empty() {
        event = "message".to_string();
    }
    Some(Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    }))
}
