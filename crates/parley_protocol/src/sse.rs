#![forbid(unsafe_code)]

//! Server-sent-events framing for the event stream.
//!
//! Each frame is `event: <kind>\ndata: <envelope json>\n\n`. Frames without a
//! `data:` line (keepalive comments) are skipped by the decoder.

use bytes::BytesMut;
use thiserror::Error;

use crate::event::EventEnvelope;

/// Default maximum encoded frame size.
pub const DEFAULT_MAX_EVENT_SIZE: usize = 256 * 1024;

const FRAME_END: &[u8] = b"\n\n";

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("event exceeds maximum size: len={len} max={max}")]
	EventTooLarge {
		len: usize,
		max: usize,
	},

	#[error("event json error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("malformed event frame: {0}")]
	Malformed(String),
}

/// Encode an envelope into one SSE frame.
pub fn encode_event(env: &EventEnvelope, max_event_size: usize) -> Result<Vec<u8>, FramingError> {
	let json = serde_json::to_string(env)?;
	let kind = env.kind();

	let mut out = Vec::with_capacity(json.len() + 32);
	out.extend_from_slice(b"event: ");
	out.extend_from_slice(kind.as_str().as_bytes());
	out.extend_from_slice(b"\ndata: ");
	out.extend_from_slice(json.as_bytes());
	out.extend_from_slice(FRAME_END);

	if out.len() > max_event_size {
		return Err(FramingError::EventTooLarge {
			len: out.len(),
			max: max_event_size,
		});
	}
	Ok(out)
}

/// Comment frame used to keep idle streams open.
pub fn encode_keepalive() -> Vec<u8> {
	b": keepalive\n\n".to_vec()
}

/// Try to decode the next envelope from a growable buffer.
///
/// Returns `Ok(None)` until a complete data-bearing frame is buffered.
pub fn try_decode_event_from_buffer(
	buf: &mut BytesMut,
	max_event_size: usize,
) -> Result<Option<EventEnvelope>, FramingError> {
	loop {
		let Some(end) = find_frame_end(buf) else {
			if buf.len() > max_event_size {
				return Err(FramingError::EventTooLarge {
					len: buf.len(),
					max: max_event_size,
				});
			}
			return Ok(None);
		};

		let frame = buf.split_to(end + FRAME_END.len());
		if frame.len() > max_event_size {
			return Err(FramingError::EventTooLarge {
				len: frame.len(),
				max: max_event_size,
			});
		}

		let text = std::str::from_utf8(&frame[..end]).map_err(|e| FramingError::Malformed(e.to_string()))?;

		let mut data = String::new();
		for line in text.lines() {
			let line = line.strip_suffix('\r').unwrap_or(line);
			if let Some(rest) = line.strip_prefix("data:") {
				if !data.is_empty() {
					data.push('\n');
				}
				data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
			}
		}

		if data.is_empty() {
			continue;
		}

		let env: EventEnvelope = serde_json::from_str(&data)?;
		return Ok(Some(env));
	}
}

fn find_frame_end(buf: &[u8]) -> Option<usize> {
	buf.windows(FRAME_END.len()).position(|w| w == FRAME_END)
}
