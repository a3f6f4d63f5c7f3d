#![forbid(unsafe_code)]

pub mod api;
pub mod event;
pub mod sse;

pub use event::{ChatEvent, EventEnvelope, EventKind, MembershipChange, MessageNotice, SenderInfo};
pub use sse::{DEFAULT_MAX_EVENT_SIZE, FramingError, encode_event, encode_keepalive, try_decode_event_from_buffer};

/// Protocol version constants.
pub mod version {
	/// Current API version, carried in the access token prefix.
	pub const API_VERSION: u32 = 1;
}
