#![forbid(unsafe_code)]

//! Client side of the chat: optimistic sends reconciled against canonical
//! events, the chat-list view, and the channel connection manager.

use std::time::Duration;

use parley_domain::ChatError;
use parley_protocol::FramingError;
use parley_util::endpoint::HttpEndpoint;

pub mod api;
pub mod connection;
pub mod pipeline;
pub mod session;
pub mod sidebar;

pub use api::{ChatApi, HttpChatApi, SseTransport};
pub use connection::{ChannelTransport, ConnectionEvent, ConnectionManager, ReconnectPolicy};
pub use pipeline::{DeliveryStatus, EditDraft, MessagePipeline, MessageRecord, Reconciled};
pub use session::{ChatSession, PipelineCommand, SessionController};
pub use sidebar::{ChatList, ChatListEntry, ListChange};

/// Local dev server endpoint.
pub const DEFAULT_SERVER_ENDPOINT: &str = "http://127.0.0.1:18300";

/// Default window for matching optimistic messages to canonical ones.
pub const DEFAULT_MATCH_WINDOW_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Base URL without a trailing slash.
	pub base_url: String,

	/// Session token sent as `Authorization: Bearer`.
	pub token: String,

	/// Timeout for non-streaming requests.
	pub request_timeout: Duration,

	pub connect_timeout: Duration,

	/// Maximum size of one decoded event frame.
	pub max_event_bytes: usize,

	/// Queue depth between the transport and the session loop.
	pub event_queue_capacity: usize,

	/// Messages fetched when a chat is opened.
	pub history_limit: usize,

	pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
	/// Convenience: create a config from `http://host:port`.
	pub fn from_http_endpoint(endpoint: &str, token: impl Into<String>) -> Result<Self, ClientCoreError> {
		let e = HttpEndpoint::parse(endpoint).map_err(|e| ClientCoreError::Protocol(e.to_string()))?;
		Ok(Self {
			base_url: e.base_url(),
			token: token.into(),
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			base_url: DEFAULT_SERVER_ENDPOINT.to_string(),
			token: String::new(),
			request_timeout: Duration::from_secs(15),
			connect_timeout: Duration::from_secs(10),
			max_event_bytes: parley_protocol::DEFAULT_MAX_EVENT_SIZE,
			event_queue_capacity: 256,
			history_limit: 50,
			reconnect: ReconnectPolicy::default(),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// The server answered with a typed error.
	#[error(transparent)]
	Api(#[from] ChatError),

	/// Transport-level HTTP failure.
	#[error("http error: {0}")]
	Http(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected response shape or state.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The session loop is gone.
	#[error("session closed: {0}")]
	Closed(String),

	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

impl From<reqwest::Error> for ClientCoreError {
	fn from(e: reqwest::Error) -> Self {
		ClientCoreError::Http(e.to_string())
	}
}
