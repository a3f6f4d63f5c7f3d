#![forbid(unsafe_code)]

use thiserror::Error;

use crate::ParseIdError;

/// Failure taxonomy for chat operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	/// Caller not authenticated or not a member.
	#[error("unauthorized: {0}")]
	Unauthorized(String),

	#[error("not found: {0}")]
	NotFound(String),

	/// Malformed request or empty text/name. Raised before any write.
	#[error("invalid request: {0}")]
	Validation(String),

	/// Request is well-formed but clashes with current state.
	#[error("conflict: {0}")]
	Conflict(String),

	/// Store adapter failure.
	#[error("storage error: {0}")]
	Storage(String),
}

impl ChatError {
	/// Stable machine-readable kind.
	pub const fn kind(&self) -> &'static str {
		match self {
			ChatError::Unauthorized(_) => "unauthorized",
			ChatError::NotFound(_) => "not_found",
			ChatError::Validation(_) => "validation",
			ChatError::Conflict(_) => "conflict",
			ChatError::Storage(_) => "storage",
		}
	}

	/// Human-readable reason without the kind prefix.
	pub fn detail(&self) -> &str {
		match self {
			ChatError::Unauthorized(d)
			| ChatError::NotFound(d)
			| ChatError::Validation(d)
			| ChatError::Conflict(d)
			| ChatError::Storage(d) => d,
		}
	}

	pub fn unauthorized(detail: impl Into<String>) -> Self {
		ChatError::Unauthorized(detail.into())
	}
	pub fn not_found(detail: impl Into<String>) -> Self {
		ChatError::NotFound(detail.into())
	}
	pub fn validation(detail: impl Into<String>) -> Self {
		ChatError::Validation(detail.into())
	}
	pub fn conflict(detail: impl Into<String>) -> Self {
		ChatError::Conflict(detail.into())
	}
	pub fn storage(detail: impl Into<String>) -> Self {
		ChatError::Storage(detail.into())
	}
}

impl From<ParseIdError> for ChatError {
	fn from(e: ParseIdError) -> Self {
		ChatError::Validation(e.to_string())
	}
}
