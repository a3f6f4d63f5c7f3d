#![forbid(unsafe_code)]

//! JSON bodies for the HTTP API.

use parley_domain::{ChatEntity, ChatError, ChatId, Message, MessageId, UserId, UserProfile};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
	pub chat_id: ChatId,
	pub text: String,
	/// Temporary id of the sender's optimistic copy.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_ref: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
	pub chat_id: ChatId,
	pub message_id: MessageId,
	pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
	pub member_ids: Vec<UserId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
	pub member_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameChatRequest {
	pub name: String,
}

/// Target of a friend request/accept/deny.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
	pub user_id: UserId,
}

/// Display fields the caller sets on their own profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProfileRequest {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendsResponse {
	pub friends: Vec<UserProfile>,
	/// Users waiting for the caller to accept or deny.
	pub incoming: Vec<UserProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileResponse {
	pub profile: UserProfile,
}

/// One chat in a list snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
	pub chat: ChatEntity,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_message: Option<Message>,
	/// Profiles of every member, used to label direct messages.
	#[serde(default)]
	pub members: Vec<UserProfile>,
}

/// Full list snapshot for the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatListResponse {
	pub me: UserProfile,
	pub chats: Vec<ChatSummary>,
	/// Window used to match optimistic messages with their canonical copy.
	pub match_window_ms: u64,
}

/// Newest-first message page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesResponse {
	pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
	pub chat: ChatEntity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
	pub message: Message,
}

/// Error body returned with every non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
	pub error: String,
	pub detail: String,
}

impl From<&ChatError> for ErrorBody {
	fn from(e: &ChatError) -> Self {
		Self {
			error: e.kind().to_string(),
			detail: e.detail().to_string(),
		}
	}
}

impl ErrorBody {
	/// Rebuild the typed error on the client side.
	pub fn into_chat_error(self) -> ChatError {
		match self.error.as_str() {
			"unauthorized" => ChatError::Unauthorized(self.detail),
			"not_found" => ChatError::NotFound(self.detail),
			"validation" => ChatError::Validation(self.detail),
			"conflict" => ChatError::Conflict(self.detail),
			_ => ChatError::Storage(self.detail),
		}
	}
}
