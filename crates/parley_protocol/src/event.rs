#![forbid(unsafe_code)]

use core::fmt;

use parley_domain::{ChatEntity, ChatId, Message, UserId, UserProfile};
use serde::{Deserialize, Serialize};

/// Broker event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	IncomingMessage,
	NewMessage,
	MessageEdited,
	MemberAdded,
	MemberRemoved,
	ChatRenamed,
	ChatCreated,
	ChatRefreshed,
	FriendAdded,
	FriendRemoved,
	IncomingFriendRequest,
	Lagged,
}

impl EventKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::IncomingMessage => "incoming_message",
			EventKind::NewMessage => "new_message",
			EventKind::MessageEdited => "message_edited",
			EventKind::MemberAdded => "member_added",
			EventKind::MemberRemoved => "member_removed",
			EventKind::ChatRenamed => "chat_renamed",
			EventKind::ChatCreated => "chat_created",
			EventKind::ChatRefreshed => "chat_refreshed",
			EventKind::FriendAdded => "friend_added",
			EventKind::FriendRemoved => "friend_removed",
			EventKind::IncomingFriendRequest => "incoming_friend_request",
			EventKind::Lagged => "lagged",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Sender display fields attached to notification-scope message events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image: Option<String>,
}

impl From<&UserProfile> for SenderInfo {
	fn from(p: &UserProfile) -> Self {
		Self {
			name: p.name.clone(),
			image: p.image.clone(),
		}
	}
}

/// A message plus, on notification channels, who sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNotice {
	pub message: Message,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sender: Option<SenderInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipChange {
	pub member_id: UserId,
	pub chat: ChatEntity,
}

/// Typed event payloads, tagged with their `EventKind` name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
	/// Canonical message on the conversation channel.
	IncomingMessage(Message),
	/// Message notice on a member's notification channel.
	NewMessage(MessageNotice),
	MessageEdited(MessageNotice),
	MemberAdded(MembershipChange),
	MemberRemoved(MembershipChange),
	ChatRenamed(ChatEntity),
	ChatCreated(ChatEntity),
	/// Generic "re-sync your list" signal.
	ChatRefreshed(ChatEntity),
	FriendAdded(UserProfile),
	FriendRemoved(UserProfile),
	IncomingFriendRequest(UserProfile),
	/// Events were dropped for this subscriber; state must be refreshed from a snapshot.
	Lagged { dropped: u64 },
}

impl ChatEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			ChatEvent::IncomingMessage(_) => EventKind::IncomingMessage,
			ChatEvent::NewMessage(_) => EventKind::NewMessage,
			ChatEvent::MessageEdited(_) => EventKind::MessageEdited,
			ChatEvent::MemberAdded(_) => EventKind::MemberAdded,
			ChatEvent::MemberRemoved(_) => EventKind::MemberRemoved,
			ChatEvent::ChatRenamed(_) => EventKind::ChatRenamed,
			ChatEvent::ChatCreated(_) => EventKind::ChatCreated,
			ChatEvent::ChatRefreshed(_) => EventKind::ChatRefreshed,
			ChatEvent::FriendAdded(_) => EventKind::FriendAdded,
			ChatEvent::FriendRemoved(_) => EventKind::FriendRemoved,
			ChatEvent::IncomingFriendRequest(_) => EventKind::IncomingFriendRequest,
			ChatEvent::Lagged { .. } => EventKind::Lagged,
		}
	}

	/// Chat the event concerns, if any.
	pub fn chat_id(&self) -> Option<&ChatId> {
		match self {
			ChatEvent::IncomingMessage(m) => Some(&m.chat_id),
			ChatEvent::NewMessage(n) | ChatEvent::MessageEdited(n) => Some(&n.message.chat_id),
			ChatEvent::MemberAdded(c) | ChatEvent::MemberRemoved(c) => Some(&c.chat.id),
			ChatEvent::ChatRenamed(c) | ChatEvent::ChatCreated(c) | ChatEvent::ChatRefreshed(c) => Some(&c.id),
			ChatEvent::FriendAdded(_)
			| ChatEvent::FriendRemoved(_)
			| ChatEvent::IncomingFriendRequest(_)
			| ChatEvent::Lagged { .. } => None,
		}
	}
}

/// One published event on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
	pub channel: String,
	pub payload: ChatEvent,
}

impl EventEnvelope {
	pub fn new(channel: impl Into<String>, payload: ChatEvent) -> Self {
		Self {
			channel: channel.into(),
			payload,
		}
	}

	pub fn kind(&self) -> EventKind {
		self.payload.kind()
	}
}

#[cfg(test)]
mod tests {
	use parley_domain::MessageId;

	use super::*;

	#[test]
	fn payload_tag_matches_event_kind() {
		let msg = Message {
			id: MessageId::new("m1").unwrap(),
			chat_id: ChatId::new("a--b").unwrap(),
			sender_id: UserId::new("a").unwrap(),
			text: "hi".to_string(),
			timestamp: 10,
			client_ref: None,
		};
		let ev = ChatEvent::IncomingMessage(msg);
		let v = serde_json::to_value(&ev).unwrap();
		assert_eq!(v["event"], ev.kind().as_str());
		assert_eq!(v["data"]["chatId"], "a--b");
	}

	#[test]
	fn lagged_carries_count() {
		let v = serde_json::to_value(ChatEvent::Lagged { dropped: 3 }).unwrap();
		assert_eq!(v["event"], "lagged");
		assert_eq!(v["data"]["dropped"], 3);
	}
}
