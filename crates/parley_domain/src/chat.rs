#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ChatId, DIRECT_CHAT_SEPARATOR, MessageId, ParseIdError, UserId};

/// Reserved chat name marking a two-member chat as a direct message.
pub const DIRECT_MESSAGE_NAME: &str = "Direct message";

/// Classification of a chat entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
	DirectMessage,
	Group,
}

/// The one classification predicate.
///
/// A chat is a direct message iff it has exactly two members and carries the
/// reserved name. Everything else is a group, whatever its size.
pub fn classify(member_count: usize, name: &str) -> ChatKind {
	if member_count == 2 && name == DIRECT_MESSAGE_NAME {
		ChatKind::DirectMessage
	} else {
		ChatKind::Group
	}
}

/// A conversation and its membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntity {
	pub id: ChatId,
	pub name: String,
	/// Insertion-ordered, duplicate-free.
	pub member_ids: Vec<UserId>,
	/// Unix ms; only set for explicitly created chats.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_at: Option<i64>,
}

impl ChatEntity {
	/// Sentinel-named two-member chat.
	pub fn direct(id: ChatId, a: UserId, b: UserId) -> Self {
		Self {
			id,
			name: DIRECT_MESSAGE_NAME.to_string(),
			member_ids: vec![a, b],
			created_at: None,
		}
	}

	pub fn kind(&self) -> ChatKind {
		classify(self.member_ids.len(), &self.name)
	}

	pub fn is_direct(&self) -> bool {
		self.kind() == ChatKind::DirectMessage
	}

	pub fn is_member(&self, user: &UserId) -> bool {
		self.member_ids.iter().any(|m| m == user)
	}

	/// For a two-member chat, the member that is not `me`.
	pub fn other_member(&self, me: &UserId) -> Option<&UserId> {
		if self.member_ids.len() != 2 {
			return None;
		}
		self.member_ids.iter().find(|m| *m != me)
	}

	/// Members other than `user`.
	pub fn members_except<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
		self.member_ids.iter().filter(move |m| *m != user)
	}
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub id: MessageId,
	pub chat_id: ChatId,
	pub sender_id: UserId,
	pub text: String,
	/// Unix ms send time; also the message log score.
	pub timestamp: i64,
	/// Temporary id the sender used for its optimistic copy, echoed back when supplied.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_ref: Option<MessageId>,
}

/// Public user profile fields used for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: UserId,
	pub name: String,
	#[serde(default)]
	pub email: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image: Option<String>,
}

impl UserProfile {
	/// Profile stand-in when only the id is known.
	pub fn unknown(id: UserId) -> Self {
		Self {
			name: id.to_string(),
			id,
			email: String::new(),
			image: None,
		}
	}
}

/// The two users encoded in an implicit direct chat id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectPair {
	pub a: UserId,
	pub b: UserId,
}

impl DirectPair {
	/// Canonical pair with the ids sorted, so both users derive the same chat id.
	pub fn new(x: UserId, y: UserId) -> Self {
		if x <= y { Self { a: x, b: y } } else { Self { a: y, b: x } }
	}

	pub fn chat_id(&self) -> ChatId {
		ChatId(format!("{}{}{}", self.a, DIRECT_CHAT_SEPARATOR, self.b))
	}

	/// Parse `<user>--<user>`. Both halves must be valid, distinct user ids in
	/// sorted order, so each pair has exactly one chat id.
	pub fn parse(chat_id: &ChatId) -> Result<Self, ParseIdError> {
		let (left, right) = chat_id
			.as_str()
			.split_once(DIRECT_CHAT_SEPARATOR)
			.ok_or_else(|| ParseIdError::InvalidFormat("expected <user>--<user>".into()))?;

		let a = UserId::new(left.to_string())?;
		let b = UserId::new(right.to_string())?;
		match a.cmp(&b) {
			core::cmp::Ordering::Less => Ok(Self { a, b }),
			core::cmp::Ordering::Equal => Err(ParseIdError::InvalidFormat("direct chat needs two distinct users".into())),
			core::cmp::Ordering::Greater => Err(ParseIdError::InvalidFormat(format!(
				"direct chat id must be {}",
				DirectPair::new(a, b).chat_id()
			))),
		}
	}

	pub fn contains(&self, user: &UserId) -> bool {
		&self.a == user || &self.b == user
	}

	pub fn other(&self, user: &UserId) -> Option<&UserId> {
		if &self.a == user {
			Some(&self.b)
		} else if &self.b == user {
			Some(&self.a)
		} else {
			None
		}
	}
}
