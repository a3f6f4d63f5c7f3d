#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use crate::{ChatId, ParseIdError, UserId};

/// Broker channel names.
///
/// Colons are not allowed in channel names by common hosted brokers, so the
/// store-style `chat:{id}` scopes are rendered with `__` instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
	/// Per-conversation scope: `chat__{chatId}`.
	Chat(ChatId),
	/// Per-user notification scope: `user__{userId}__chats`.
	UserChats(UserId),
	/// Friend notifications: `user__{userId}__friends`.
	UserFriends(UserId),
	/// Friend requests: `user__{userId}__incoming_friend_requests`.
	IncomingFriendRequests(UserId),
}

impl Channel {
	const SEP: &'static str = "__";

	/// The user a per-user channel belongs to.
	pub fn owner(&self) -> Option<&UserId> {
		match self {
			Channel::Chat(_) => None,
			Channel::UserChats(u) | Channel::UserFriends(u) | Channel::IncomingFriendRequests(u) => Some(u),
		}
	}

	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if let Some(chat) = s.strip_prefix("chat__") {
			return Ok(Channel::Chat(ChatId::new(chat.to_string())?));
		}

		let rest = s
			.strip_prefix("user__")
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("unknown channel: {s}")))?;
		let (user, scope) = rest
			.rsplit_once(Self::SEP)
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("missing channel scope: {s}")))?;
		let user = UserId::new(user.to_string())?;

		match scope {
			"chats" => Ok(Channel::UserChats(user)),
			"friends" => Ok(Channel::UserFriends(user)),
			"incoming_friend_requests" => Ok(Channel::IncomingFriendRequests(user)),
			other => Err(ParseIdError::InvalidFormat(format!("unknown channel scope: {other}"))),
		}
	}
}

impl fmt::Display for Channel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let sep = Self::SEP;
		match self {
			Channel::Chat(c) => write!(f, "chat{sep}{c}"),
			Channel::UserChats(u) => write!(f, "user{sep}{u}{sep}chats"),
			Channel::UserFriends(u) => write!(f, "user{sep}{u}{sep}friends"),
			Channel::IncomingFriendRequests(u) => write!(f, "user{sep}{u}{sep}incoming_friend_requests"),
		}
	}
}

impl FromStr for Channel {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Channel::parse(s)
	}
}
