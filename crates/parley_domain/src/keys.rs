#![forbid(unsafe_code)]

//! Store key scheme.

use crate::{ChatId, UserId};

/// `chat:{id}` holds the entity JSON.
pub fn chat(id: &ChatId) -> String {
	format!("chat:{id}")
}

/// `chat:{id}:messages` is the ordered message log (score = timestamp).
pub fn chat_messages(id: &ChatId) -> String {
	format!("chat:{id}:messages")
}

/// `user:{id}` holds the profile JSON.
pub fn user(id: &UserId) -> String {
	format!("user:{id}")
}

/// `user:{id}:chats` is the membership index.
pub fn user_chats(id: &UserId) -> String {
	format!("user:{id}:chats")
}

pub fn user_friends(id: &UserId) -> String {
	format!("user:{id}:friends")
}

pub fn user_incoming_friend_requests(id: &UserId) -> String {
	format!("user:{id}:incoming_friend_requests")
}
