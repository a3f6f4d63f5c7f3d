#![forbid(unsafe_code)]

//! Chat state machine: membership transitions, the message log, friendships
//! and the snapshot reads clients use to rebuild their views.

pub mod dispatcher;
pub mod friends;
pub mod membership;
pub mod messages;
pub mod repo;

#[cfg(test)]
mod service_tests;

use std::sync::Arc;

use parley_domain::{Channel, ChatError, DirectPair, UserId, UserProfile};
use parley_protocol::api::{ChatListResponse, ChatSummary};
use tracing::warn;

pub use dispatcher::Dispatcher;
pub use friends::Friends;
pub use membership::Membership;
pub use messages::MessageLog;
pub use repo::Repo;

use crate::broker::Broker;
use crate::store::Store;

pub struct ChatService {
	repo: Repo,
	membership: Membership,
	messages: MessageLog,
	friends: Friends,
	match_window_ms: u64,
}

impl ChatService {
	pub fn new(store: Arc<dyn Store>, broker: Arc<dyn Broker>, match_window_ms: u64) -> Self {
		let repo = Repo::new(store);
		let dispatcher = Dispatcher::new(broker);
		let membership = Membership::new(repo.clone(), dispatcher.clone());
		let messages = MessageLog::new(repo.clone(), membership.clone(), dispatcher.clone());
		let friends = Friends::new(repo.clone(), dispatcher);
		Self {
			repo,
			membership,
			messages,
			friends,
			match_window_ms,
		}
	}

	pub fn membership(&self) -> &Membership {
		&self.membership
	}

	pub fn messages(&self) -> &MessageLog {
		&self.messages
	}

	pub fn friends(&self) -> &Friends {
		&self.friends
	}

	pub fn repo(&self) -> &Repo {
		&self.repo
	}

	/// Store the caller's own profile. The id always comes from the session.
	pub async fn upsert_profile(&self, me: &UserId, name: &str, image: Option<String>) -> Result<UserProfile, ChatError> {
		let name = name.trim();
		if name.is_empty() {
			return Err(ChatError::validation("profile name must not be empty"));
		}
		let existing = self.repo.profile(me).await?;
		let profile = UserProfile {
			id: me.clone(),
			name: name.to_string(),
			email: existing.map(|p| p.email).unwrap_or_default(),
			image,
		};
		self.repo.save_profile(&profile).await?;
		Ok(profile)
	}

	/// Every chat the user belongs to, with its latest message and member profiles.
	pub async fn list_chats(&self, user: &UserId) -> Result<ChatListResponse, ChatError> {
		let me = self.repo.profile_or_unknown(user).await?;
		let mut chats = Vec::new();

		for id in self.repo.chat_ids_for(user).await? {
			let Some(chat) = self.repo.chat(&id).await? else {
				warn!(chat = %id, user = %user, "membership index points at a missing chat");
				continue;
			};
			if !chat.is_member(user) {
				warn!(chat = %id, user = %user, "stale membership index entry");
				continue;
			}

			let last_message = self.repo.last_message(&chat.id).await?;
			let mut members = Vec::with_capacity(chat.member_ids.len());
			for m in &chat.member_ids {
				members.push(self.repo.profile_or_unknown(m).await?);
			}
			chats.push(ChatSummary {
				chat,
				last_message,
				members,
			});
		}

		Ok(ChatListResponse {
			me,
			chats,
			match_window_ms: self.match_window_ms,
		})
	}

	/// Whether `user` may listen on `channel`.
	pub async fn authorize_subscription(&self, user: &UserId, channel: &Channel) -> Result<(), ChatError> {
		if let Some(owner) = channel.owner() {
			if owner != user {
				return Err(ChatError::unauthorized("cannot subscribe to another user's channel"));
			}
			return Ok(());
		}

		let Channel::Chat(chat_id) = channel else {
			return Err(ChatError::unauthorized("unknown channel scope"));
		};
		match self.repo.chat(chat_id).await? {
			Some(chat) if chat.is_member(user) => Ok(()),
			Some(_) => Err(ChatError::unauthorized(format!("not a member of {chat_id}"))),
			None => match DirectPair::parse(chat_id) {
				Ok(pair) if pair.contains(user) => Ok(()),
				_ => Err(ChatError::not_found(format!("chat {chat_id}"))),
			},
		}
	}
}
