#![forbid(unsafe_code)]

//! Typed reads and writes over the raw store.

use std::sync::Arc;

use parley_domain::{ChatEntity, ChatError, ChatId, Message, MessageId, UserId, UserProfile, keys};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::store::Store;

fn storage(e: anyhow::Error) -> ChatError {
	ChatError::storage(format!("{e:#}"))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, ChatError> {
	serde_json::from_str(raw).map_err(|e| ChatError::storage(format!("corrupt value at {key}: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<String, ChatError> {
	serde_json::to_string(value).map_err(|e| ChatError::storage(format!("encode: {e}")))
}

#[derive(Clone)]
pub struct Repo {
	store: Arc<dyn Store>,
}

impl Repo {
	pub fn new(store: Arc<dyn Store>) -> Self {
		Self { store }
	}

	pub async fn chat(&self, id: &ChatId) -> Result<Option<ChatEntity>, ChatError> {
		let key = keys::chat(id);
		match self.store.get(&key).await.map_err(storage)? {
			Some(raw) => decode(&key, &raw).map(Some),
			None => Ok(None),
		}
	}

	pub async fn require_chat(&self, id: &ChatId) -> Result<ChatEntity, ChatError> {
		self.chat(id)
			.await?
			.ok_or_else(|| ChatError::not_found(format!("chat {id}")))
	}

	pub async fn save_chat(&self, chat: &ChatEntity) -> Result<(), ChatError> {
		let raw = encode(chat)?;
		self.store.set(&keys::chat(&chat.id), &raw).await.map_err(storage)
	}

	/// Add the chat to the user's membership index, scored by `at`.
	pub async fn index_chat(&self, user: &UserId, chat: &ChatId, at: i64) -> Result<(), ChatError> {
		self.store
			.zadd(&keys::user_chats(user), at, chat.as_str())
			.await
			.map_err(storage)
	}

	pub async fn unindex_chat(&self, user: &UserId, chat: &ChatId) -> Result<(), ChatError> {
		self.store
			.zrem(&keys::user_chats(user), chat.as_str())
			.await
			.map(|_| ())
			.map_err(storage)
	}

	pub async fn chat_ids_for(&self, user: &UserId) -> Result<Vec<ChatId>, ChatError> {
		let raw = self
			.store
			.zrange(&keys::user_chats(user), 0, -1)
			.await
			.map_err(storage)?;
		raw.into_iter()
			.map(|id| ChatId::new(id).map_err(|e| ChatError::storage(format!("corrupt chat index: {e}"))))
			.collect()
	}

	pub async fn profile(&self, user: &UserId) -> Result<Option<UserProfile>, ChatError> {
		let key = keys::user(user);
		match self.store.get(&key).await.map_err(storage)? {
			Some(raw) => decode(&key, &raw).map(Some),
			None => Ok(None),
		}
	}

	/// Stored profile, or a stand-in labelled with the id.
	pub async fn profile_or_unknown(&self, user: &UserId) -> Result<UserProfile, ChatError> {
		Ok(self
			.profile(user)
			.await?
			.unwrap_or_else(|| UserProfile::unknown(user.clone())))
	}

	pub async fn save_profile(&self, profile: &UserProfile) -> Result<(), ChatError> {
		let raw = encode(profile)?;
		self.store.set(&keys::user(&profile.id), &raw).await.map_err(storage)
	}

	pub async fn append_message(&self, message: &Message) -> Result<(), ChatError> {
		let raw = encode(message)?;
		self.store
			.zadd(&keys::chat_messages(&message.chat_id), message.timestamp, &raw)
			.await
			.map_err(storage)
	}

	/// Oldest-first messages in the inclusive rank range.
	pub async fn messages(&self, chat: &ChatId, start: i64, end: i64) -> Result<Vec<Message>, ChatError> {
		let key = keys::chat_messages(chat);
		let raw = self.store.zrange(&key, start, end).await.map_err(storage)?;
		raw.iter().map(|r| decode(&key, r)).collect()
	}

	pub async fn last_message(&self, chat: &ChatId) -> Result<Option<Message>, ChatError> {
		Ok(self.messages(chat, -1, -1).await?.pop())
	}

	pub async fn find_message(&self, chat: &ChatId, id: &MessageId) -> Result<Option<Message>, ChatError> {
		Ok(self
			.messages(chat, 0, -1)
			.await?
			.into_iter()
			.find(|m| &m.id == id))
	}

	/// Swap a stored message for its edited form, keeping its score.
	pub async fn replace_message(&self, old: &Message, new: &Message) -> Result<(), ChatError> {
		let key = keys::chat_messages(&old.chat_id);
		let old_raw = encode(old)?;
		let removed = self.store.zrem(&key, &old_raw).await.map_err(storage)?;
		if !removed {
			return Err(ChatError::not_found(format!("message {}", old.id)));
		}
		self.append_message(new).await
	}

	pub async fn is_friend(&self, a: &UserId, b: &UserId) -> Result<bool, ChatError> {
		self.store
			.sismember(&keys::user_friends(a), b.as_str())
			.await
			.map_err(storage)
	}

	pub async fn friend_ids(&self, user: &UserId) -> Result<Vec<UserId>, ChatError> {
		self.user_set(&keys::user_friends(user)).await
	}

	pub async fn add_friendship(&self, a: &UserId, b: &UserId) -> Result<(), ChatError> {
		self.store
			.sadd(&keys::user_friends(a), b.as_str())
			.await
			.map_err(storage)?;
		self.store
			.sadd(&keys::user_friends(b), a.as_str())
			.await
			.map_err(storage)?;
		Ok(())
	}

	pub async fn remove_friendship(&self, a: &UserId, b: &UserId) -> Result<bool, ChatError> {
		let ab = self
			.store
			.srem(&keys::user_friends(a), b.as_str())
			.await
			.map_err(storage)?;
		let ba = self
			.store
			.srem(&keys::user_friends(b), a.as_str())
			.await
			.map_err(storage)?;
		Ok(ab || ba)
	}

	pub async fn incoming_requests(&self, user: &UserId) -> Result<Vec<UserId>, ChatError> {
		self.user_set(&keys::user_incoming_friend_requests(user)).await
	}

	pub async fn has_incoming_request(&self, to: &UserId, from: &UserId) -> Result<bool, ChatError> {
		self.store
			.sismember(&keys::user_incoming_friend_requests(to), from.as_str())
			.await
			.map_err(storage)
	}

	pub async fn add_incoming_request(&self, to: &UserId, from: &UserId) -> Result<bool, ChatError> {
		self.store
			.sadd(&keys::user_incoming_friend_requests(to), from.as_str())
			.await
			.map_err(storage)
	}

	pub async fn remove_incoming_request(&self, to: &UserId, from: &UserId) -> Result<bool, ChatError> {
		self.store
			.srem(&keys::user_incoming_friend_requests(to), from.as_str())
			.await
			.map_err(storage)
	}

	async fn user_set(&self, key: &str) -> Result<Vec<UserId>, ChatError> {
		let raw = self.store.smembers(key).await.map_err(storage)?;
		raw.into_iter()
			.map(|id| UserId::new(id).map_err(|e| ChatError::storage(format!("corrupt user set {key}: {e}"))))
			.collect()
	}
}
