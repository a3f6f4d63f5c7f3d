#![forbid(unsafe_code)]

//! Chat creation and membership transitions.
//!
//! Each transition validates, persists, then dispatches. A failed validation
//! writes nothing; a failed dispatch leaves the write in place.

use parley_domain::{ChatEntity, ChatError, ChatId, ChatKind, DIRECT_MESSAGE_NAME, DirectPair, UserId};
use parley_util::time::unix_ms_now;
use tracing::info;

use super::dispatcher::Dispatcher;
use super::repo::Repo;

#[derive(Clone)]
pub struct Membership {
	repo: Repo,
	dispatcher: Dispatcher,
}

fn count_mutation(op: &'static str) {
	metrics::counter!("parley_membership_mutations_total", "op" => op).increment(1);
}

impl Membership {
	pub fn new(repo: Repo, dispatcher: Dispatcher) -> Self {
		Self { repo, dispatcher }
	}

	/// Create a chat from an explicit member list.
	///
	/// Two members and no name yield a direct message under the pair's
	/// implicit id; if that chat already exists it is returned unchanged.
	pub async fn create_group(
		&self,
		requester: &UserId,
		member_ids: Vec<UserId>,
		name: Option<String>,
	) -> Result<ChatEntity, ChatError> {
		let mut members: Vec<UserId> = Vec::with_capacity(member_ids.len());
		for m in member_ids {
			if !members.contains(&m) {
				members.push(m);
			}
		}

		if !members.contains(requester) {
			return Err(ChatError::validation("requester must be one of the members"));
		}

		let name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
		if members.len() > 2 && name.is_none() {
			return Err(ChatError::validation("group chats with more than two members need a name"));
		}

		if members.len() == 2 {
			let other = members
				.iter()
				.find(|m| *m != requester)
				.ok_or_else(|| ChatError::validation("two-member chat needs two distinct users"))?;
			if !self.repo.is_friend(requester, other).await? {
				return Err(ChatError::unauthorized("only friends can start a two-member chat"));
			}
		}

		let now = unix_ms_now();
		let chat = match (members.len(), name) {
			(2, None) => {
				let pair = DirectPair::new(members[0].clone(), members[1].clone());
				let id = pair.chat_id();
				if let Some(existing) = self.repo.chat(&id).await? {
					return Ok(existing);
				}
				ChatEntity {
					id,
					name: DIRECT_MESSAGE_NAME.to_string(),
					member_ids: members,
					created_at: Some(now),
				}
			}
			(_, name) => ChatEntity {
				id: ChatId::new_v4(),
				name: name.unwrap_or_default(),
				member_ids: members,
				created_at: Some(now),
			},
		};

		self.repo.save_chat(&chat).await?;
		for member in &chat.member_ids {
			self.repo.index_chat(member, &chat.id, now).await?;
		}
		count_mutation("create");
		info!(chat = %chat.id, members = chat.member_ids.len(), kind = ?chat.kind(), "chat created");

		self.dispatcher.chat_created(&chat).await;
		Ok(chat)
	}

	/// Chat that `sender` may post to, creating an implicit direct message on
	/// first contact.
	pub async fn resolve_for_send(&self, sender: &UserId, chat_id: &ChatId) -> Result<ChatEntity, ChatError> {
		match self.repo.chat(chat_id).await? {
			Some(chat) => {
				if !chat.is_member(sender) {
					return Err(ChatError::unauthorized(format!("not a member of {chat_id}")));
				}
				Ok(chat)
			}
			None => self.bootstrap_direct(sender, chat_id).await,
		}
	}

	/// Materialize `a--b` the first time either side sends to it.
	pub async fn bootstrap_direct(&self, sender: &UserId, chat_id: &ChatId) -> Result<ChatEntity, ChatError> {
		let pair = DirectPair::parse(chat_id).map_err(|_| ChatError::not_found(format!("chat {chat_id}")))?;
		let other = pair
			.other(sender)
			.ok_or_else(|| ChatError::unauthorized(format!("not a participant of {chat_id}")))?
			.clone();

		if !self.repo.is_friend(sender, &other).await? {
			return Err(ChatError::unauthorized("only friends can start a direct message"));
		}

		let chat = ChatEntity::direct(pair.chat_id(), pair.a.clone(), pair.b.clone());
		let now = unix_ms_now();
		self.repo.save_chat(&chat).await?;
		self.repo.index_chat(&pair.a, &chat.id, now).await?;
		self.repo.index_chat(&pair.b, &chat.id, now).await?;
		count_mutation("bootstrap_direct");
		info!(chat = %chat.id, "direct chat bootstrapped");
		Ok(chat)
	}

	pub async fn add_member(
		&self,
		requester: &UserId,
		chat_id: &ChatId,
		member: &UserId,
	) -> Result<ChatEntity, ChatError> {
		let mut chat = self.repo.require_chat(chat_id).await?;
		if !chat.is_member(requester) {
			return Err(ChatError::unauthorized(format!("not a member of {chat_id}")));
		}
		if chat.is_member(member) {
			return Err(ChatError::conflict(format!("{member} is already a member")));
		}
		if chat.member_ids.len() + 1 >= 2 && chat.name.trim().is_empty() {
			return Err(ChatError::conflict("name the chat before adding members"));
		}

		chat.member_ids.push(member.clone());
		self.repo.save_chat(&chat).await?;
		self.repo.index_chat(member, &chat.id, unix_ms_now()).await?;
		count_mutation("add_member");
		info!(chat = %chat.id, member = %member, "member added");

		self.dispatcher.member_added(&chat, member).await;
		Ok(chat)
	}

	pub async fn remove_member(
		&self,
		requester: &UserId,
		chat_id: &ChatId,
		member: &UserId,
	) -> Result<ChatEntity, ChatError> {
		let mut chat = self.repo.require_chat(chat_id).await?;
		if !chat.is_member(requester) {
			return Err(ChatError::unauthorized(format!("not a member of {chat_id}")));
		}
		if chat.kind() == ChatKind::DirectMessage {
			return Err(ChatError::conflict("members cannot be removed from a direct message"));
		}
		if requester == member {
			return Err(ChatError::conflict("members cannot remove themselves"));
		}
		if !chat.is_member(member) {
			return Err(ChatError::conflict(format!("{member} is not a member")));
		}
		if chat.member_ids.len() <= 1 {
			return Err(ChatError::conflict("a chat cannot lose its last member"));
		}

		chat.member_ids.retain(|m| m != member);
		self.repo.save_chat(&chat).await?;
		self.repo.unindex_chat(member, &chat.id).await?;
		count_mutation("remove_member");
		info!(chat = %chat.id, member = %member, "member removed");

		self.dispatcher.member_removed(&chat, member).await;
		Ok(chat)
	}

	pub async fn rename(&self, requester: &UserId, chat_id: &ChatId, name: &str) -> Result<ChatEntity, ChatError> {
		let name = name.trim();
		if name.is_empty() {
			return Err(ChatError::validation("chat name must not be empty"));
		}

		let mut chat = self.repo.require_chat(chat_id).await?;
		if !chat.is_member(requester) {
			return Err(ChatError::unauthorized(format!("not a member of {chat_id}")));
		}

		chat.name = name.to_string();
		self.repo.save_chat(&chat).await?;
		count_mutation("rename");
		info!(chat = %chat.id, kind = ?chat.kind(), "chat renamed");

		self.dispatcher.chat_renamed(&chat).await;
		Ok(chat)
	}
}
