#![forbid(unsafe_code)]

//! Chat-list view built from snapshots and kept current by events.

use std::collections::{HashMap, HashSet};

use parley_domain::{ChatEntity, ChatId, ChatKind, DirectPair, Message, MessageId, UserId, UserProfile};
use parley_protocol::api::ChatListResponse;
use parley_protocol::{ChatEvent, SenderInfo};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatListEntry {
	pub chat: ChatEntity,
	pub display_name: String,
	pub last_message_at: Option<i64>,
	pub preview: Option<String>,
	pub unseen: u32,
	/// Synthesized from a message notice; replaced by the next snapshot.
	pub placeholder: bool,
	last_message_id: Option<MessageId>,
	counted: HashSet<MessageId>,
}

impl ChatListEntry {
	fn new(chat: ChatEntity, display_name: String) -> Self {
		Self {
			chat,
			display_name,
			last_message_at: None,
			preview: None,
			unseen: 0,
			placeholder: false,
			last_message_id: None,
			counted: HashSet::new(),
		}
	}

	pub fn kind(&self) -> ChatKind {
		self.chat.kind()
	}

	fn note_message(&mut self, message: &Message) {
		if self.last_message_at.is_some_and(|t| message.timestamp < t) {
			return;
		}
		self.last_message_at = Some(message.timestamp);
		self.preview = Some(message.text.clone());
		self.last_message_id = Some(message.id.clone());
	}

	fn group_sort_key(&self) -> i64 {
		self.last_message_at
			.unwrap_or(i64::MIN)
			.max(self.chat.created_at.unwrap_or(i64::MIN))
	}
}

/// What an update did to the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListChange {
	Unchanged,
	Updated(ChatId),
	Removed(ChatId),
	/// A placeholder entry was created; a snapshot refresh should follow.
	Placeholder(ChatId),
	/// Events were lost; only a snapshot can restore the list.
	NeedsRefresh,
}

pub struct ChatList {
	me: UserId,
	entries: HashMap<ChatId, ChatListEntry>,
	profiles: HashMap<UserId, UserProfile>,
	active: Option<ChatId>,
}

impl ChatList {
	pub fn new(me: UserId) -> Self {
		Self {
			me,
			entries: HashMap::new(),
			profiles: HashMap::new(),
			active: None,
		}
	}

	pub fn me(&self) -> &UserId {
		&self.me
	}

	pub fn active(&self) -> Option<&ChatId> {
		self.active.as_ref()
	}

	pub fn entry(&self, id: &ChatId) -> Option<&ChatListEntry> {
		self.entries.get(id)
	}

	pub fn profile(&self, id: &UserId) -> Option<&UserProfile> {
		self.profiles.get(id)
	}

	pub fn total_unseen(&self) -> u32 {
		self.entries.values().map(|e| e.unseen).sum()
	}

	/// Direct messages, most recent activity first; never-used chats last.
	pub fn direct_view(&self) -> Vec<&ChatListEntry> {
		let mut v: Vec<&ChatListEntry> = self.entries.values().filter(|e| e.chat.is_direct()).collect();
		v.sort_by(|a, b| {
			b.last_message_at
				.unwrap_or(i64::MIN)
				.cmp(&a.last_message_at.unwrap_or(i64::MIN))
				.then_with(|| a.display_name.cmp(&b.display_name))
		});
		v
	}

	/// Groups ordered by their latest message or creation, whichever is newer.
	pub fn group_view(&self) -> Vec<&ChatListEntry> {
		let mut v: Vec<&ChatListEntry> = self.entries.values().filter(|e| !e.chat.is_direct()).collect();
		v.sort_by(|a, b| {
			b.group_sort_key()
				.cmp(&a.group_sort_key())
				.then_with(|| a.chat.id.cmp(&b.chat.id))
		});
		v
	}

	fn label(&self, chat: &ChatEntity) -> String {
		if !chat.is_direct() {
			return chat.name.clone();
		}
		match chat.other_member(&self.me) {
			Some(other) => self
				.profiles
				.get(other)
				.map(|p| p.name.clone())
				.unwrap_or_else(|| other.to_string()),
			None => chat.name.clone(),
		}
	}

	fn remember_sender(&mut self, id: &UserId, info: &SenderInfo) {
		self.profiles
			.entry(id.clone())
			.and_modify(|p| {
				p.name = info.name.clone();
				p.image = info.image.clone();
			})
			.or_insert_with(|| UserProfile {
				id: id.clone(),
				name: info.name.clone(),
				email: String::new(),
				image: info.image.clone(),
			});
	}

	/// Rebuild from a snapshot. Unseen counts survive; labels are recomputed
	/// from the snapshot's member profiles.
	pub fn load_snapshot(&mut self, snapshot: &ChatListResponse) {
		self.me = snapshot.me.id.clone();
		self.profiles.insert(snapshot.me.id.clone(), snapshot.me.clone());
		for summary in &snapshot.chats {
			for p in &summary.members {
				self.profiles.insert(p.id.clone(), p.clone());
			}
		}

		let mut previous = std::mem::take(&mut self.entries);
		for summary in &snapshot.chats {
			let mut entry = ChatListEntry::new(summary.chat.clone(), self.label(&summary.chat));
			if let Some(old) = previous.remove(&summary.chat.id) {
				entry.unseen = old.unseen;
				entry.counted = old.counted;
			}
			if let Some(m) = &summary.last_message {
				entry.note_message(m);
			}
			self.entries.insert(summary.chat.id.clone(), entry);
		}

		if self.active.as_ref().is_some_and(|id| !self.entries.contains_key(id)) {
			self.active = None;
		}
		debug!(chats = self.entries.len(), dropped = previous.len(), "chat list snapshot loaded");
	}

	pub fn apply_event(&mut self, event: &ChatEvent) -> ListChange {
		match event {
			ChatEvent::IncomingMessage(m) => self.on_message(m, None),
			ChatEvent::NewMessage(n) => self.on_message(&n.message, n.sender.as_ref()),
			ChatEvent::MessageEdited(n) => match self.entries.get_mut(&n.message.chat_id) {
				Some(entry) if entry.last_message_id.as_ref() == Some(&n.message.id) => {
					entry.preview = Some(n.message.text.clone());
					ListChange::Updated(n.message.chat_id.clone())
				}
				_ => ListChange::Unchanged,
			},
			ChatEvent::MemberRemoved(c) if c.member_id == self.me => self.remove(&c.chat.id),
			ChatEvent::MemberAdded(c) | ChatEvent::MemberRemoved(c) => self.upsert(c.chat.clone()),
			ChatEvent::ChatCreated(c) | ChatEvent::ChatRefreshed(c) | ChatEvent::ChatRenamed(c) => {
				self.upsert(c.clone())
			}
			ChatEvent::Lagged { .. } => ListChange::NeedsRefresh,
			ChatEvent::FriendAdded(_) | ChatEvent::FriendRemoved(_) | ChatEvent::IncomingFriendRequest(_) => {
				ListChange::Unchanged
			}
		}
	}

	/// Record a message against its chat, synthesizing a direct-message
	/// placeholder when the chat is not in the list yet.
	pub fn on_message(&mut self, message: &Message, sender: Option<&SenderInfo>) -> ListChange {
		if let Some(info) = sender {
			self.remember_sender(&message.sender_id, info);
		}

		let chat_id = message.chat_id.clone();
		let created = !self.entries.contains_key(&chat_id);
		if created && message.sender_id == self.me {
			// Nothing to label a placeholder with; the snapshot brings the chat.
			return ListChange::NeedsRefresh;
		}
		if created {
			let chat = match DirectPair::parse(&chat_id) {
				Ok(pair) => ChatEntity::direct(chat_id.clone(), pair.a, pair.b),
				Err(_) => ChatEntity::direct(chat_id.clone(), self.me.clone(), message.sender_id.clone()),
			};
			let mut entry = ChatListEntry::new(chat.clone(), self.label(&chat));
			entry.placeholder = true;
			self.entries.insert(chat_id.clone(), entry);
		}

		let counts = self.active.as_ref() != Some(&chat_id) && message.sender_id != self.me;
		let Some(entry) = self.entries.get_mut(&chat_id) else {
			return ListChange::Unchanged;
		};
		entry.note_message(message);
		if counts && entry.counted.insert(message.id.clone()) {
			entry.unseen += 1;
		}

		if created {
			ListChange::Placeholder(chat_id)
		} else {
			ListChange::Updated(chat_id)
		}
	}

	/// Insert or refresh a chat from an authoritative entity. Direct messages
	/// keep the label they already had.
	pub fn upsert(&mut self, chat: ChatEntity) -> ListChange {
		if !chat.is_member(&self.me) {
			return self.remove(&chat.id);
		}

		let fresh = self.label(&chat);
		let id = chat.id.clone();
		match self.entries.get_mut(&id) {
			Some(entry) => {
				if !(entry.chat.is_direct() && chat.is_direct()) {
					entry.display_name = fresh;
				}
				entry.chat = chat;
				entry.placeholder = false;
			}
			None => {
				self.entries.insert(id.clone(), ChatListEntry::new(chat, fresh));
			}
		}
		ListChange::Updated(id)
	}

	pub fn remove(&mut self, id: &ChatId) -> ListChange {
		if self.active.as_ref() == Some(id) {
			self.active = None;
		}
		match self.entries.remove(id) {
			Some(_) => ListChange::Removed(id.clone()),
			None => ListChange::Unchanged,
		}
	}

	/// Make `id` the open chat and clear its unseen count.
	pub fn open(&mut self, id: &ChatId) {
		self.active = Some(id.clone());
		if let Some(entry) = self.entries.get_mut(id) {
			entry.unseen = 0;
			entry.counted.clear();
		}
	}

	pub fn close(&mut self) {
		self.active = None;
	}
}
