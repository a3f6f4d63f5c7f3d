#![forbid(unsafe_code)]

//! Fan-out of committed mutations to broker channels.
//!
//! Every method runs after the store write it describes. Publish failures are
//! logged and counted; they never undo or fail the mutation.

use std::sync::Arc;

use parley_domain::{Channel, ChatEntity, Message, UserId, UserProfile};
use parley_protocol::{ChatEvent, MembershipChange, MessageNotice, SenderInfo};
use tracing::{debug, warn};

use crate::broker::Broker;

#[derive(Clone)]
pub struct Dispatcher {
	broker: Arc<dyn Broker>,
}

impl Dispatcher {
	pub fn new(broker: Arc<dyn Broker>) -> Self {
		Self { broker }
	}

	/// Canonical message to the conversation, plus a notice to every other member.
	pub async fn message_sent(&self, chat: &ChatEntity, message: &Message, sender: &UserProfile) {
		self.publish(Channel::Chat(chat.id.clone()), ChatEvent::IncomingMessage(message.clone()))
			.await;

		let notice = MessageNotice {
			message: message.clone(),
			sender: Some(SenderInfo::from(sender)),
		};
		for member in chat.members_except(&message.sender_id) {
			self.publish(Channel::UserChats(member.clone()), ChatEvent::NewMessage(notice.clone()))
				.await;
		}
	}

	/// Edited message to the conversation and to every other member.
	pub async fn message_edited(&self, chat: &ChatEntity, message: &Message, editor: &UserProfile) {
		let notice = MessageNotice {
			message: message.clone(),
			sender: Some(SenderInfo::from(editor)),
		};
		self.publish(Channel::Chat(chat.id.clone()), ChatEvent::MessageEdited(notice.clone()))
			.await;
		for member in chat.members_except(&message.sender_id) {
			self.publish(Channel::UserChats(member.clone()), ChatEvent::MessageEdited(notice.clone()))
				.await;
		}
	}

	/// Every member's notification channel, creator included.
	pub async fn chat_created(&self, chat: &ChatEntity) {
		for member in &chat.member_ids {
			self.publish(Channel::UserChats(member.clone()), ChatEvent::ChatCreated(chat.clone()))
				.await;
		}
	}

	pub async fn member_added(&self, chat: &ChatEntity, member: &UserId) {
		let change = MembershipChange {
			member_id: member.clone(),
			chat: chat.clone(),
		};
		self.publish(Channel::Chat(chat.id.clone()), ChatEvent::MemberAdded(change.clone()))
			.await;
		self.publish(Channel::UserChats(member.clone()), ChatEvent::MemberAdded(change))
			.await;
		self.refresh_members(chat).await;
	}

	/// `chat` is the post-removal entity; `member` is no longer in it.
	pub async fn member_removed(&self, chat: &ChatEntity, member: &UserId) {
		let change = MembershipChange {
			member_id: member.clone(),
			chat: chat.clone(),
		};
		self.publish(Channel::Chat(chat.id.clone()), ChatEvent::MemberRemoved(change.clone()))
			.await;
		self.publish(Channel::UserChats(member.clone()), ChatEvent::MemberRemoved(change))
			.await;
		self.refresh_members(chat).await;
	}

	pub async fn chat_renamed(&self, chat: &ChatEntity) {
		self.publish(Channel::Chat(chat.id.clone()), ChatEvent::ChatRenamed(chat.clone()))
			.await;
		self.refresh_members(chat).await;
	}

	pub async fn friend_requested(&self, from: &UserProfile, to: &UserId) {
		self.publish(
			Channel::IncomingFriendRequests(to.clone()),
			ChatEvent::IncomingFriendRequest(from.clone()),
		)
		.await;
	}

	pub async fn friendship_added(&self, a: &UserProfile, b: &UserProfile) {
		self.publish(Channel::UserFriends(a.id.clone()), ChatEvent::FriendAdded(b.clone()))
			.await;
		self.publish(Channel::UserFriends(b.id.clone()), ChatEvent::FriendAdded(a.clone()))
			.await;
	}

	pub async fn friendship_removed(&self, a: &UserProfile, b: &UserProfile) {
		self.publish(Channel::UserFriends(a.id.clone()), ChatEvent::FriendRemoved(b.clone()))
			.await;
		self.publish(Channel::UserFriends(b.id.clone()), ChatEvent::FriendRemoved(a.clone()))
			.await;
	}

	async fn refresh_members(&self, chat: &ChatEntity) {
		for member in &chat.member_ids {
			self.publish(Channel::UserChats(member.clone()), ChatEvent::ChatRefreshed(chat.clone()))
				.await;
		}
	}

	async fn publish(&self, channel: Channel, event: ChatEvent) {
		let kind = event.kind().as_str();
		match self.broker.publish(&channel, event).await {
			Ok(()) => {
				metrics::counter!("parley_events_published_total", "event" => kind).increment(1);
				debug!(%channel, event = kind, "published");
			}
			Err(e) => {
				metrics::counter!("parley_publish_failures_total", "event" => kind).increment(1);
				warn!(%channel, event = kind, error = %e, "publish failed; mutation already committed");
			}
		}
	}
}
