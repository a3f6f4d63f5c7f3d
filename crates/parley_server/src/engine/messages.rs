#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};

use parley_domain::{ChatEntity, ChatError, ChatId, DirectPair, Message, MessageId, UserId};
use parley_util::time::unix_ms_now;
use tracing::{debug, info};

use super::dispatcher::Dispatcher;
use super::membership::Membership;
use super::repo::Repo;

pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Wall clock that never repeats or goes backwards within the process.
#[derive(Debug, Default)]
struct MonotonicClock {
	last: AtomicI64,
}

impl MonotonicClock {
	fn next(&self) -> i64 {
		let now = unix_ms_now();
		let mut prev = self.last.load(Ordering::Relaxed);
		loop {
			let candidate = now.max(prev + 1);
			match self
				.last
				.compare_exchange_weak(prev, candidate, Ordering::SeqCst, Ordering::Relaxed)
			{
				Ok(_) => return candidate,
				Err(actual) => prev = actual,
			}
		}
	}
}

fn validate_text(text: &str) -> Result<String, ChatError> {
	let text = text.trim();
	if text.is_empty() {
		return Err(ChatError::validation("message text must not be empty"));
	}
	if text.chars().count() > MAX_MESSAGE_CHARS {
		return Err(ChatError::validation(format!(
			"message text exceeds {MAX_MESSAGE_CHARS} characters"
		)));
	}
	Ok(text.to_string())
}

pub struct MessageLog {
	repo: Repo,
	membership: Membership,
	dispatcher: Dispatcher,
	clock: MonotonicClock,
}

impl MessageLog {
	pub fn new(repo: Repo, membership: Membership, dispatcher: Dispatcher) -> Self {
		Self {
			repo,
			membership,
			dispatcher,
			clock: MonotonicClock::default(),
		}
	}

	pub async fn send(
		&self,
		sender: &UserId,
		chat_id: &ChatId,
		text: &str,
		client_ref: Option<MessageId>,
	) -> Result<Message, ChatError> {
		let text = validate_text(text)?;
		let chat = self.membership.resolve_for_send(sender, chat_id).await?;

		let message = Message {
			id: MessageId::new_v4(),
			chat_id: chat.id.clone(),
			sender_id: sender.clone(),
			text,
			timestamp: self.clock.next(),
			client_ref: client_ref.filter(|r| r.is_temporary()),
		};
		self.repo.append_message(&message).await?;
		metrics::counter!("parley_messages_sent_total").increment(1);
		debug!(chat = %chat.id, message = %message.id, "message stored");

		let profile = self.repo.profile_or_unknown(sender).await?;
		self.dispatcher.message_sent(&chat, &message, &profile).await;
		Ok(message)
	}

	/// Replace the text of one of the editor's own messages.
	///
	/// Identical text is accepted without a write or an event.
	pub async fn edit(
		&self,
		editor: &UserId,
		chat_id: &ChatId,
		message_id: &MessageId,
		text: &str,
	) -> Result<Message, ChatError> {
		let text = validate_text(text)?;
		let chat = self.member_chat(editor, chat_id).await?;

		let existing = self
			.repo
			.find_message(&chat.id, message_id)
			.await?
			.ok_or_else(|| ChatError::not_found(format!("message {message_id}")))?;
		if &existing.sender_id != editor {
			return Err(ChatError::unauthorized("only the sender can edit a message"));
		}
		if existing.text == text {
			return Ok(existing);
		}

		let edited = Message {
			text,
			..existing.clone()
		};
		self.repo.replace_message(&existing, &edited).await?;
		metrics::counter!("parley_messages_edited_total").increment(1);
		info!(chat = %chat.id, message = %edited.id, "message edited");

		let profile = self.repo.profile_or_unknown(editor).await?;
		self.dispatcher.message_edited(&chat, &edited, &profile).await;
		Ok(edited)
	}

	/// Newest-first page of at most `limit` messages.
	pub async fn list(&self, user: &UserId, chat_id: &ChatId, limit: usize) -> Result<Vec<Message>, ChatError> {
		if self.repo.chat(chat_id).await?.is_none() {
			// a direct chat nobody has written to yet reads as empty for its pair
			let pair = DirectPair::parse(chat_id)
				.map_err(|_| ChatError::not_found(format!("chat {chat_id}")))?;
			if !pair.contains(user) {
				return Err(ChatError::unauthorized(format!("not a participant of {chat_id}")));
			}
			return Ok(Vec::new());
		}

		self.member_chat(user, chat_id).await?;
		let start = -(limit.max(1) as i64);
		let mut messages = self.repo.messages(chat_id, start, -1).await?;
		messages.reverse();
		Ok(messages)
	}

	async fn member_chat(&self, user: &UserId, chat_id: &ChatId) -> Result<ChatEntity, ChatError> {
		let chat = self.repo.require_chat(chat_id).await?;
		if !chat.is_member(user) {
			return Err(ChatError::unauthorized(format!("not a member of {chat_id}")));
		}
		Ok(chat)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clock_is_strictly_increasing() {
		let clock = MonotonicClock::default();
		let mut last = clock.next();
		for _ in 0..1000 {
			let t = clock.next();
			assert!(t > last);
			last = t;
		}
	}

	#[test]
	fn text_is_trimmed_and_bounded() {
		assert_eq!(validate_text("  hi  ").unwrap(), "hi");
		assert!(matches!(validate_text("   "), Err(ChatError::Validation(_))));
		let long = "x".repeat(MAX_MESSAGE_CHARS + 1);
		assert!(matches!(validate_text(&long), Err(ChatError::Validation(_))));
	}
}
