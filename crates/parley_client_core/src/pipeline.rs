#![forbid(unsafe_code)]

//! Per-chat message list with optimistic sends.
//!
//! Local records carry a temporary id until the canonical copy arrives, either
//! as the send response or as a broadcast event, whichever comes first. Both
//! paths run through `on_canonical`, so a message is never shown twice.

use std::collections::HashMap;

use parley_domain::{ChatError, ChatId, Message, MessageId, UserId};
use parley_protocol::api::{EditMessageRequest, SendMessageRequest};
use tracing::debug;

use crate::ClientCoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
	/// Waiting for the server.
	Pending,
	/// Persisted, or canonical.
	Sent,
	/// The server rejected it or could not be reached. Retry is available.
	Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
	pub message: Message,
	pub status: DeliveryStatus,
}

impl MessageRecord {
	fn canonical(message: Message) -> Self {
		Self {
			message,
			status: DeliveryStatus::Sent,
		}
	}

	/// Still carries a temporary id.
	pub fn is_local(&self) -> bool {
		self.message.id.is_temporary()
	}
}

/// Request to persist, tagged with the optimistic record it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSend {
	pub temp_id: MessageId,
	pub request: SendMessageRequest,
}

/// Edit-mode state for one of the user's own messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditDraft {
	pub message_id: MessageId,
	pub text: String,
	/// Why the previous attempt failed.
	pub error: Option<String>,
}

/// What `on_canonical` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
	/// Different chat.
	Ignored,
	/// Already present under its canonical id.
	Duplicate,
	/// Took the place of this optimistic record.
	Replaced { temp_id: MessageId },
	Inserted,
}

pub struct MessagePipeline {
	me: UserId,
	chat_id: ChatId,
	match_window_ms: i64,
	/// Newest first.
	records: Vec<MessageRecord>,
	draft: Option<EditDraft>,
	/// Text each in-flight edit replaced, for rollback.
	edits_in_flight: HashMap<MessageId, String>,
}

impl MessagePipeline {
	pub fn new(me: UserId, chat_id: ChatId, match_window_ms: u64) -> Self {
		Self {
			me,
			chat_id,
			match_window_ms: i64::try_from(match_window_ms).unwrap_or(i64::MAX),
			records: Vec::new(),
			draft: None,
			edits_in_flight: HashMap::new(),
		}
	}

	pub fn chat_id(&self) -> &ChatId {
		&self.chat_id
	}

	pub fn records(&self) -> &[MessageRecord] {
		&self.records
	}

	pub fn draft(&self) -> Option<&EditDraft> {
		self.draft.as_ref()
	}

	pub fn record(&self, id: &MessageId) -> Option<&MessageRecord> {
		self.records.iter().find(|r| &r.message.id == id)
	}

	fn position(&self, id: &MessageId) -> Option<usize> {
		self.records.iter().position(|r| &r.message.id == id)
	}

	/// Replace the list with fetched history (newest first), keeping local
	/// records the history does not account for and canonical records that
	/// arrived after the page was read.
	pub fn load_history(&mut self, history: Vec<Message>) {
		let newest = history.iter().map(|m| m.timestamp).max();
		let (locals, live): (Vec<MessageRecord>, Vec<MessageRecord>) =
			self.records.drain(..).partition(MessageRecord::is_local);

		let mut canonical: Vec<MessageRecord> = Vec::with_capacity(history.len());
		for m in history {
			if m.chat_id != self.chat_id || canonical.iter().any(|r| r.message.id == m.id) {
				continue;
			}
			canonical.push(MessageRecord::canonical(m));
		}
		for r in live {
			let after_page = newest.is_none_or(|t| r.message.timestamp > t);
			if after_page && !canonical.iter().any(|c| c.message.id == r.message.id) {
				canonical.push(r);
			}
		}
		canonical.sort_by(|a, b| b.message.timestamp.cmp(&a.message.timestamp));

		let mut claimed = vec![false; canonical.len()];
		let mut kept = Vec::new();
		for local in locals {
			let hit = canonical
				.iter()
				.enumerate()
				.filter(|(i, _)| !claimed[*i])
				.filter(|(_, c)| self.corresponds(&local, &c.message))
				.min_by_key(|(_, c)| (c.message.timestamp - local.message.timestamp).abs())
				.map(|(i, _)| i);
			match hit {
				Some(i) => claimed[i] = true,
				None => kept.push(local),
			}
		}

		kept.extend(canonical);
		self.records = kept;
	}

	/// Append an optimistic record and return the request that persists it.
	pub fn send(&mut self, text: &str, now_ms: i64) -> Result<OutgoingSend, ClientCoreError> {
		let text = text.trim();
		if text.is_empty() {
			return Err(ChatError::validation("message text must not be empty").into());
		}

		let temp_id = MessageId::temporary();
		self.records.insert(
			0,
			MessageRecord {
				message: Message {
					id: temp_id.clone(),
					chat_id: self.chat_id.clone(),
					sender_id: self.me.clone(),
					text: text.to_string(),
					timestamp: now_ms,
					client_ref: None,
				},
				status: DeliveryStatus::Pending,
			},
		);

		Ok(self.outgoing(temp_id, text.to_string()))
	}

	fn outgoing(&self, temp_id: MessageId, text: String) -> OutgoingSend {
		OutgoingSend {
			request: SendMessageRequest {
				chat_id: self.chat_id.clone(),
				text,
				client_ref: Some(temp_id.clone()),
			},
			temp_id,
		}
	}

	/// Resubmit a failed record under the same temporary id.
	pub fn retry(&mut self, temp_id: &MessageId, now_ms: i64) -> Option<OutgoingSend> {
		let record = self.records.iter_mut().find(|r| &r.message.id == temp_id)?;
		if record.status != DeliveryStatus::Failed {
			return None;
		}
		record.status = DeliveryStatus::Pending;
		record.message.timestamp = now_ms;
		let text = record.message.text.clone();
		Some(self.outgoing(temp_id.clone(), text))
	}

	/// Outcome of a persist call.
	pub fn on_send_result(&mut self, temp_id: &MessageId, result: Result<Message, ClientCoreError>) {
		match result {
			Ok(canonical) => {
				if let Some(record) = self.records.iter_mut().find(|r| &r.message.id == temp_id) {
					record.status = DeliveryStatus::Sent;
				}
				self.on_canonical(canonical);
			}
			Err(e) => {
				debug!(temp_id = %temp_id, error = %e, "send failed");
				if let Some(record) = self.records.iter_mut().find(|r| &r.message.id == temp_id) {
					if record.status == DeliveryStatus::Pending {
						record.status = DeliveryStatus::Failed;
					}
				}
			}
		}
	}

	/// A canonical message for this chat, from any source.
	pub fn on_canonical(&mut self, message: Message) -> Reconciled {
		if message.chat_id != self.chat_id {
			return Reconciled::Ignored;
		}
		if self.position(&message.id).is_some() {
			return Reconciled::Duplicate;
		}

		let candidate = match &message.client_ref {
			// An echoed reference names its record whatever state it is in: a
			// send that timed out may still have been stored.
			Some(client_ref) => self.position(client_ref).filter(|i| self.records[*i].is_local()),
			None => self
				.records
				.iter()
				.enumerate()
				.filter(|(_, r)| r.is_local() && r.status != DeliveryStatus::Failed)
				.filter(|(_, r)| self.corresponds(r, &message))
				.min_by_key(|(_, r)| (r.message.timestamp - message.timestamp).abs())
				.map(|(i, _)| i),
		};

		if let Some(i) = candidate {
			let temp_id = self.records[i].message.id.clone();
			self.records[i] = MessageRecord::canonical(message);
			return Reconciled::Replaced { temp_id };
		}

		self.records.insert(0, MessageRecord::canonical(message));
		Reconciled::Inserted
	}

	/// Whether `canonical` is the persisted copy of `local`.
	///
	/// An echoed client reference decides on its own; without one the match
	/// falls back to sender, text and a timestamp window.
	fn corresponds(&self, local: &MessageRecord, canonical: &Message) -> bool {
		if let Some(r) = &canonical.client_ref {
			return r == &local.message.id;
		}
		local.message.sender_id == canonical.sender_id
			&& local.message.text == canonical.text
			&& (local.message.timestamp - canonical.timestamp).abs() < self.match_window_ms
	}

	/// Enter edit mode for one of the user's own canonical messages.
	pub fn begin_edit(&mut self, message_id: &MessageId) -> Result<&EditDraft, ClientCoreError> {
		let record = self
			.record(message_id)
			.ok_or_else(|| ChatError::not_found(format!("message {message_id}")))?;
		if record.message.sender_id != self.me {
			return Err(ChatError::unauthorized("only the sender can edit a message").into());
		}
		if record.is_local() {
			return Err(ChatError::conflict("message is not persisted yet").into());
		}

		let text = record.message.text.clone();
		Ok(self.draft.insert(EditDraft {
			message_id: message_id.clone(),
			text,
			error: None,
		}))
	}

	pub fn cancel_edit(&mut self) {
		self.draft = None;
	}

	/// Apply the draft optimistically.
	///
	/// Returns `Ok(None)` when the text is unchanged: edit mode closes and
	/// nothing is sent.
	pub fn submit_edit(&mut self, text: &str) -> Result<Option<EditMessageRequest>, ClientCoreError> {
		let draft = self
			.draft
			.as_ref()
			.ok_or_else(|| ClientCoreError::Protocol("not editing a message".to_string()))?;
		let text = text.trim();
		if text.is_empty() {
			return Err(ChatError::validation("message text must not be empty").into());
		}

		let message_id = draft.message_id.clone();
		let Some(i) = self.position(&message_id) else {
			self.draft = None;
			return Err(ChatError::not_found(format!("message {message_id}")).into());
		};

		self.draft = None;
		if self.records[i].message.text == text {
			return Ok(None);
		}

		let original = std::mem::replace(&mut self.records[i].message.text, text.to_string());
		self.edits_in_flight.entry(message_id.clone()).or_insert(original);
		Ok(Some(EditMessageRequest {
			chat_id: self.chat_id.clone(),
			message_id,
			text: text.to_string(),
		}))
	}

	/// Outcome of an edit call. Failure restores the old text and reopens the
	/// draft with the error attached.
	pub fn on_edit_result(&mut self, message_id: &MessageId, result: Result<Message, ClientCoreError>) {
		match result {
			Ok(message) => {
				self.on_message_edited(message);
			}
			Err(e) => {
				let Some(original) = self.edits_in_flight.remove(message_id) else {
					return;
				};
				if let Some(i) = self.position(message_id) {
					self.records[i].message.text = original.clone();
				}
				self.draft = Some(EditDraft {
					message_id: message_id.clone(),
					text: original,
					error: Some(e.to_string()),
				});
			}
		}
	}

	/// Authoritative edit. Returns whether the visible text changed.
	pub fn on_message_edited(&mut self, message: Message) -> bool {
		if message.chat_id != self.chat_id {
			return false;
		}
		self.edits_in_flight.remove(&message.id);
		let Some(i) = self.position(&message.id) else {
			return false;
		};
		if self.records[i].message.text == message.text {
			return false;
		}
		self.records[i].message.text = message.text;
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).expect("uid")
	}

	fn chat() -> ChatId {
		ChatId::new("alice--bob").expect("chat id")
	}

	fn pipeline() -> MessagePipeline {
		MessagePipeline::new(uid("alice"), chat(), 2000)
	}

	fn canonical(id: &str, sender: &str, text: &str, ts: i64, client_ref: Option<MessageId>) -> Message {
		Message {
			id: MessageId::new(id).expect("message id"),
			chat_id: chat(),
			sender_id: uid(sender),
			text: text.to_string(),
			timestamp: ts,
			client_ref,
		}
	}

	#[test]
	fn send_prepends_pending_record() {
		let mut p = pipeline();
		p.on_canonical(canonical("m1", "bob", "hey", 10, None));
		let out = p.send("  hello  ", 1_000).expect("send");

		assert_eq!(p.records().len(), 2);
		let first = &p.records()[0];
		assert_eq!(first.message.id, out.temp_id);
		assert_eq!(first.message.text, "hello");
		assert_eq!(first.status, DeliveryStatus::Pending);
		assert!(first.is_local());
		assert_eq!(out.request.client_ref.as_ref(), Some(&out.temp_id));
	}

	#[test]
	fn empty_send_is_rejected_without_a_record() {
		let mut p = pipeline();
		assert!(p.send("   ", 1).is_err());
		assert!(p.records().is_empty());
	}

	#[test]
	fn response_then_event_leaves_one_record() {
		let mut p = pipeline();
		let out = p.send("hello", 1_000).expect("send");
		let canon = canonical("m1", "alice", "hello", 1_050, Some(out.temp_id.clone()));

		p.on_send_result(&out.temp_id, Ok(canon.clone()));
		assert_eq!(p.on_canonical(canon), Reconciled::Duplicate);

		assert_eq!(p.records().len(), 1);
		assert_eq!(p.records()[0].message.id.as_str(), "m1");
		assert_eq!(p.records()[0].status, DeliveryStatus::Sent);
	}

	#[test]
	fn event_before_response_replaces_in_place() {
		let mut p = pipeline();
		p.on_canonical(canonical("m0", "bob", "older", 500, None));
		let out = p.send("hello", 1_000).expect("send");

		let canon = canonical("m1", "alice", "hello", 1_200, None);
		assert_eq!(
			p.on_canonical(canon.clone()),
			Reconciled::Replaced {
				temp_id: out.temp_id.clone()
			}
		);
		p.on_send_result(&out.temp_id, Ok(canon));

		let ids: Vec<&str> = p.records().iter().map(|r| r.message.id.as_str()).collect();
		assert_eq!(ids, vec!["m1", "m0"]);
	}

	#[test]
	fn heuristic_respects_the_window() {
		let mut p = pipeline();
		p.send("hello", 1_000).expect("send");

		let late = canonical("m1", "alice", "hello", 3_000, None);
		assert_eq!(p.on_canonical(late), Reconciled::Inserted);
		assert_eq!(p.records().len(), 2);
	}

	#[test]
	fn heuristic_picks_closest_timestamp() {
		let mut p = pipeline();
		let first = p.send("same", 1_000).expect("send");
		let second = p.send("same", 1_500).expect("send");

		let canon = canonical("m1", "alice", "same", 1_450, None);
		assert_eq!(
			p.on_canonical(canon),
			Reconciled::Replaced {
				temp_id: second.temp_id.clone()
			}
		);
		assert!(p.record(&first.temp_id).is_some());
	}

	#[test]
	fn client_ref_mismatch_does_not_fall_back_to_heuristic() {
		let mut p = pipeline();
		p.send("hello", 1_000).expect("send");

		let other_device = canonical("m1", "alice", "hello", 1_010, Some(MessageId::temporary()));
		assert_eq!(p.on_canonical(other_device), Reconciled::Inserted);
		assert_eq!(p.records().len(), 2);
	}

	#[test]
	fn other_senders_never_replace_local_records() {
		let mut p = pipeline();
		p.send("hello", 1_000).expect("send");
		assert_eq!(
			p.on_canonical(canonical("m1", "bob", "hello", 1_000, None)),
			Reconciled::Inserted
		);
	}

	#[test]
	fn failure_marks_record_and_retry_reuses_temp_id() {
		let mut p = pipeline();
		p.on_canonical(canonical("m0", "bob", "older", 10, None));
		let out = p.send("hello", 1_000).expect("send");

		p.on_send_result(&out.temp_id, Err(ClientCoreError::Http("connection refused".into())));
		assert_eq!(p.records()[0].status, DeliveryStatus::Failed);

		// Failed records are left out of the time-window match.
		let stray = canonical("m9", "alice", "hello", 1_001, None);
		assert_eq!(p.on_canonical(stray), Reconciled::Inserted);

		let again = p.retry(&out.temp_id, 5_000).expect("retry");
		assert_eq!(again.temp_id, out.temp_id);
		assert_eq!(again.request.text, "hello");

		let record = p.record(&out.temp_id).expect("record");
		assert_eq!(record.status, DeliveryStatus::Pending);
		assert_eq!(record.message.timestamp, 5_000);
		assert!(p.retry(&out.temp_id, 6_000).is_none());
	}

	#[test]
	fn echo_of_a_timed_out_send_replaces_the_failed_record() {
		let mut p = pipeline();
		let out = p.send("hello", 1_000).expect("send");
		p.on_send_result(&out.temp_id, Err(ClientCoreError::Http("timed out".into())));
		assert_eq!(p.records()[0].status, DeliveryStatus::Failed);

		let stored = canonical("m1", "alice", "hello", 1_020, Some(out.temp_id.clone()));
		assert_eq!(
			p.on_canonical(stored),
			Reconciled::Replaced {
				temp_id: out.temp_id.clone()
			}
		);

		assert_eq!(p.records().len(), 1);
		assert_eq!(p.records()[0].message.id.as_str(), "m1");
		assert_eq!(p.records()[0].status, DeliveryStatus::Sent);
		assert!(p.retry(&out.temp_id, 2_000).is_none());
	}

	#[test]
	fn unmatched_canonical_is_prepended() {
		let mut p = pipeline();
		let out = p.send("mine", 1_000).expect("send");

		assert_eq!(
			p.on_canonical(canonical("m1", "bob", "theirs", 900, None)),
			Reconciled::Inserted
		);

		let ids: Vec<&str> = p.records().iter().map(|r| r.message.id.as_str()).collect();
		assert_eq!(ids, vec!["m1", out.temp_id.as_str()]);
	}

	#[test]
	fn ignores_other_chats() {
		let mut p = pipeline();
		let mut m = canonical("m1", "bob", "hi", 1, None);
		m.chat_id = ChatId::new("g1").expect("chat id");
		assert_eq!(p.on_canonical(m), Reconciled::Ignored);
		assert!(p.records().is_empty());
	}

	#[test]
	fn history_keeps_unmatched_locals_on_top() {
		let mut p = pipeline();
		let matched = p.send("persisted", 1_000).expect("send");
		let failed = p.send("lost", 1_100).expect("send");
		p.on_send_result(&failed.temp_id, Err(ClientCoreError::Http("boom".into())));

		p.load_history(vec![
			canonical("m2", "alice", "persisted", 1_010, Some(matched.temp_id.clone())),
			canonical("m1", "bob", "earlier", 900, None),
		]);

		let ids: Vec<&str> = p.records().iter().map(|r| r.message.id.as_str()).collect();
		assert_eq!(ids, vec![failed.temp_id.as_str(), "m2", "m1"]);
	}

	#[test]
	fn history_keeps_events_newer_than_the_page() {
		let mut p = pipeline();
		p.on_canonical(canonical("m3", "bob", "live", 3_000, None));
		p.on_canonical(canonical("m0", "bob", "stale", 100, None));

		p.load_history(vec![canonical("m1", "bob", "paged", 2_000, None)]);

		let ids: Vec<&str> = p.records().iter().map(|r| r.message.id.as_str()).collect();
		assert_eq!(ids, vec!["m3", "m1"]);
	}

	#[test]
	fn edit_success_and_noop() {
		let mut p = pipeline();
		p.on_canonical(canonical("m1", "alice", "helo", 1, None));

		p.begin_edit(&MessageId::new("m1").expect("id")).expect("begin");
		assert_eq!(p.submit_edit("helo").expect("submit"), None);
		assert!(p.draft().is_none());

		let id = MessageId::new("m1").expect("id");
		p.begin_edit(&id).expect("begin");
		let req = p.submit_edit("hello").expect("submit").expect("request");
		assert_eq!(req.text, "hello");
		assert_eq!(p.records()[0].message.text, "hello");

		p.on_edit_result(&id, Ok(canonical("m1", "alice", "hello", 1, None)));
		assert_eq!(p.records()[0].message.text, "hello");
		assert!(p.draft().is_none());
	}

	#[test]
	fn edit_failure_restores_text_and_reopens_draft() {
		let mut p = pipeline();
		let id = MessageId::new("m1").expect("id");
		p.on_canonical(canonical("m1", "alice", "original", 1, None));

		p.begin_edit(&id).expect("begin");
		p.submit_edit("changed").expect("submit");
		p.on_edit_result(&id, Err(ChatError::unauthorized("nope").into()));

		assert_eq!(p.records()[0].message.text, "original");
		let draft = p.draft().expect("draft");
		assert_eq!(draft.text, "original");
		assert!(draft.error.is_some());
	}

	#[test]
	fn cannot_edit_others_or_local_messages() {
		let mut p = pipeline();
		p.on_canonical(canonical("m1", "bob", "theirs", 1, None));
		assert!(p.begin_edit(&MessageId::new("m1").expect("id")).is_err());

		let out = p.send("mine", 2).expect("send");
		assert!(p.begin_edit(&out.temp_id).is_err());
	}

	#[test]
	fn authoritative_edit_from_another_device() {
		let mut p = pipeline();
		p.on_canonical(canonical("m1", "alice", "a", 1, None));
		assert!(p.on_message_edited(canonical("m1", "alice", "b", 1, None)));
		assert!(!p.on_message_edited(canonical("m1", "alice", "b", 1, None)));
		assert_eq!(p.records()[0].message.text, "b");
	}

	proptest! {
		#[test]
		fn canonical_delivery_is_idempotent(
			deliveries in proptest::collection::vec((0u8..8, 0i64..10_000), 0..40)
		) {
			let mut p = pipeline();
			let mut distinct = std::collections::BTreeSet::new();
			for (n, ts) in &deliveries {
				let id = format!("m{n}");
				distinct.insert(id.clone());
				p.on_canonical(canonical(&id, "bob", "x", *ts, None));
			}

			prop_assert_eq!(p.records().len(), distinct.len());
			let mut seen = std::collections::HashSet::new();
			for r in p.records() {
				prop_assert!(seen.insert(r.message.id.clone()));
			}
		}

		#[test]
		fn optimistic_then_canonical_within_window_is_one_record(
			sent_at in 0i64..1_000_000,
			skew in -1_999i64..1_999,
			echo in any::<bool>(),
		) {
			let mut p = pipeline();
			let out = p.send("hi", sent_at).expect("send");
			let client_ref = echo.then(|| out.temp_id.clone());
			p.on_canonical(canonical("m1", "alice", "hi", sent_at + skew, client_ref));

			prop_assert_eq!(p.records().len(), 1);
			prop_assert_eq!(p.records()[0].message.id.as_str(), "m1");
		}
	}
}
