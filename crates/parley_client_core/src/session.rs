#![forbid(unsafe_code)]

//! Session driver: owns the chat list, per-chat pipelines and channel
//! bindings, and applies commands, events and persist outcomes in one loop.

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::{Channel, ChatId, Message, MessageId, UserId};
use parley_protocol::api::ChatListResponse;
use parley_protocol::{ChatEvent, EventEnvelope};
use parley_util::time::unix_ms_now;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::connection::{ChannelTransport, ConnectionEvent, ConnectionManager};
use crate::pipeline::{MessagePipeline, OutgoingSend};
use crate::sidebar::{ChatList, ListChange};
use crate::{ClientConfig, ClientCoreError, DEFAULT_MATCH_WINDOW_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineCommand {
	Open { chat_id: ChatId },
	Close,
	Send { text: String },
	Retry { temp_id: MessageId },
	BeginEdit { message_id: MessageId },
	SubmitEdit { text: String },
	CancelEdit,
	Refresh,
	Shutdown,
}

#[derive(Clone)]
pub struct SessionController {
	cmd_tx: mpsc::Sender<PipelineCommand>,
}

impl SessionController {
	pub fn new(cmd_tx: mpsc::Sender<PipelineCommand>) -> Self {
		Self { cmd_tx }
	}

	pub async fn command(&self, cmd: PipelineCommand) -> Result<(), ClientCoreError> {
		self.cmd_tx
			.send(cmd)
			.await
			.map_err(|_| ClientCoreError::Closed("session task is not running".to_string()))
	}

	pub async fn open(&self, chat_id: ChatId) -> Result<(), ClientCoreError> {
		self.command(PipelineCommand::Open { chat_id }).await
	}

	pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientCoreError> {
		self.command(PipelineCommand::Send { text: text.into() }).await
	}

	pub async fn retry(&self, temp_id: MessageId) -> Result<(), ClientCoreError> {
		self.command(PipelineCommand::Retry { temp_id }).await
	}

	pub async fn shutdown(&self) -> Result<(), ClientCoreError> {
		self.command(PipelineCommand::Shutdown).await
	}
}

#[derive(Debug)]
enum Outcome {
	Sent {
		chat_id: ChatId,
		temp_id: MessageId,
		result: Result<Message, ClientCoreError>,
	},
	Edited {
		chat_id: ChatId,
		message_id: MessageId,
		result: Result<Message, ClientCoreError>,
	},
	Snapshot(Result<ChatListResponse, ClientCoreError>),
	History {
		chat_id: ChatId,
		result: Result<Vec<Message>, ClientCoreError>,
	},
}

pub struct ChatSession {
	api: Arc<dyn ChatApi>,
	sidebar: ChatList,
	pipelines: HashMap<ChatId, MessagePipeline>,
	connection: ConnectionManager,
	conn_rx: mpsc::Receiver<ConnectionEvent>,
	outcome_tx: mpsc::Sender<Outcome>,
	outcome_rx: mpsc::Receiver<Outcome>,
	match_window_ms: u64,
	history_limit: usize,
}

impl ChatSession {
	/// Load the chat list and start listening on the user's notification channel.
	pub async fn start(
		api: Arc<dyn ChatApi>,
		transport: Arc<dyn ChannelTransport>,
		cfg: &ClientConfig,
	) -> Result<Self, ClientCoreError> {
		let snapshot = api.list_chats().await?;
		let me = snapshot.me.id.clone();
		let mut sidebar = ChatList::new(me.clone());
		sidebar.load_snapshot(&snapshot);

		let (mut connection, conn_rx) = ConnectionManager::new(transport, cfg.reconnect, cfg.event_queue_capacity);
		connection.bind_channel(Channel::UserChats(me.clone()));
		connection.connect();

		let (outcome_tx, outcome_rx) = mpsc::channel(64);
		let match_window_ms = match snapshot.match_window_ms {
			0 => DEFAULT_MATCH_WINDOW_MS,
			ms => ms,
		};
		info!(user = %me, chats = snapshot.chats.len(), "session started");

		Ok(Self {
			api,
			sidebar,
			pipelines: HashMap::new(),
			connection,
			conn_rx,
			outcome_tx,
			outcome_rx,
			match_window_ms,
			history_limit: cfg.history_limit,
		})
	}

	pub fn me(&self) -> &UserId {
		self.sidebar.me()
	}

	pub fn sidebar(&self) -> &ChatList {
		&self.sidebar
	}

	pub fn connection(&self) -> &ConnectionManager {
		&self.connection
	}

	pub fn pipeline(&self, chat_id: &ChatId) -> Option<&MessagePipeline> {
		self.pipelines.get(chat_id)
	}

	pub fn active_pipeline(&self) -> Option<&MessagePipeline> {
		self.sidebar.active().and_then(|id| self.pipelines.get(id))
	}

	/// Drive the session until `Shutdown` or until every controller is dropped.
	pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<PipelineCommand>, mut on_change: impl FnMut(&ChatSession)) {
		loop {
			tokio::select! {
				cmd = cmd_rx.recv() => match cmd {
					Some(cmd) => {
						if !self.handle_command(cmd) {
							break;
						}
					}
					None => break,
				},
				Some(ev) = self.conn_rx.recv() => self.handle_connection_event(ev),
				Some(outcome) = self.outcome_rx.recv() => self.handle_outcome(outcome),
			}
			on_change(&self);
		}
		self.connection.disconnect();
		info!("session stopped");
	}

	/// Wait for the next event or persist outcome and apply it.
	pub async fn tick(&mut self) -> bool {
		tokio::select! {
			Some(ev) = self.conn_rx.recv() => {
				self.handle_connection_event(ev);
				true
			}
			Some(outcome) = self.outcome_rx.recv() => {
				self.handle_outcome(outcome);
				true
			}
			else => false,
		}
	}

	/// Apply one command. Returns `false` on shutdown.
	pub fn handle_command(&mut self, cmd: PipelineCommand) -> bool {
		match cmd {
			PipelineCommand::Open { chat_id } => self.open(chat_id),
			PipelineCommand::Close => {
				if let Some(prev) = self.sidebar.active().cloned() {
					self.connection.unbind_channel(&Channel::Chat(prev));
				}
				self.sidebar.close();
			}
			PipelineCommand::Send { text } => {
				let Some(p) = self.active_pipeline_mut() else {
					warn!("send ignored: no chat is open");
					return true;
				};
				match p.send(&text, unix_ms_now()) {
					Ok(out) => self.persist(out),
					Err(e) => warn!(error = %e, "send rejected"),
				}
			}
			PipelineCommand::Retry { temp_id } => {
				let Some(p) = self.active_pipeline_mut() else {
					return true;
				};
				match p.retry(&temp_id, unix_ms_now()) {
					Some(out) => self.persist(out),
					None => debug!(temp_id = %temp_id, "nothing to retry"),
				}
			}
			PipelineCommand::BeginEdit { message_id } => {
				if let Some(p) = self.active_pipeline_mut() {
					if let Err(e) = p.begin_edit(&message_id) {
						warn!(message = %message_id, error = %e, "cannot edit");
					}
				}
			}
			PipelineCommand::SubmitEdit { text } => {
				let Some(p) = self.active_pipeline_mut() else {
					return true;
				};
				match p.submit_edit(&text) {
					Ok(Some(req)) => {
						let api = self.api.clone();
						let tx = self.outcome_tx.clone();
						tokio::spawn(async move {
							let result = api.edit_message(&req).await;
							let _ = tx
								.send(Outcome::Edited {
									chat_id: req.chat_id,
									message_id: req.message_id,
									result,
								})
								.await;
						});
					}
					Ok(None) => debug!("edit unchanged"),
					Err(e) => warn!(error = %e, "edit rejected"),
				}
			}
			PipelineCommand::CancelEdit => {
				if let Some(p) = self.active_pipeline_mut() {
					p.cancel_edit();
				}
			}
			PipelineCommand::Refresh => self.refresh_snapshot(),
			PipelineCommand::Shutdown => return false,
		}
		true
	}

	fn active_pipeline_mut(&mut self) -> Option<&mut MessagePipeline> {
		let id = self.sidebar.active()?;
		self.pipelines.get_mut(id)
	}

	fn open(&mut self, chat_id: ChatId) {
		if self.sidebar.active() == Some(&chat_id) {
			return;
		}
		if let Some(prev) = self.sidebar.active().cloned() {
			self.connection.unbind_channel(&Channel::Chat(prev));
		}
		self.sidebar.open(&chat_id);

		let me = self.me().clone();
		let window = self.match_window_ms;
		self.pipelines
			.entry(chat_id.clone())
			.or_insert_with(|| MessagePipeline::new(me, chat_id.clone(), window));
		self.connection.bind_channel(Channel::Chat(chat_id.clone()));
		self.fetch_history(chat_id);
	}

	fn persist(&self, out: OutgoingSend) {
		let api = self.api.clone();
		let tx = self.outcome_tx.clone();
		tokio::spawn(async move {
			let result = api.send_message(&out.request).await;
			let _ = tx
				.send(Outcome::Sent {
					chat_id: out.request.chat_id,
					temp_id: out.temp_id,
					result,
				})
				.await;
		});
	}

	fn refresh_snapshot(&self) {
		let api = self.api.clone();
		let tx = self.outcome_tx.clone();
		tokio::spawn(async move {
			let _ = tx.send(Outcome::Snapshot(api.list_chats().await)).await;
		});
	}

	fn fetch_history(&self, chat_id: ChatId) {
		let api = self.api.clone();
		let tx = self.outcome_tx.clone();
		let limit = self.history_limit;
		tokio::spawn(async move {
			let result = api.list_messages(&chat_id, limit).await;
			let _ = tx.send(Outcome::History { chat_id, result }).await;
		});
	}

	fn handle_connection_event(&mut self, ev: ConnectionEvent) {
		match ev {
			ConnectionEvent::Event(env) => self.apply_envelope(env),
			ConnectionEvent::Restored { channel } => {
				info!(channel = %channel, "channel restored; refreshing");
				self.refresh_snapshot();
				if let Channel::Chat(id) = channel {
					self.fetch_history(id);
				}
			}
			ConnectionEvent::Dropped {
				channel,
				reason,
				retry_in_ms,
			} => {
				debug!(channel = %channel, %reason, retry_in_ms, "channel dropped");
			}
		}
	}

	fn apply_envelope(&mut self, env: EventEnvelope) {
		match &env.payload {
			ChatEvent::IncomingMessage(m) => {
				if let Some(p) = self.pipelines.get_mut(&m.chat_id) {
					p.on_canonical(m.clone());
				}
			}
			ChatEvent::NewMessage(n) => {
				if let Some(p) = self.pipelines.get_mut(&n.message.chat_id) {
					p.on_canonical(n.message.clone());
				}
			}
			ChatEvent::MessageEdited(n) => {
				if let Some(p) = self.pipelines.get_mut(&n.message.chat_id) {
					p.on_message_edited(n.message.clone());
				}
			}
			ChatEvent::Lagged { dropped } => {
				warn!(channel = %env.channel, dropped, "events lagged; refreshing");
				if let Ok(Channel::Chat(id)) = Channel::parse(&env.channel) {
					self.fetch_history(id);
				}
			}
			_ => {}
		}

		let change = self.sidebar.apply_event(&env.payload);
		self.on_list_change(change);
	}

	fn on_list_change(&mut self, change: ListChange) {
		match change {
			ListChange::NeedsRefresh | ListChange::Placeholder(_) => self.refresh_snapshot(),
			ListChange::Removed(id) => {
				self.connection.unbind_channel(&Channel::Chat(id.clone()));
				self.pipelines.remove(&id);
			}
			ListChange::Updated(_) | ListChange::Unchanged => {}
		}
	}

	fn handle_outcome(&mut self, outcome: Outcome) {
		match outcome {
			Outcome::Sent {
				chat_id,
				temp_id,
				result,
			} => {
				if let Ok(m) = &result {
					let change = self.sidebar.on_message(m, None);
					self.on_list_change(change);
				}
				if let Some(p) = self.pipelines.get_mut(&chat_id) {
					p.on_send_result(&temp_id, result);
				}
			}
			Outcome::Edited {
				chat_id,
				message_id,
				result,
			} => {
				if let Some(p) = self.pipelines.get_mut(&chat_id) {
					p.on_edit_result(&message_id, result);
				}
			}
			Outcome::Snapshot(Ok(snapshot)) => self.sidebar.load_snapshot(&snapshot),
			Outcome::Snapshot(Err(e)) => warn!(error = %e, "chat list refresh failed"),
			Outcome::History {
				chat_id,
				result: Ok(messages),
			} => {
				if let Some(p) = self.pipelines.get_mut(&chat_id) {
					p.load_history(messages);
				}
			}
			Outcome::History {
				chat_id,
				result: Err(e),
			} => warn!(chat = %chat_id, error = %e, "history fetch failed"),
		}
	}
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod session_tests;
