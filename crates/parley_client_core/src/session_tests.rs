use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parley_domain::{ChatEntity, UserProfile};
use parley_protocol::api::{
	ChatSummary, CreateChatRequest, EditMessageRequest, FriendsResponse, SendMessageRequest, UpdateProfileRequest,
};
use parley_protocol::{MessageNotice, SenderInfo};

use super::*;
use crate::DeliveryStatus;

fn uid(s: &str) -> UserId {
	UserId::new(s).expect("uid")
}

fn cid(s: &str) -> ChatId {
	ChatId::new(s).expect("chat id")
}

fn profile(id: &str, name: &str) -> UserProfile {
	UserProfile {
		id: uid(id),
		name: name.to_string(),
		email: String::new(),
		image: None,
	}
}

struct FakeApi {
	snapshot: Mutex<ChatListResponse>,
	fail_sends: AtomicBool,
	list_calls: AtomicUsize,
	next_id: AtomicUsize,
	clock: AtomicI64,
}

impl FakeApi {
	fn new(me: UserProfile, chats: Vec<ChatSummary>) -> Arc<Self> {
		Arc::new(Self {
			snapshot: Mutex::new(ChatListResponse {
				me,
				chats,
				match_window_ms: 2000,
			}),
			fail_sends: AtomicBool::new(false),
			list_calls: AtomicUsize::new(0),
			next_id: AtomicUsize::new(1),
			clock: AtomicI64::new(1_000),
		})
	}

	fn unsupported<T>() -> Result<T, ClientCoreError> {
		Err(ClientCoreError::Other("unsupported in fake".into()))
	}
}

#[async_trait]
impl ChatApi for FakeApi {
	async fn me(&self) -> Result<UserProfile, ClientCoreError> {
		Ok(self.snapshot.lock().expect("lock").me.clone())
	}

	async fn update_profile(&self, _req: &UpdateProfileRequest) -> Result<UserProfile, ClientCoreError> {
		Self::unsupported()
	}

	async fn list_chats(&self) -> Result<ChatListResponse, ClientCoreError> {
		self.list_calls.fetch_add(1, Ordering::SeqCst);
		Ok(self.snapshot.lock().expect("lock").clone())
	}

	async fn list_messages(&self, _chat_id: &ChatId, _limit: usize) -> Result<Vec<Message>, ClientCoreError> {
		Ok(Vec::new())
	}

	async fn send_message(&self, req: &SendMessageRequest) -> Result<Message, ClientCoreError> {
		if self.fail_sends.load(Ordering::SeqCst) {
			return Err(ClientCoreError::Http("connection reset".into()));
		}
		let n = self.next_id.fetch_add(1, Ordering::SeqCst);
		let me = self.snapshot.lock().expect("lock").me.id.clone();
		Ok(Message {
			id: MessageId::new(format!("srv-{n}")).expect("id"),
			chat_id: req.chat_id.clone(),
			sender_id: me,
			text: req.text.clone(),
			timestamp: self.clock.fetch_add(10, Ordering::SeqCst),
			client_ref: req.client_ref.clone(),
		})
	}

	async fn edit_message(&self, _req: &EditMessageRequest) -> Result<Message, ClientCoreError> {
		Self::unsupported()
	}

	async fn create_chat(&self, _req: &CreateChatRequest) -> Result<ChatEntity, ClientCoreError> {
		Self::unsupported()
	}

	async fn add_member(&self, _chat_id: &ChatId, _member: &UserId) -> Result<ChatEntity, ClientCoreError> {
		Self::unsupported()
	}

	async fn remove_member(&self, _chat_id: &ChatId, _member: &UserId) -> Result<ChatEntity, ClientCoreError> {
		Self::unsupported()
	}

	async fn rename_chat(&self, _chat_id: &ChatId, _name: &str) -> Result<ChatEntity, ClientCoreError> {
		Self::unsupported()
	}

	async fn friends(&self) -> Result<FriendsResponse, ClientCoreError> {
		Self::unsupported()
	}

	async fn request_friend(&self, _user: &UserId) -> Result<(), ClientCoreError> {
		Self::unsupported()
	}

	async fn accept_friend(&self, _user: &UserId) -> Result<UserProfile, ClientCoreError> {
		Self::unsupported()
	}

	async fn deny_friend(&self, _user: &UserId) -> Result<(), ClientCoreError> {
		Self::unsupported()
	}

	async fn remove_friend(&self, _user: &UserId) -> Result<(), ClientCoreError> {
		Self::unsupported()
	}
}

/// One live stream per channel; tests push envelopes into it.
#[derive(Default)]
struct FakeTransport {
	streams: Mutex<HashMap<Channel, mpsc::Sender<EventEnvelope>>>,
}

#[async_trait]
impl ChannelTransport for FakeTransport {
	async fn open(&self, channel: &Channel) -> Result<mpsc::Receiver<EventEnvelope>, ClientCoreError> {
		let (tx, rx) = mpsc::channel(16);
		self.streams.lock().expect("lock").insert(channel.clone(), tx);
		Ok(rx)
	}
}

impl FakeTransport {
	async fn push(&self, channel: Channel, event: ChatEvent) {
		let mut tx = None;
		for _ in 0..200 {
			tx = self.streams.lock().expect("lock").get(&channel).cloned();
			if tx.is_some() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		let tx = tx.unwrap_or_else(|| panic!("{channel} never opened"));
		tx.send(EventEnvelope::new(channel.to_string(), event)).await.expect("push");
	}
}

fn config() -> ClientConfig {
	ClientConfig {
		reconnect: crate::ReconnectPolicy {
			base_ms: 1,
			max_ms: 5,
			reset_after: Duration::from_secs(60),
		},
		..ClientConfig::default()
	}
}

async fn tick(session: &mut ChatSession) {
	let ok = tokio::time::timeout(Duration::from_secs(2), session.tick())
		.await
		.expect("tick timed out");
	assert!(ok);
}

fn alice_with_bob() -> Arc<FakeApi> {
	FakeApi::new(
		profile("alice", "Alice"),
		vec![ChatSummary {
			chat: ChatEntity::direct(cid("alice--bob"), uid("alice"), uid("bob")),
			last_message: None,
			members: vec![profile("alice", "Alice"), profile("bob", "Bob")],
		}],
	)
}

#[tokio::test]
async fn send_is_replaced_by_the_persisted_copy() {
	let api = alice_with_bob();
	let transport = Arc::new(FakeTransport::default());
	let mut session = ChatSession::start(api.clone(), transport, &config()).await.expect("start");

	session.handle_command(PipelineCommand::Open {
		chat_id: cid("alice--bob"),
	});
	tick(&mut session).await;

	session.handle_command(PipelineCommand::Send { text: "hi bob".into() });
	let p = session.active_pipeline().expect("pipeline");
	assert_eq!(p.records()[0].status, DeliveryStatus::Pending);

	tick(&mut session).await;
	let p = session.active_pipeline().expect("pipeline");
	assert_eq!(p.records().len(), 1);
	assert_eq!(p.records()[0].message.id.as_str(), "srv-1");
	assert_eq!(p.records()[0].status, DeliveryStatus::Sent);

	let entry = session.sidebar().entry(&cid("alice--bob")).expect("entry");
	assert_eq!(entry.preview.as_deref(), Some("hi bob"));
	assert_eq!(entry.unseen, 0);
}

#[tokio::test]
async fn failed_send_can_be_retried() {
	let api = alice_with_bob();
	api.fail_sends.store(true, Ordering::SeqCst);
	let transport = Arc::new(FakeTransport::default());
	let mut session = ChatSession::start(api.clone(), transport, &config()).await.expect("start");

	session.handle_command(PipelineCommand::Open {
		chat_id: cid("alice--bob"),
	});
	tick(&mut session).await;
	session.handle_command(PipelineCommand::Send { text: "hello?".into() });
	tick(&mut session).await;

	let record = session.active_pipeline().expect("pipeline").records()[0].clone();
	assert_eq!(record.status, DeliveryStatus::Failed);

	api.fail_sends.store(false, Ordering::SeqCst);
	session.handle_command(PipelineCommand::Retry {
		temp_id: record.message.id.clone(),
	});
	tick(&mut session).await;

	let p = session.active_pipeline().expect("pipeline");
	assert_eq!(p.records().len(), 1);
	assert_eq!(p.records()[0].status, DeliveryStatus::Sent);
	assert_eq!(p.records()[0].message.text, "hello?");
}

#[tokio::test]
async fn chat_channel_event_and_response_do_not_duplicate() {
	let api = alice_with_bob();
	let transport = Arc::new(FakeTransport::default());
	let mut session = ChatSession::start(api.clone(), transport.clone(), &config()).await.expect("start");

	session.handle_command(PipelineCommand::Open {
		chat_id: cid("alice--bob"),
	});
	tick(&mut session).await;
	session.handle_command(PipelineCommand::Send { text: "once".into() });
	tick(&mut session).await;

	let persisted = session.active_pipeline().expect("pipeline").records()[0].message.clone();
	transport
		.push(Channel::Chat(cid("alice--bob")), ChatEvent::IncomingMessage(persisted))
		.await;
	tick(&mut session).await;

	assert_eq!(session.active_pipeline().expect("pipeline").records().len(), 1);
}

#[tokio::test]
async fn lag_on_notification_channel_refreshes_the_list() {
	let api = alice_with_bob();
	let transport = Arc::new(FakeTransport::default());
	let mut session = ChatSession::start(api.clone(), transport.clone(), &config()).await.expect("start");
	assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);

	transport
		.push(Channel::UserChats(uid("alice")), ChatEvent::Lagged { dropped: 7 })
		.await;
	tick(&mut session).await;
	tick(&mut session).await;

	assert_eq!(api.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn first_contact_shows_as_direct_message_for_recipient() {
	let api = FakeApi::new(profile("bob", "Bob"), Vec::new());
	let transport = Arc::new(FakeTransport::default());
	let mut session = ChatSession::start(api.clone(), transport.clone(), &config()).await.expect("start");

	let message = Message {
		id: MessageId::new("srv-9").expect("id"),
		chat_id: cid("alice--bob"),
		sender_id: uid("alice"),
		text: "hey".into(),
		timestamp: 5_000,
		client_ref: None,
	};
	api.snapshot.lock().expect("lock").chats.push(ChatSummary {
		chat: ChatEntity::direct(cid("alice--bob"), uid("alice"), uid("bob")),
		last_message: Some(message.clone()),
		members: vec![profile("alice", "Alice"), profile("bob", "Bob")],
	});

	transport
		.push(
			Channel::UserChats(uid("bob")),
			ChatEvent::NewMessage(MessageNotice {
				message,
				sender: Some(SenderInfo {
					name: "Alice".into(),
					image: None,
				}),
			}),
		)
		.await;
	tick(&mut session).await;
	assert!(session.sidebar().entry(&cid("alice--bob")).expect("placeholder").placeholder);

	tick(&mut session).await;
	let direct = session.sidebar().direct_view();
	assert_eq!(direct.len(), 1);
	assert_eq!(direct[0].display_name, "Alice");
	assert!(!direct[0].placeholder);
	assert_eq!(direct[0].unseen, 1);
	assert!(session.sidebar().group_view().is_empty());
}

#[tokio::test]
async fn controller_reports_stopped_session() {
	let (tx, rx) = mpsc::channel(4);
	let controller = SessionController::new(tx);
	drop(rx);
	assert!(matches!(
		controller.send_text("hi").await,
		Err(ClientCoreError::Closed(_))
	));
}
