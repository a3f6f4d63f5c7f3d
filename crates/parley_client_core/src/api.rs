#![forbid(unsafe_code)]

//! HTTP adapters: request/response calls and the SSE channel transport.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parley_domain::{Channel, ChatEntity, ChatId, Message, UserId, UserProfile};
use parley_protocol::api::{
	AddMemberRequest, ChatListResponse, ChatResponse, CreateChatRequest, EditMessageRequest, ErrorBody, FriendRequest,
	FriendsResponse, MessageResponse, MessagesResponse, ProfileResponse, RenameChatRequest, SendMessageRequest,
	UpdateProfileRequest,
};
use parley_protocol::{EventEnvelope, try_decode_event_from_buffer};
use serde::de::{DeserializeOwned, IgnoredAny};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::ChannelTransport;
use crate::{ClientConfig, ClientCoreError};

/// Operations the session needs from the server.
#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
	async fn me(&self) -> Result<UserProfile, ClientCoreError>;
	async fn update_profile(&self, req: &UpdateProfileRequest) -> Result<UserProfile, ClientCoreError>;

	async fn list_chats(&self) -> Result<ChatListResponse, ClientCoreError>;
	/// Newest first.
	async fn list_messages(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<Message>, ClientCoreError>;
	async fn send_message(&self, req: &SendMessageRequest) -> Result<Message, ClientCoreError>;
	async fn edit_message(&self, req: &EditMessageRequest) -> Result<Message, ClientCoreError>;

	async fn create_chat(&self, req: &CreateChatRequest) -> Result<ChatEntity, ClientCoreError>;
	async fn add_member(&self, chat_id: &ChatId, member: &UserId) -> Result<ChatEntity, ClientCoreError>;
	async fn remove_member(&self, chat_id: &ChatId, member: &UserId) -> Result<ChatEntity, ClientCoreError>;
	async fn rename_chat(&self, chat_id: &ChatId, name: &str) -> Result<ChatEntity, ClientCoreError>;

	async fn friends(&self) -> Result<FriendsResponse, ClientCoreError>;
	async fn request_friend(&self, user: &UserId) -> Result<(), ClientCoreError>;
	async fn accept_friend(&self, user: &UserId) -> Result<UserProfile, ClientCoreError>;
	async fn deny_friend(&self, user: &UserId) -> Result<(), ClientCoreError>;
	async fn remove_friend(&self, user: &UserId) -> Result<(), ClientCoreError>;
}

fn http_client(cfg: &ClientConfig) -> Result<reqwest::Client, ClientCoreError> {
	Ok(reqwest::Client::builder().connect_timeout(cfg.connect_timeout).build()?)
}

async fn read_error(resp: reqwest::Response) -> ClientCoreError {
	let status = resp.status();
	match resp.bytes().await {
		Ok(body) => match serde_json::from_slice::<ErrorBody>(&body) {
			Ok(e) => ClientCoreError::Api(e.into_chat_error()),
			Err(_) => ClientCoreError::Http(format!("unexpected status {status}")),
		},
		Err(e) => ClientCoreError::Http(format!("status {status}: {e}")),
	}
}

#[derive(Clone)]
pub struct HttpChatApi {
	client: reqwest::Client,
	base_url: String,
	token: String,
	timeout: Duration,
}

impl HttpChatApi {
	pub fn new(cfg: &ClientConfig) -> Result<Self, ClientCoreError> {
		Ok(Self {
			client: http_client(cfg)?,
			base_url: cfg.base_url.trim_end_matches('/').to_string(),
			token: cfg.token.clone(),
			timeout: cfg.request_timeout,
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{path}", self.base_url)
	}

	async fn call<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, ClientCoreError> {
		let resp = req.bearer_auth(&self.token).timeout(self.timeout).send().await?;
		if !resp.status().is_success() {
			return Err(read_error(resp).await);
		}
		Ok(resp.json::<T>().await?)
	}
}

fn seg(s: &str) -> std::borrow::Cow<'_, str> {
	urlencoding::encode(s)
}

#[async_trait]
impl ChatApi for HttpChatApi {
	async fn me(&self) -> Result<UserProfile, ClientCoreError> {
		let r: ProfileResponse = self.call(self.client.get(self.url("/api/me"))).await?;
		Ok(r.profile)
	}

	async fn update_profile(&self, req: &UpdateProfileRequest) -> Result<UserProfile, ClientCoreError> {
		let r: ProfileResponse = self.call(self.client.put(self.url("/api/me")).json(req)).await?;
		Ok(r.profile)
	}

	async fn list_chats(&self) -> Result<ChatListResponse, ClientCoreError> {
		self.call(self.client.get(self.url("/api/chats"))).await
	}

	async fn list_messages(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<Message>, ClientCoreError> {
		let path = format!("/api/chats/{}/messages?limit={limit}", seg(chat_id.as_str()));
		let r: MessagesResponse = self.call(self.client.get(self.url(&path))).await?;
		Ok(r.messages)
	}

	async fn send_message(&self, req: &SendMessageRequest) -> Result<Message, ClientCoreError> {
		let r: MessageResponse = self.call(self.client.post(self.url("/api/messages")).json(req)).await?;
		Ok(r.message)
	}

	async fn edit_message(&self, req: &EditMessageRequest) -> Result<Message, ClientCoreError> {
		let r: MessageResponse = self.call(self.client.patch(self.url("/api/messages")).json(req)).await?;
		Ok(r.message)
	}

	async fn create_chat(&self, req: &CreateChatRequest) -> Result<ChatEntity, ClientCoreError> {
		let r: ChatResponse = self.call(self.client.post(self.url("/api/chats")).json(req)).await?;
		Ok(r.chat)
	}

	async fn add_member(&self, chat_id: &ChatId, member: &UserId) -> Result<ChatEntity, ClientCoreError> {
		let path = format!("/api/chats/{}/members", seg(chat_id.as_str()));
		let body = AddMemberRequest {
			member_id: member.clone(),
		};
		let r: ChatResponse = self.call(self.client.post(self.url(&path)).json(&body)).await?;
		Ok(r.chat)
	}

	async fn remove_member(&self, chat_id: &ChatId, member: &UserId) -> Result<ChatEntity, ClientCoreError> {
		let path = format!("/api/chats/{}/members/{}", seg(chat_id.as_str()), seg(member.as_str()));
		let r: ChatResponse = self.call(self.client.delete(self.url(&path))).await?;
		Ok(r.chat)
	}

	async fn rename_chat(&self, chat_id: &ChatId, name: &str) -> Result<ChatEntity, ClientCoreError> {
		let path = format!("/api/chats/{}/rename", seg(chat_id.as_str()));
		let body = RenameChatRequest { name: name.to_string() };
		let r: ChatResponse = self.call(self.client.post(self.url(&path)).json(&body)).await?;
		Ok(r.chat)
	}

	async fn friends(&self) -> Result<FriendsResponse, ClientCoreError> {
		self.call(self.client.get(self.url("/api/friends"))).await
	}

	async fn request_friend(&self, user: &UserId) -> Result<(), ClientCoreError> {
		let body = FriendRequest { user_id: user.clone() };
		let _: IgnoredAny = self
			.call(self.client.post(self.url("/api/friends/requests")).json(&body))
			.await?;
		Ok(())
	}

	async fn accept_friend(&self, user: &UserId) -> Result<UserProfile, ClientCoreError> {
		let body = FriendRequest { user_id: user.clone() };
		let r: ProfileResponse = self
			.call(self.client.post(self.url("/api/friends/requests/accept")).json(&body))
			.await?;
		Ok(r.profile)
	}

	async fn deny_friend(&self, user: &UserId) -> Result<(), ClientCoreError> {
		let body = FriendRequest { user_id: user.clone() };
		let _: IgnoredAny = self
			.call(self.client.post(self.url("/api/friends/requests/deny")).json(&body))
			.await?;
		Ok(())
	}

	async fn remove_friend(&self, user: &UserId) -> Result<(), ClientCoreError> {
		let path = format!("/api/friends/{}", seg(user.as_str()));
		let _: IgnoredAny = self.call(self.client.delete(self.url(&path))).await?;
		Ok(())
	}
}

/// Event streams over `GET /api/events?channel=...`.
pub struct SseTransport {
	client: reqwest::Client,
	base_url: String,
	token: String,
	max_event_bytes: usize,
	queue_capacity: usize,
}

impl SseTransport {
	pub fn new(cfg: &ClientConfig) -> Result<Self, ClientCoreError> {
		Ok(Self {
			client: http_client(cfg)?,
			base_url: cfg.base_url.trim_end_matches('/').to_string(),
			token: cfg.token.clone(),
			max_event_bytes: cfg.max_event_bytes,
			queue_capacity: cfg.event_queue_capacity.max(1),
		})
	}
}

#[async_trait]
impl ChannelTransport for SseTransport {
	async fn open(&self, channel: &Channel) -> Result<mpsc::Receiver<EventEnvelope>, ClientCoreError> {
		let url = reqwest::Url::parse_with_params(
			&format!("{}/api/events", self.base_url),
			&[("channel", channel.to_string())],
		)
		.map_err(|e| ClientCoreError::Protocol(format!("invalid events url: {e}")))?;

		let mut resp = self.client.get(url).bearer_auth(&self.token).send().await?;
		if !resp.status().is_success() {
			return Err(read_error(resp).await);
		}

		let (tx, rx) = mpsc::channel(self.queue_capacity);
		let max = self.max_event_bytes;
		let channel = channel.clone();
		tokio::spawn(async move {
			let mut buf = BytesMut::new();
			loop {
				match resp.chunk().await {
					Ok(Some(chunk)) => {
						buf.extend_from_slice(&chunk);
						loop {
							match try_decode_event_from_buffer(&mut buf, max) {
								Ok(Some(env)) => {
									if tx.send(env).await.is_err() {
										return;
									}
								}
								Ok(None) => break,
								Err(e) => {
									warn!(channel = %channel, error = %e, "dropping event stream");
									return;
								}
							}
						}
					}
					Ok(None) => {
						debug!(channel = %channel, "event stream closed by server");
						return;
					}
					Err(e) => {
						debug!(channel = %channel, error = %e, "event stream read failed");
						return;
					}
				}
			}
		});

		Ok(rx)
	}
}
