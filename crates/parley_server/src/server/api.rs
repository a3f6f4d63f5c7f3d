#![forbid(unsafe_code)]

//! HTTP JSON API and the server-sent-events relay.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt as _, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parley_domain::{Channel, ChatError, ChatId, UserId};
use parley_protocol::api::{
	AddMemberRequest, ChatResponse, CreateChatRequest, EditMessageRequest, ErrorBody, FriendRequest,
	FriendsResponse, MessageResponse, MessagesResponse, ProfileResponse, RenameChatRequest, SendMessageRequest,
	UpdateProfileRequest,
};
use parley_protocol::{encode_event, encode_keepalive};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::auth::{SessionProvider, bearer_token};
use crate::broker::ChannelHub;
use crate::engine::ChatService;

pub type ApiBody = UnsyncBoxBody<Bytes, Infallible>;

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct ApiSettings {
	pub max_body_bytes: usize,
	pub keepalive: Duration,
	pub max_event_size: usize,
}

impl Default for ApiSettings {
	fn default() -> Self {
		Self {
			max_body_bytes: 64 * 1024,
			keepalive: Duration::from_secs(15),
			max_event_size: parley_protocol::DEFAULT_MAX_EVENT_SIZE,
		}
	}
}

pub struct ApiState {
	pub service: Arc<ChatService>,
	pub sessions: Arc<dyn SessionProvider>,
	pub hub: ChannelHub,
	pub settings: ApiSettings,
}

/// Bind the API listener and serve it in the background.
///
/// Returns the bound address, which differs from `bind` when port 0 is used.
pub async fn spawn_api_server(bind: SocketAddr, state: Arc<ApiState>) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
	let listener = TcpListener::bind(bind).await?;
	let local = listener.local_addr()?;
	info!(%local, "api listening");

	let handle = tokio::spawn(async move {
		if let Err(err) = run_api_server(listener, state).await {
			warn!(error = %err, "api server stopped");
		}
	});
	Ok((local, handle))
}

async fn run_api_server(listener: TcpListener, state: Arc<ApiState>) -> anyhow::Result<()> {
	loop {
		let (stream, peer) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = Arc::clone(&state);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, Arc::clone(&state)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(%peer, error = %err, "api connection closed with error");
			}
		});
	}
}

enum Route {
	Me,
	Chats,
	ChatMessages(ChatId),
	ChatMembers(ChatId),
	ChatMember(ChatId, UserId),
	ChatRename(ChatId),
	Messages,
	Friends,
	FriendRequests,
	FriendAccept,
	FriendDeny,
	Friend(UserId),
	Events,
}

impl Route {
	fn label(&self) -> &'static str {
		match self {
			Route::Me => "me",
			Route::Chats => "chats",
			Route::ChatMessages(_) => "chat_messages",
			Route::ChatMembers(_) => "chat_members",
			Route::ChatMember(..) => "chat_member",
			Route::ChatRename(_) => "chat_rename",
			Route::Messages => "messages",
			Route::Friends => "friends",
			Route::FriendRequests => "friend_requests",
			Route::FriendAccept => "friend_accept",
			Route::FriendDeny => "friend_deny",
			Route::Friend(_) => "friend",
			Route::Events => "events",
		}
	}
}

fn decode_segment(s: &str) -> Result<String, ChatError> {
	urlencoding::decode(s)
		.map(|c| c.into_owned())
		.map_err(|e| ChatError::validation(format!("bad path segment: {e}")))
}

fn parse_route(path: &str) -> Result<Option<Route>, ChatError> {
	let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
	let Some(("api", rest)) = segments.split_first().map(|(h, r)| (*h, r)) else {
		return Ok(None);
	};

	let route = match rest {
		["me"] => Route::Me,
		["chats"] => Route::Chats,
		["chats", id, "messages"] => Route::ChatMessages(ChatId::new(decode_segment(id)?)?),
		["chats", id, "members"] => Route::ChatMembers(ChatId::new(decode_segment(id)?)?),
		["chats", id, "members", member] => Route::ChatMember(
			ChatId::new(decode_segment(id)?)?,
			UserId::new(decode_segment(member)?)?,
		),
		["chats", id, "rename"] => Route::ChatRename(ChatId::new(decode_segment(id)?)?),
		["messages"] => Route::Messages,
		["friends"] => Route::Friends,
		["friends", "requests"] => Route::FriendRequests,
		["friends", "requests", "accept"] => Route::FriendAccept,
		["friends", "requests", "deny"] => Route::FriendDeny,
		["friends", id] => Route::Friend(UserId::new(decode_segment(id)?)?),
		["events"] => Route::Events,
		_ => return Ok(None),
	};
	Ok(Some(route))
}

fn query_param(uri: &hyper::Uri, name: &str) -> Option<String> {
	url::form_urlencoded::parse(uri.query()?.as_bytes())
		.find(|(k, _)| k == name)
		.map(|(_, v)| v.into_owned())
}

fn status_for(err: &ChatError) -> StatusCode {
	match err {
		ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
		ChatError::NotFound(_) => StatusCode::NOT_FOUND,
		ChatError::Validation(_) => StatusCode::BAD_REQUEST,
		ChatError::Conflict(_) => StatusCode::CONFLICT,
		ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

fn full(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<ApiBody> {
	let mut resp = Response::new(Full::new(Bytes::from(body)).boxed_unsync());
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
	resp
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<ApiBody> {
	match serde_json::to_vec(value) {
		Ok(body) => full(status, "application/json", body),
		Err(e) => error_response(&ChatError::storage(format!("encode response: {e}"))),
	}
}

fn error_response(err: &ChatError) -> Response<ApiBody> {
	let body = serde_json::to_vec(&ErrorBody::from(err)).unwrap_or_default();
	full(status_for(err), "application/json", body)
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>, limit: usize) -> Result<T, ChatError> {
	let body = Limited::new(req.into_body(), limit)
		.collect()
		.await
		.map_err(|e| ChatError::validation(format!("read body: {e}")))?
		.to_bytes();
	serde_json::from_slice(&body).map_err(|e| ChatError::validation(format!("invalid json: {e}")))
}

async fn handle(req: Request<Incoming>, state: Arc<ApiState>) -> Result<Response<ApiBody>, Infallible> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let (label, result) = match parse_route(&path) {
		Ok(Some(route)) => {
			let label = route.label();
			(label, dispatch(route, req, &state).await)
		}
		Ok(None) => ("unknown", Err(ChatError::not_found(format!("no route for {path}")))),
		Err(e) => ("invalid", Err(e)),
	};

	let resp = result.unwrap_or_else(|e| {
		if matches!(e, ChatError::Storage(_)) {
			warn!(%method, %path, error = %e, "request failed");
		} else {
			debug!(%method, %path, error = %e, "request rejected");
		}
		error_response(&e)
	});

	metrics::counter!(
		"parley_api_requests_total",
		"route" => label,
		"status" => resp.status().as_u16().to_string()
	)
	.increment(1);
	Ok(resp)
}

fn method_not_allowed() -> Result<Response<ApiBody>, ChatError> {
	let mut resp = error_response(&ChatError::validation("method not allowed"));
	*resp.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
	Ok(resp)
}

async fn dispatch(route: Route, req: Request<Incoming>, state: &ApiState) -> Result<Response<ApiBody>, ChatError> {
	let auth_header = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
	let token = bearer_token(auth_header).ok_or_else(|| ChatError::unauthorized("missing bearer token"))?;
	let me = state.sessions.authenticate(token)?;

	let service = &state.service;
	let limit = state.settings.max_body_bytes;
	let method = req.method().clone();

	match (route, method) {
		(Route::Me, Method::GET) => {
			let profile = service.repo().profile_or_unknown(&me).await?;
			Ok(json(StatusCode::OK, &ProfileResponse { profile }))
		}
		(Route::Me, Method::PUT) => {
			let body: UpdateProfileRequest = read_json(req, limit).await?;
			let profile = service.upsert_profile(&me, &body.name, body.image).await?;
			Ok(json(StatusCode::OK, &ProfileResponse { profile }))
		}
		(Route::Chats, Method::GET) => Ok(json(StatusCode::OK, &service.list_chats(&me).await?)),
		(Route::Chats, Method::POST) => {
			let body: CreateChatRequest = read_json(req, limit).await?;
			let chat = service.membership().create_group(&me, body.member_ids, body.name).await?;
			Ok(json(StatusCode::CREATED, &ChatResponse { chat }))
		}
		(Route::ChatMessages(chat_id), Method::GET) => {
			let page = query_param(req.uri(), "limit")
				.and_then(|v| v.parse::<usize>().ok())
				.unwrap_or(DEFAULT_PAGE_LIMIT)
				.clamp(1, MAX_PAGE_LIMIT);
			let messages = service.messages().list(&me, &chat_id, page).await?;
			Ok(json(StatusCode::OK, &MessagesResponse { messages }))
		}
		(Route::ChatMembers(chat_id), Method::POST) => {
			let body: AddMemberRequest = read_json(req, limit).await?;
			let chat = service.membership().add_member(&me, &chat_id, &body.member_id).await?;
			Ok(json(StatusCode::OK, &ChatResponse { chat }))
		}
		(Route::ChatMember(chat_id, member), Method::DELETE) => {
			let chat = service.membership().remove_member(&me, &chat_id, &member).await?;
			Ok(json(StatusCode::OK, &ChatResponse { chat }))
		}
		(Route::ChatRename(chat_id), Method::POST) => {
			let body: RenameChatRequest = read_json(req, limit).await?;
			let chat = service.membership().rename(&me, &chat_id, &body.name).await?;
			Ok(json(StatusCode::OK, &ChatResponse { chat }))
		}
		(Route::Messages, Method::POST) => {
			let body: SendMessageRequest = read_json(req, limit).await?;
			let message = service
				.messages()
				.send(&me, &body.chat_id, &body.text, body.client_ref)
				.await?;
			Ok(json(StatusCode::CREATED, &MessageResponse { message }))
		}
		(Route::Messages, Method::PATCH) => {
			let body: EditMessageRequest = read_json(req, limit).await?;
			let message = service
				.messages()
				.edit(&me, &body.chat_id, &body.message_id, &body.text)
				.await?;
			Ok(json(StatusCode::OK, &MessageResponse { message }))
		}
		(Route::Friends, Method::GET) => {
			let friends = service.friends().list(&me).await?;
			let incoming = service.friends().pending(&me).await?;
			Ok(json(StatusCode::OK, &FriendsResponse { friends, incoming }))
		}
		(Route::FriendRequests, Method::POST) => {
			let body: FriendRequest = read_json(req, limit).await?;
			service.friends().request(&me, &body.user_id).await?;
			Ok(full(StatusCode::ACCEPTED, "application/json", b"{}".to_vec()))
		}
		(Route::FriendAccept, Method::POST) => {
			let body: FriendRequest = read_json(req, limit).await?;
			let profile = service.friends().accept(&me, &body.user_id).await?;
			Ok(json(StatusCode::OK, &ProfileResponse { profile }))
		}
		(Route::FriendDeny, Method::POST) => {
			let body: FriendRequest = read_json(req, limit).await?;
			service.friends().deny(&me, &body.user_id).await?;
			Ok(full(StatusCode::OK, "application/json", b"{}".to_vec()))
		}
		(Route::Friend(other), Method::DELETE) => {
			service.friends().remove(&me, &other).await?;
			Ok(full(StatusCode::OK, "application/json", b"{}".to_vec()))
		}
		(Route::Events, Method::GET) => {
			let name = query_param(req.uri(), "channel")
				.ok_or_else(|| ChatError::validation("missing channel query parameter"))?;
			let channel = Channel::parse(&name)?;
			service.authorize_subscription(&me, &channel).await?;
			Ok(event_stream(state, &me, channel).await)
		}
		_ => method_not_allowed(),
	}
}

/// Subscribe before responding so nothing published after the response is missed.
async fn event_stream(state: &ApiState, me: &UserId, channel: Channel) -> Response<ApiBody> {
	let mut hub_rx = state.hub.subscribe(&channel, me).await;
	let hub = state.hub.clone();
	let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(16);
	let name = channel.to_string();
	let keepalive = state.settings.keepalive;
	let max_event_size = state.settings.max_event_size;

	debug!(channel = %name, "event stream opened");
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(keepalive);
		tick.tick().await;
		loop {
			let frame = tokio::select! {
				item = hub_rx.recv() => match item {
					Some(item) => match encode_event(&item.into_envelope(&name), max_event_size) {
						Ok(frame) => frame,
						Err(e) => {
							warn!(channel = %name, error = %e, "dropping unencodable event");
							continue;
						}
					},
					None => break,
				},
				_ = tick.tick() => encode_keepalive(),
				_ = out_tx.closed() => break,
			};
			if out_tx.send(Bytes::from(frame)).await.is_err() {
				break;
			}
		}
		drop(hub_rx);
		hub.prune_channel(&channel).await;
		let remaining = hub.subscriber_count(&channel).await;
		debug!(
			channel = %name,
			remaining = remaining,
			"event stream closed"
		);
	});

	let stream = futures::stream::poll_fn(move |cx| {
		out_rx
			.poll_recv(cx)
			.map(|next| next.map(|bytes| Ok::<_, Infallible>(Frame::data(bytes))))
	});

	let mut resp = Response::new(StreamBody::new(stream).boxed_unsync());
	let headers = resp.headers_mut();
	headers.insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/event-stream"));
	headers.insert(CACHE_CONTROL, hyper::header::HeaderValue::from_static("no-cache"));
	resp
}
