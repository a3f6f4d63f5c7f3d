#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{Channel, ChatError, ChatId, ChatKind, DIRECT_MESSAGE_NAME, MessageId, UserId, keys};
use parley_protocol::{ChatEvent, EventKind};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::ChatService;
use crate::broker::{Broker, BrokerError, ChannelHub, ChannelHubConfig, HubItem};
use crate::store::{MemoryStore, Store};

struct Fixture {
	store: Arc<MemoryStore>,
	hub: ChannelHub,
	service: ChatService,
}

fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid UserId")
}

fn cid(s: &str) -> ChatId {
	ChatId::new(s).expect("valid ChatId")
}

fn fixture() -> Fixture {
	let store = Arc::new(MemoryStore::new());
	let hub = ChannelHub::new(ChannelHubConfig {
		subscriber_queue_capacity: 64,
		debug_logs: false,
	});
	let service = ChatService::new(store.clone(), Arc::new(hub.clone()), 2000);
	Fixture { store, hub, service }
}

async fn befriend(f: &Fixture, a: &str, b: &str) {
	f.service
		.repo()
		.add_friendship(&uid(a), &uid(b))
		.await
		.expect("add friendship");
}

async fn next_kind(rx: &mut mpsc::Receiver<HubItem>) -> EventKind {
	let item = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("event within timeout")
		.expect("channel open");
	match item {
		HubItem::Event(env) => env.kind(),
		other => panic!("expected event, got: {other:?}"),
	}
}

async fn assert_quiet(rx: &mut mpsc::Receiver<HubItem>) {
	let got = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got.is_err(), "unexpected event: {got:?}");
}

struct FailingBroker;

#[async_trait::async_trait]
impl Broker for FailingBroker {
	async fn publish(&self, _channel: &Channel, _event: ChatEvent) -> Result<(), BrokerError> {
		Err(BrokerError::Publish("broker unavailable".to_string()))
	}
}

#[tokio::test]
async fn first_message_bootstraps_a_direct_chat() {
	let f = fixture();
	befriend(&f, "user1", "user2").await;
	let mut user2_rx = f.hub.subscribe(&Channel::UserChats(uid("user2")), &uid("user2")).await;

	let msg = f
		.service
		.messages()
		.send(&uid("user1"), &cid("user1--user2"), "hello", None)
		.await
		.expect("send");

	let chat = f
		.service
		.repo()
		.require_chat(&cid("user1--user2"))
		.await
		.expect("chat persisted");
	assert_eq!(chat.name, DIRECT_MESSAGE_NAME);
	assert_eq!(chat.member_ids, vec![uid("user1"), uid("user2")]);
	assert_eq!(chat.kind(), ChatKind::DirectMessage);
	assert_eq!(chat.created_at, None);

	let user2_chats = f.service.repo().chat_ids_for(&uid("user2")).await.expect("index");
	assert_eq!(user2_chats, vec![cid("user1--user2")]);

	match timeout(Duration::from_millis(250), user2_rx.recv())
		.await
		.expect("notice")
		.expect("open")
	{
		HubItem::Event(env) => match env.payload {
			ChatEvent::NewMessage(notice) => {
				assert_eq!(notice.message, msg);
				assert!(notice.sender.is_some());
			}
			other => panic!("expected NewMessage, got: {other:?}"),
		},
		other => panic!("expected event, got: {other:?}"),
	}
}

#[tokio::test]
async fn non_friends_cannot_open_a_direct_chat() {
	let f = fixture();

	let err = f
		.service
		.messages()
		.send(&uid("user1"), &cid("user1--user2"), "hello", None)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Unauthorized(_)));

	assert!(f.store.get(&keys::chat(&cid("user1--user2"))).await.unwrap().is_none());
	assert!(
		f.store
			.zrange(&keys::chat_messages(&cid("user1--user2")), 0, -1)
			.await
			.unwrap()
			.is_empty()
	);
}

#[tokio::test]
async fn outsiders_cannot_post_to_someone_elses_direct_chat() {
	let f = fixture();
	befriend(&f, "user1", "user2").await;

	let err = f
		.service
		.messages()
		.send(&uid("user3"), &cid("user1--user2"), "hi", None)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Unauthorized(_)));
}

#[tokio::test]
async fn unknown_non_direct_chat_is_not_found() {
	let f = fixture();
	let err = f
		.service
		.messages()
		.send(&uid("a"), &cid("no-such-chat"), "hi", None)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::NotFound(_)));
}

#[tokio::test]
async fn reversed_pair_id_does_not_open_a_second_direct_chat() {
	let f = fixture();
	befriend(&f, "alice", "bob").await;

	let err = f
		.service
		.messages()
		.send(&uid("alice"), &cid("bob--alice"), "hi", None)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::NotFound(_)), "{err:?}");
	assert!(f.store.get(&keys::chat(&cid("bob--alice"))).await.unwrap().is_none());
	assert!(matches!(
		f.service
			.authorize_subscription(&uid("alice"), &Channel::Chat(cid("bob--alice")))
			.await,
		Err(ChatError::NotFound(_))
	));

	let dm = f
		.service
		.membership()
		.create_group(&uid("alice"), vec![uid("alice"), uid("bob")], None)
		.await
		.expect("create direct chat");
	assert_eq!(dm.id, cid("alice--bob"));
	assert_eq!(
		f.service.repo().chat_ids_for(&uid("alice")).await.expect("index"),
		vec![cid("alice--bob")]
	);
}

#[tokio::test]
async fn create_group_rules() {
	let f = fixture();

	let err = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b"), uid("c")], None)
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Validation(_)));

	let err = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("b"), uid("c")], Some("Team".into()))
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Validation(_)));

	let err = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b")], Some("Pair".into()))
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Unauthorized(_)));

	let group = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b"), uid("c"), uid("b")], Some(" Team ".into()))
		.await
		.expect("create group");
	assert_eq!(group.name, "Team");
	assert_eq!(group.member_ids, vec![uid("a"), uid("b"), uid("c")]);
	assert!(group.created_at.is_some());
	assert_eq!(group.kind(), ChatKind::Group);
}

#[tokio::test]
async fn two_member_create_without_name_is_the_direct_chat() {
	let f = fixture();
	befriend(&f, "a", "b").await;

	let dm = f
		.service
		.membership()
		.create_group(&uid("b"), vec![uid("b"), uid("a")], None)
		.await
		.expect("create dm");
	assert_eq!(dm.id, cid("a--b"));
	assert!(dm.is_direct());
	assert!(dm.created_at.is_some());

	let again = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b")], None)
		.await
		.expect("existing dm");
	assert_eq!(again, dm);
}

#[tokio::test]
async fn creation_notifies_every_member_including_creator() {
	let f = fixture();
	let mut creator_rx = f.hub.subscribe(&Channel::UserChats(uid("a")), &uid("a")).await;
	let mut member_rx = f.hub.subscribe(&Channel::UserChats(uid("b")), &uid("b")).await;

	f.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b"), uid("c")], Some("Team".into()))
		.await
		.expect("create");

	assert_eq!(next_kind(&mut creator_rx).await, EventKind::ChatCreated);
	assert_eq!(next_kind(&mut member_rx).await, EventKind::ChatCreated);
	assert_quiet(&mut creator_rx).await;
}

#[tokio::test]
async fn add_member_fans_out_and_guards_conflicts() {
	let f = fixture();
	let group = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b"), uid("c")], Some("Team".into()))
		.await
		.expect("create");

	let mut chat_rx = f.hub.subscribe(&Channel::Chat(group.id.clone()), &uid("a")).await;
	let mut added_rx = f.hub.subscribe(&Channel::UserChats(uid("d")), &uid("d")).await;

	let updated = f
		.service
		.membership()
		.add_member(&uid("a"), &group.id, &uid("d"))
		.await
		.expect("add");
	assert_eq!(updated.member_ids.last(), Some(&uid("d")));

	assert_eq!(next_kind(&mut chat_rx).await, EventKind::MemberAdded);
	assert_eq!(next_kind(&mut added_rx).await, EventKind::MemberAdded);
	assert_eq!(next_kind(&mut added_rx).await, EventKind::ChatRefreshed);

	let err = f
		.service
		.membership()
		.add_member(&uid("a"), &group.id, &uid("d"))
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Conflict(_)));

	let err = f
		.service
		.membership()
		.add_member(&uid("x"), &group.id, &uid("y"))
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Unauthorized(_)));
}

#[tokio::test]
async fn unnamed_chat_must_be_named_before_growing() {
	let f = fixture();
	let solo = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a")], None)
		.await
		.expect("solo chat");

	let err = f
		.service
		.membership()
		.add_member(&uid("a"), &solo.id, &uid("b"))
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Conflict(_)));

	f.service
		.membership()
		.rename(&uid("a"), &solo.id, "Notes")
		.await
		.expect("rename");
	f.service
		.membership()
		.add_member(&uid("a"), &solo.id, &uid("b"))
		.await
		.expect("add after rename");
}

#[tokio::test]
async fn direct_chats_never_lose_members() {
	let f = fixture();
	befriend(&f, "a", "b").await;
	f.service
		.messages()
		.send(&uid("a"), &cid("a--b"), "hi", None)
		.await
		.expect("bootstrap");

	for (requester, target) in [("a", "b"), ("b", "a"), ("a", "a")] {
		let err = f
			.service
			.membership()
			.remove_member(&uid(requester), &cid("a--b"), &uid(target))
			.await
			.unwrap_err();
		assert!(matches!(err, ChatError::Conflict(_)), "{requester} removing {target}: {err:?}");
	}
}

#[tokio::test]
async fn remove_member_rules_and_fanout() {
	let f = fixture();
	let group = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b"), uid("c")], Some("Team".into()))
		.await
		.expect("create");

	let err = f
		.service
		.membership()
		.remove_member(&uid("a"), &group.id, &uid("a"))
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Conflict(_)));

	let mut removed_rx = f.hub.subscribe(&Channel::UserChats(uid("c")), &uid("c")).await;
	let mut remaining_rx = f.hub.subscribe(&Channel::UserChats(uid("b")), &uid("b")).await;

	let updated = f
		.service
		.membership()
		.remove_member(&uid("a"), &group.id, &uid("c"))
		.await
		.expect("remove");
	assert_eq!(updated.member_ids, vec![uid("a"), uid("b")]);
	assert!(f.service.repo().chat_ids_for(&uid("c")).await.unwrap().is_empty());

	assert_eq!(next_kind(&mut removed_rx).await, EventKind::MemberRemoved);
	assert_quiet(&mut removed_rx).await;
	assert_eq!(next_kind(&mut remaining_rx).await, EventKind::ChatRefreshed);

	let err = f
		.service
		.membership()
		.remove_member(&uid("c"), &group.id, &uid("b"))
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Unauthorized(_)));
}

#[tokio::test]
async fn removed_member_stops_hearing_the_chat() {
	let f = fixture();
	let group = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b"), uid("c")], Some("Team".into()))
		.await
		.expect("create");
	let chat = Channel::Chat(group.id.clone());
	let mut c_rx = f.hub.subscribe(&chat, &uid("c")).await;
	let mut b_rx = f.hub.subscribe(&chat, &uid("b")).await;

	f.service
		.membership()
		.remove_member(&uid("a"), &group.id, &uid("c"))
		.await
		.expect("remove");
	f.service
		.messages()
		.send(&uid("a"), &group.id, "members only", None)
		.await
		.expect("send");

	assert_eq!(next_kind(&mut c_rx).await, EventKind::MemberRemoved);
	let after = timeout(Duration::from_millis(250), c_rx.recv())
		.await
		.expect("stream ends promptly");
	assert!(after.is_none(), "removed member still subscribed: {after:?}");

	assert_eq!(next_kind(&mut b_rx).await, EventKind::MemberRemoved);
	assert_eq!(next_kind(&mut b_rx).await, EventKind::IncomingMessage);

	let err = f.service.authorize_subscription(&uid("c"), &chat).await.unwrap_err();
	assert!(matches!(err, ChatError::Unauthorized(_)));
}

#[tokio::test]
async fn renaming_to_the_sentinel_turns_a_pair_into_a_direct_chat() {
	let f = fixture();
	befriend(&f, "a", "b").await;
	let pair = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b")], Some("Project".into()))
		.await
		.expect("named pair");
	assert_eq!(pair.kind(), ChatKind::Group);

	let renamed = f
		.service
		.membership()
		.rename(&uid("b"), &pair.id, DIRECT_MESSAGE_NAME)
		.await
		.expect("rename");
	assert_eq!(renamed.kind(), ChatKind::DirectMessage);

	let err = f
		.service
		.membership()
		.rename(&uid("b"), &pair.id, "   ")
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Validation(_)));
}

#[tokio::test]
async fn only_the_sender_can_edit() {
	let f = fixture();
	let group = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b"), uid("c")], Some("Team".into()))
		.await
		.expect("create");
	let msg = f
		.service
		.messages()
		.send(&uid("a"), &group.id, "helo", None)
		.await
		.expect("send");

	let err = f
		.service
		.messages()
		.edit(&uid("b"), &group.id, &msg.id, "hijack")
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::Unauthorized(_)));

	let mut chat_rx = f.hub.subscribe(&Channel::Chat(group.id.clone()), &uid("a")).await;
	let edited = f
		.service
		.messages()
		.edit(&uid("a"), &group.id, &msg.id, "hello")
		.await
		.expect("edit");
	assert_eq!(edited.id, msg.id);
	assert_eq!(edited.timestamp, msg.timestamp);
	assert_eq!(next_kind(&mut chat_rx).await, EventKind::MessageEdited);

	let page = f
		.service
		.messages()
		.list(&uid("b"), &group.id, 50)
		.await
		.expect("list");
	assert_eq!(page.len(), 1);
	assert_eq!(page[0].text, "hello");

	let err = f
		.service
		.messages()
		.edit(&uid("a"), &group.id, &MessageId::new("missing").unwrap(), "x")
		.await
		.unwrap_err();
	assert!(matches!(err, ChatError::NotFound(_)));
}

#[tokio::test]
async fn list_is_newest_first_and_bounded() {
	let f = fixture();
	let group = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b"), uid("c")], Some("Team".into()))
		.await
		.expect("create");
	for text in ["one", "two", "three"] {
		f.service
			.messages()
			.send(&uid("a"), &group.id, text, None)
			.await
			.expect("send");
	}

	let page = f
		.service
		.messages()
		.list(&uid("c"), &group.id, 2)
		.await
		.expect("list");
	let texts: Vec<_> = page.iter().map(|m| m.text.as_str()).collect();
	assert_eq!(texts, vec!["three", "two"]);
}

#[tokio::test]
async fn client_ref_is_echoed_only_for_temporary_ids() {
	let f = fixture();
	let group = f
		.service
		.membership()
		.create_group(&uid("a"), vec![uid("a")], Some("Notes".into()))
		.await
		.expect("create");

	let temp = MessageId::temporary();
	let msg = f
		.service
		.messages()
		.send(&uid("a"), &group.id, "x", Some(temp.clone()))
		.await
		.expect("send");
	assert_eq!(msg.client_ref, Some(temp));
	assert!(!msg.id.is_temporary());

	let msg = f
		.service
		.messages()
		.send(&uid("a"), &group.id, "y", Some(MessageId::new("canonical").unwrap()))
		.await
		.expect("send");
	assert_eq!(msg.client_ref, None);
}

#[tokio::test]
async fn publish_failures_do_not_undo_writes() {
	let store = Arc::new(MemoryStore::new());
	let service = ChatService::new(store.clone(), Arc::new(FailingBroker), 2000);

	let group = service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("b"), uid("c")], Some("Team".into()))
		.await
		.expect("create despite broker outage");
	service
		.messages()
		.send(&uid("b"), &group.id, "still stored", None)
		.await
		.expect("send despite broker outage");

	let page = service.messages().list(&uid("a"), &group.id, 10).await.expect("list");
	assert_eq!(page.len(), 1);
	assert_eq!(page[0].text, "still stored");
}

#[tokio::test]
async fn friend_request_lifecycle() {
	let f = fixture();
	let mut requests_rx = f.hub.subscribe(&Channel::IncomingFriendRequests(uid("b")), &uid("b")).await;
	let mut a_friends_rx = f.hub.subscribe(&Channel::UserFriends(uid("a")), &uid("a")).await;

	f.service.friends().request(&uid("a"), &uid("b")).await.expect("request");
	assert_eq!(next_kind(&mut requests_rx).await, EventKind::IncomingFriendRequest);

	let err = f.service.friends().request(&uid("a"), &uid("b")).await.unwrap_err();
	assert!(matches!(err, ChatError::Conflict(_)));

	f.service.friends().accept(&uid("b"), &uid("a")).await.expect("accept");
	assert_eq!(next_kind(&mut a_friends_rx).await, EventKind::FriendAdded);
	assert!(f.service.repo().is_friend(&uid("a"), &uid("b")).await.unwrap());
	assert!(f.service.repo().is_friend(&uid("b"), &uid("a")).await.unwrap());
	assert!(f.service.friends().pending(&uid("b")).await.unwrap().is_empty());

	let err = f.service.friends().deny(&uid("b"), &uid("a")).await.unwrap_err();
	assert!(matches!(err, ChatError::NotFound(_)));

	f.service.friends().remove(&uid("a"), &uid("b")).await.expect("remove");
	assert_eq!(next_kind(&mut a_friends_rx).await, EventKind::FriendRemoved);
	assert!(!f.service.repo().is_friend(&uid("b"), &uid("a")).await.unwrap());
}

#[tokio::test]
async fn snapshot_lists_memberships_with_last_message() {
	let f = fixture();
	befriend(&f, "a", "b").await;
	f.service.upsert_profile(&uid("b"), "Bea", None).await.expect("profile");
	f.service
		.messages()
		.send(&uid("a"), &cid("a--b"), "ping", None)
		.await
		.expect("send");
	f.service
		.membership()
		.create_group(&uid("a"), vec![uid("a"), uid("c"), uid("d")], Some("Team".into()))
		.await
		.expect("create");

	let list = f.service.list_chats(&uid("a")).await.expect("list");
	assert_eq!(list.chats.len(), 2);
	assert_eq!(list.match_window_ms, 2000);

	let dm = list
		.chats
		.iter()
		.find(|s| s.chat.id == cid("a--b"))
		.expect("dm in snapshot");
	assert_eq!(dm.last_message.as_ref().map(|m| m.text.as_str()), Some("ping"));
	assert!(dm.members.iter().any(|p| p.name == "Bea"));

	let b_list = f.service.list_chats(&uid("b")).await.expect("list");
	assert_eq!(b_list.chats.len(), 1);
}

#[tokio::test]
async fn subscription_authorization() {
	let f = fixture();
	let service = &f.service;

	service
		.authorize_subscription(&uid("a"), &Channel::UserChats(uid("a")))
		.await
		.expect("own channel");
	assert!(
		service
			.authorize_subscription(&uid("a"), &Channel::UserChats(uid("b")))
			.await
			.is_err()
	);
	service
		.authorize_subscription(&uid("a"), &Channel::Chat(cid("a--b")))
		.await
		.expect("prospective direct chat");
	assert!(
		service
			.authorize_subscription(&uid("c"), &Channel::Chat(cid("a--b")))
			.await
			.is_err()
	);
}
