#![forbid(unsafe_code)]

use parley_domain::{ChatError, UserId, UserProfile};
use tracing::info;

use super::dispatcher::Dispatcher;
use super::repo::Repo;

/// Friend requests and the friendship relation that gates direct messages.
#[derive(Clone)]
pub struct Friends {
	repo: Repo,
	dispatcher: Dispatcher,
}

impl Friends {
	pub fn new(repo: Repo, dispatcher: Dispatcher) -> Self {
		Self { repo, dispatcher }
	}

	pub async fn request(&self, from: &UserId, to: &UserId) -> Result<(), ChatError> {
		if from == to {
			return Err(ChatError::validation("cannot befriend yourself"));
		}
		if self.repo.is_friend(from, to).await? {
			return Err(ChatError::conflict(format!("already friends with {to}")));
		}
		if self.repo.has_incoming_request(from, to).await? {
			return Err(ChatError::conflict(format!("{to} already sent you a request")));
		}
		if !self.repo.add_incoming_request(to, from).await? {
			return Err(ChatError::conflict(format!("request to {to} already pending")));
		}
		info!(from = %from, to = %to, "friend request sent");

		let profile = self.repo.profile_or_unknown(from).await?;
		self.dispatcher.friend_requested(&profile, to).await;
		Ok(())
	}

	/// Accept a pending request from `from`, making both users friends.
	pub async fn accept(&self, me: &UserId, from: &UserId) -> Result<UserProfile, ChatError> {
		if !self.repo.remove_incoming_request(me, from).await? {
			return Err(ChatError::not_found(format!("no pending request from {from}")));
		}
		self.repo.add_friendship(me, from).await?;
		info!(a = %me, b = %from, "friendship added");

		let mine = self.repo.profile_or_unknown(me).await?;
		let theirs = self.repo.profile_or_unknown(from).await?;
		self.dispatcher.friendship_added(&mine, &theirs).await;
		Ok(theirs)
	}

	pub async fn deny(&self, me: &UserId, from: &UserId) -> Result<(), ChatError> {
		if !self.repo.remove_incoming_request(me, from).await? {
			return Err(ChatError::not_found(format!("no pending request from {from}")));
		}
		info!(to = %me, from = %from, "friend request denied");
		Ok(())
	}

	/// Existing direct chats are left in place.
	pub async fn remove(&self, me: &UserId, other: &UserId) -> Result<(), ChatError> {
		if !self.repo.remove_friendship(me, other).await? {
			return Err(ChatError::not_found(format!("not friends with {other}")));
		}
		info!(a = %me, b = %other, "friendship removed");

		let mine = self.repo.profile_or_unknown(me).await?;
		let theirs = self.repo.profile_or_unknown(other).await?;
		self.dispatcher.friendship_removed(&mine, &theirs).await;
		Ok(())
	}

	pub async fn list(&self, me: &UserId) -> Result<Vec<UserProfile>, ChatError> {
		let mut out = Vec::new();
		for id in self.repo.friend_ids(me).await? {
			out.push(self.repo.profile_or_unknown(&id).await?);
		}
		Ok(out)
	}

	pub async fn pending(&self, me: &UserId) -> Result<Vec<UserProfile>, ChatError> {
		let mut out = Vec::new();
		for id in self.repo.incoming_requests(me).await? {
			out.push(self.repo.profile_or_unknown(&id).await?);
		}
		Ok(out)
	}
}
