#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parley_domain::{Channel, UserId};
use parley_protocol::{ChatEvent, EventEnvelope};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::{Broker, BrokerError};

/// In-process broker that fans out events to per-channel subscriber queues.
#[derive(Debug, Clone)]
pub struct ChannelHub {
	inner: Arc<Mutex<Inner>>,
	closed: Arc<AtomicBool>,
	cfg: ChannelHubConfig,
}

#[derive(Debug, Clone)]
pub struct ChannelHubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for ChannelHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum HubItem {
	Event(Box<EventEnvelope>),

	/// The subscriber fell behind and `dropped` events were discarded.
	Lagged { dropped: u64 },
}

impl HubItem {
	/// Envelope to put on the wire for this item.
	pub fn into_envelope(self, channel: &str) -> EventEnvelope {
		match self {
			HubItem::Event(env) => *env,
			HubItem::Lagged { dropped } => EventEnvelope::new(channel, ChatEvent::Lagged { dropped }),
		}
	}
}

impl ChannelHub {
	pub fn new(cfg: ChannelHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			closed: Arc::new(AtomicBool::new(false)),
			cfg,
		}
	}

	/// Subscribe on behalf of `owner`. A `member_removed` for `owner` on a chat
	/// channel ends this stream right after delivering that event.
	pub async fn subscribe(&self, channel: &Channel, owner: &UserId) -> mpsc::Receiver<HubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);
		let name = channel.to_string();

		let mut inner = self.inner.lock().await;
		let entry = inner.channels.entry(name.clone()).or_default();
		entry.prune_closed();
		entry.subscribers.push(Subscriber {
			tx,
			owner: owner.clone(),
			pending_lag: 0,
		});

		if self.cfg.debug_logs {
			debug!(channel = %name, subs = entry.subscribers.len(), "channel hub: subscribed");
		}

		rx
	}

	/// Drop bookkeeping for a channel whose subscribers have all gone away.
	pub async fn prune_channel(&self, channel: &Channel) {
		let name = channel.to_string();
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.channels.get_mut(&name) {
			entry.prune_closed();
			if entry.subscribers.is_empty() {
				inner.channels.remove(&name);
			}
		}
	}

	/// Stop accepting publishes; existing subscriber queues are closed.
	pub async fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
		let mut inner = self.inner.lock().await;
		inner.channels.clear();
	}

	pub async fn subscriber_count(&self, channel: &Channel) -> usize {
		let inner = self.inner.lock().await;
		inner
			.channels
			.get(&channel.to_string())
			.map(|e| e.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
			.unwrap_or(0)
	}

	async fn publish_item(&self, name: String, item: HubItem, evict: Option<&UserId>) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.channels.get_mut(&name) else {
			return;
		};

		entry.prune_closed();

		let mut dropped_total: u64 = 0;
		for sub in entry.subscribers.iter_mut() {
			match sub.tx.try_send(item.clone()) {
				Ok(()) => {
					if sub.pending_lag > 0
						&& sub
							.tx
							.try_send(HubItem::Lagged {
								dropped: sub.pending_lag,
							})
							.is_ok()
					{
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		if let Some(user) = evict {
			let before = entry.subscribers.len();
			entry.subscribers.retain(|s| &s.owner != user);
			let evicted = before - entry.subscribers.len();
			if evicted > 0 {
				debug!(channel = %name, user = %user, evicted, "channel hub: removed member's streams ended");
			}
		}

		entry.prune_closed();
		if entry.subscribers.is_empty() {
			inner.channels.remove(&name);
		}

		if dropped_total > 0 {
			metrics::counter!("parley_hub_dropped_total").increment(dropped_total);
			if self.cfg.debug_logs {
				debug!(
					channel = %name,
					dropped = dropped_total,
					"channel hub: dropped due to full subscriber queues"
				);
			}
		}
	}
}

#[async_trait::async_trait]
impl Broker for ChannelHub {
	async fn publish(&self, channel: &Channel, event: ChatEvent) -> Result<(), BrokerError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(BrokerError::Closed);
		}
		let evict = match (channel, &event) {
			(Channel::Chat(_), ChatEvent::MemberRemoved(change)) => Some(change.member_id.clone()),
			_ => None,
		};
		let name = channel.to_string();
		let env = EventEnvelope::new(name.clone(), event);
		self.publish_item(name, HubItem::Event(Box::new(env)), evict.as_ref()).await;
		Ok(())
	}
}

#[derive(Debug, Default)]
struct Inner {
	channels: HashMap<String, ChannelEntry>,
}

#[derive(Debug, Default)]
struct ChannelEntry {
	subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	tx: mpsc::Sender<HubItem>,
	/// User the stream was opened for.
	owner: UserId,
	/// Events dropped since the last lag marker went out.
	pending_lag: u64,
}

impl ChannelEntry {
	fn prune_closed(&mut self) {
		self.subscribers.retain(|s| !s.tx.is_closed());
	}
}
