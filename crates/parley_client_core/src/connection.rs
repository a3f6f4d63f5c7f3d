#![forbid(unsafe_code)]

//! Channel bindings over a reconnecting transport.
//!
//! Each bound channel gets one pump task. When its stream ends or fails to
//! open, the pump backs off and reopens; a successful reopen is announced as
//! `Restored` so the session can refresh from a snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_domain::Channel;
use parley_protocol::EventEnvelope;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ClientCoreError;

/// Opens one event stream per channel.
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
	async fn open(&self, channel: &Channel) -> Result<mpsc::Receiver<EventEnvelope>, ClientCoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
	Event(EventEnvelope),
	/// The channel's stream was reopened after a gap.
	Restored { channel: Channel },
	Dropped {
		channel: Channel,
		reason: String,
		retry_in_ms: u64,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
	pub base_ms: u64,
	pub max_ms: u64,
	/// A stream that stayed up this long resets the backoff.
	pub reset_after: Duration,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			base_ms: 500,
			max_ms: 30_000,
			reset_after: Duration::from_secs(60 * 5),
		}
	}
}

impl ReconnectPolicy {
	/// Exponential delay with +/-10% jitter.
	pub fn delay_ms(&self, attempt: u32) -> u64 {
		let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(6));
		let delay_ms = self.base_ms.saturating_mul(pow).min(self.max_ms);
		let jitter_window = (delay_ms / 10).max(1);
		let jitter_offset = rand::rng().random_range(0..=(jitter_window * 2));
		delay_ms.saturating_sub(jitter_window).saturating_add(jitter_offset)
	}
}

pub struct ConnectionManager {
	transport: Arc<dyn ChannelTransport>,
	policy: ReconnectPolicy,
	events_tx: mpsc::Sender<ConnectionEvent>,
	connected: bool,
	/// Bound channels; the pump handle is `None` while disconnected.
	bindings: HashMap<Channel, Option<JoinHandle<()>>>,
}

impl ConnectionManager {
	pub fn new(
		transport: Arc<dyn ChannelTransport>,
		policy: ReconnectPolicy,
		capacity: usize,
	) -> (Self, mpsc::Receiver<ConnectionEvent>) {
		let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
		(
			Self {
				transport,
				policy,
				events_tx,
				connected: false,
				bindings: HashMap::new(),
			},
			events_rx,
		)
	}

	pub fn is_connected(&self) -> bool {
		self.connected
	}

	pub fn is_bound(&self, channel: &Channel) -> bool {
		self.bindings.contains_key(channel)
	}

	pub fn bound_channels(&self) -> impl Iterator<Item = &Channel> {
		self.bindings.keys()
	}

	/// Start pumps for every bound channel. Calling it again is a no-op.
	pub fn connect(&mut self) {
		if self.connected {
			return;
		}
		self.connected = true;
		let channels: Vec<Channel> = self.bindings.keys().cloned().collect();
		for channel in channels {
			let handle = self.spawn_pump(channel.clone());
			self.bindings.insert(channel, Some(handle));
		}
		info!(channels = self.bindings.len(), "connection started");
	}

	/// Stop every pump. Bindings are kept and resume on the next `connect`.
	pub fn disconnect(&mut self) {
		if !self.connected {
			return;
		}
		self.connected = false;
		for handle in self.bindings.values_mut() {
			if let Some(h) = handle.take() {
				h.abort();
			}
		}
		info!("connection stopped");
	}

	/// Bind a channel. Returns `false` if it was already bound, so a channel
	/// never gets a second handler.
	pub fn bind_channel(&mut self, channel: Channel) -> bool {
		if self.bindings.contains_key(&channel) {
			debug!(channel = %channel, "channel already bound");
			return false;
		}
		let handle = self.connected.then(|| self.spawn_pump(channel.clone()));
		debug!(channel = %channel, "channel bound");
		self.bindings.insert(channel, handle);
		true
	}

	pub fn unbind_channel(&mut self, channel: &Channel) -> bool {
		match self.bindings.remove(channel) {
			Some(handle) => {
				if let Some(h) = handle {
					h.abort();
				}
				debug!(channel = %channel, "channel unbound");
				true
			}
			None => false,
		}
	}

	fn spawn_pump(&self, channel: Channel) -> JoinHandle<()> {
		tokio::spawn(pump(
			self.transport.clone(),
			channel,
			self.events_tx.clone(),
			self.policy,
		))
	}
}

impl Drop for ConnectionManager {
	fn drop(&mut self) {
		for handle in self.bindings.values_mut() {
			if let Some(h) = handle.take() {
				h.abort();
			}
		}
	}
}

async fn pump(
	transport: Arc<dyn ChannelTransport>,
	channel: Channel,
	events_tx: mpsc::Sender<ConnectionEvent>,
	policy: ReconnectPolicy,
) {
	let mut attempt: u32 = 0;
	loop {
		let reason = match transport.open(&channel).await {
			Ok(mut rx) => {
				if attempt > 0 {
					info!(channel = %channel, attempt, "channel restored");
					if events_tx
						.send(ConnectionEvent::Restored {
							channel: channel.clone(),
						})
						.await
						.is_err()
					{
						return;
					}
				}

				let opened_at = Instant::now();
				while let Some(env) = rx.recv().await {
					if events_tx.send(ConnectionEvent::Event(env)).await.is_err() {
						return;
					}
				}
				if opened_at.elapsed() >= policy.reset_after {
					attempt = 0;
				}
				"stream ended".to_string()
			}
			Err(e) => e.to_string(),
		};

		attempt = attempt.saturating_add(1);
		let retry_in_ms = policy.delay_ms(attempt);
		warn!(channel = %channel, attempt, retry_in_ms, %reason, "channel dropped");
		if events_tx
			.send(ConnectionEvent::Dropped {
				channel: channel.clone(),
				reason,
				retry_in_ms,
			})
			.await
			.is_err()
		{
			return;
		}
		tokio::time::sleep(Duration::from_millis(retry_in_ms)).await;
	}
}
