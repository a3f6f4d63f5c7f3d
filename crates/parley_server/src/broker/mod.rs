#![forbid(unsafe_code)]

pub mod hub;


use parley_domain::Channel;
use parley_protocol::ChatEvent;
use thiserror::Error;

pub use hub::{ChannelHub, ChannelHubConfig, HubItem};

#[derive(Debug, Error)]
pub enum BrokerError {
	#[error("broker is shut down")]
	Closed,

	#[error("publish failed: {0}")]
	Publish(String),
}

/// Named-channel pub/sub.
///
/// Delivery is best-effort: a successful publish means the event was handed to
/// every live subscriber queue, not that anyone consumed it.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
	async fn publish(&self, channel: &Channel, event: ChatEvent) -> Result<(), BrokerError>;
}
