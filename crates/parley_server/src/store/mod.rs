#![forbid(unsafe_code)]

//! Key-value, sorted-set and set primitives backing chat state.
//!
//! Keys follow `parley_domain::keys`. Values are JSON strings; the store never
//! interprets them.

pub mod memory;
pub mod sql;

use std::sync::Arc;

use tracing::info;

pub use memory::MemoryStore;
pub use sql::SqlStore;

use crate::config::PersistenceSettings;

/// SQL store when persistence is enabled, otherwise an in-memory one.
pub async fn open_store(cfg: &PersistenceSettings) -> anyhow::Result<Arc<dyn Store>> {
	match (cfg.enabled, cfg.database_url.as_deref()) {
		(true, Some(url)) => {
			let store = SqlStore::connect(url).await?;
			info!("store: sql backend connected");
			Ok(Arc::new(store))
		}
		(true, None) => Err(anyhow::anyhow!("persistence enabled but no database_url configured")),
		(false, _) => {
			info!("store: in-memory backend (persistence disabled)");
			Ok(Arc::new(MemoryStore::new()))
		}
	}
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

	async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

	/// Insert `member` with `score`, replacing the score if already present.
	async fn zadd(&self, key: &str, score: i64, member: &str) -> anyhow::Result<()>;

	/// Remove `member`; returns whether it was present.
	async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<bool>;

	/// Members by ascending score, ties in insertion order.
	///
	/// `start` and `end` are inclusive ranks; negative values count from the end.
	async fn zrange(&self, key: &str, start: i64, end: i64) -> anyhow::Result<Vec<String>>;

	/// Returns whether the member was newly added.
	async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<bool>;

	/// Returns whether the member was present.
	async fn srem(&self, key: &str, member: &str) -> anyhow::Result<bool>;

	async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>>;

	async fn sismember(&self, key: &str, member: &str) -> anyhow::Result<bool>;
}

/// Resolve inclusive, possibly negative ranks against `len`.
///
/// Returns `None` when the range selects nothing.
pub(crate) fn normalize_range(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
	if len == 0 {
		return None;
	}
	let len_i = len as i64;
	let mut start = if start < 0 { start + len_i } else { start };
	let mut end = if end < 0 { end + len_i } else { end };

	if start < 0 {
		start = 0;
	}
	if end >= len_i {
		end = len_i - 1;
	}
	if start > end || start >= len_i {
		return None;
	}
	Some((start as usize, end as usize))
}

#[cfg(test)]
mod tests {
	use super::normalize_range;
	use proptest::prelude::*;

	#[test]
	fn full_range() {
		assert_eq!(normalize_range(5, 0, -1), Some((0, 4)));
	}

	#[test]
	fn tail_and_clamping() {
		assert_eq!(normalize_range(5, -2, -1), Some((3, 4)));
		assert_eq!(normalize_range(5, -10, 2), Some((0, 2)));
		assert_eq!(normalize_range(5, 3, 100), Some((3, 4)));
	}

	#[test]
	fn empty_selections() {
		assert_eq!(normalize_range(0, 0, -1), None);
		assert_eq!(normalize_range(5, 4, 2), None);
		assert_eq!(normalize_range(5, 7, 9), None);
		assert_eq!(normalize_range(5, 0, -6), None);
	}

	proptest! {
		#[test]
		fn selection_stays_in_bounds(len in 0usize..64, start in -100i64..100, end in -100i64..100) {
			if let Some((s, e)) = normalize_range(len, start, end) {
				prop_assert!(s <= e);
				prop_assert!(e < len);
			}
		}
	}
}
