#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use tokio::sync::Mutex;

use super::{Store, normalize_range};

/// Process-local store used by tests and when persistence is disabled.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	kv: HashMap<String, String>,
	zsets: HashMap<String, Vec<ZEntry>>,
	sets: HashMap<String, BTreeSet<String>>,
	next_seq: u64,
}

#[derive(Debug, Clone)]
struct ZEntry {
	score: i64,
	seq: u64,
	member: String,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl Store for MemoryStore {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
		let inner = self.inner.lock().await;
		Ok(inner.kv.get(key).cloned())
	}

	async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner.kv.insert(key.to_string(), value.to_string());
		Ok(())
	}

	async fn zadd(&self, key: &str, score: i64, member: &str) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner.next_seq += 1;
		let seq = inner.next_seq;

		let entries = inner.zsets.entry(key.to_string()).or_default();
		let seq = match entries.iter().position(|e| e.member == member) {
			Some(idx) => entries.remove(idx).seq,
			None => seq,
		};

		let entry = ZEntry {
			score,
			seq,
			member: member.to_string(),
		};
		let at = entries.partition_point(|e| (e.score, e.seq) < (entry.score, entry.seq));
		entries.insert(at, entry);
		Ok(())
	}

	async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		let Some(entries) = inner.zsets.get_mut(key) else {
			return Ok(false);
		};
		let Some(idx) = entries.iter().position(|e| e.member == member) else {
			return Ok(false);
		};
		entries.remove(idx);
		if entries.is_empty() {
			inner.zsets.remove(key);
		}
		Ok(true)
	}

	async fn zrange(&self, key: &str, start: i64, end: i64) -> anyhow::Result<Vec<String>> {
		let inner = self.inner.lock().await;
		let Some(entries) = inner.zsets.get(key) else {
			return Ok(Vec::new());
		};
		let Some((from, to)) = normalize_range(entries.len(), start, end) else {
			return Ok(Vec::new());
		};
		Ok(entries[from..=to].iter().map(|e| e.member.clone()).collect())
	}

	async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		Ok(inner.sets.entry(key.to_string()).or_default().insert(member.to_string()))
	}

	async fn srem(&self, key: &str, member: &str) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		let Some(set) = inner.sets.get_mut(key) else {
			return Ok(false);
		};
		let removed = set.remove(member);
		if set.is_empty() {
			inner.sets.remove(key);
		}
		Ok(removed)
	}

	async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
		let inner = self.inner.lock().await;
		Ok(inner
			.sets
			.get(key)
			.map(|s| s.iter().cloned().collect())
			.unwrap_or_default())
	}

	async fn sismember(&self, key: &str, member: &str) -> anyhow::Result<bool> {
		let inner = self.inner.lock().await;
		Ok(inner.sets.get(key).is_some_and(|s| s.contains(member)))
	}
}
