#![forbid(unsafe_code)]

use anyhow::{Context as _, anyhow};
use sqlx::sqlite::SqlitePoolOptions;

use super::{Store, normalize_range};

/// Store backed by sqlite or postgres.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let mut opts = SqlitePoolOptions::new();
			if database_url.contains(":memory:") {
				// every connection would otherwise see its own empty database
				opts = opts.max_connections(1);
			}
			let pool = opts.connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	async fn zcard(&self, key: &str) -> anyhow::Result<usize> {
		let (count,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT COUNT(*) FROM zset WHERE key = ?")
				.bind(key)
				.fetch_one(pool)
				.await
				.context("count zset (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT COUNT(*) FROM zset WHERE key = $1")
				.bind(key)
				.fetch_one(pool)
				.await
				.context("count zset (postgres)")?,
		};
		Ok(count.max(0) as usize)
	}
}

#[async_trait::async_trait]
impl Store for SqlStore {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT value FROM kv WHERE key = ?")
				.bind(key)
				.fetch_optional(pool)
				.await
				.context("select kv (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT value FROM kv WHERE key = $1")
				.bind(key)
				.fetch_optional(pool)
				.await
				.context("select kv (postgres)")?,
		};
		Ok(row.map(|(v,)| v))
	}

	async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO kv (key, value) VALUES (?, ?) \
					ON CONFLICT(key) DO UPDATE SET value = excluded.value",
				)
				.bind(key)
				.bind(value)
				.execute(pool)
				.await
				.context("upsert kv (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO kv (key, value) VALUES ($1, $2) \
					ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
				)
				.bind(key)
				.bind(value)
				.execute(pool)
				.await
				.context("upsert kv (postgres)")?;
			}
		}
		Ok(())
	}

	async fn zadd(&self, key: &str, score: i64, member: &str) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO zset (key, member, score) VALUES (?, ?, ?) \
					ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
				)
				.bind(key)
				.bind(member)
				.bind(score)
				.execute(pool)
				.await
				.context("upsert zset (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO zset (key, member, score) VALUES ($1, $2, $3) \
					ON CONFLICT (key, member) DO UPDATE SET score = EXCLUDED.score",
				)
				.bind(key)
				.bind(member)
				.bind(score)
				.execute(pool)
				.await
				.context("upsert zset (postgres)")?;
			}
		}
		Ok(())
	}

	async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<bool> {
		let res = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM zset WHERE key = ? AND member = ?")
				.bind(key)
				.bind(member)
				.execute(pool)
				.await
				.context("delete zset (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM zset WHERE key = $1 AND member = $2")
				.bind(key)
				.bind(member)
				.execute(pool)
				.await
				.context("delete zset (postgres)")?
				.rows_affected(),
		};
		Ok(res > 0)
	}

	async fn zrange(&self, key: &str, start: i64, end: i64) -> anyhow::Result<Vec<String>> {
		let len = self.zcard(key).await?;
		let Some((from, to)) = normalize_range(len, start, end) else {
			return Ok(Vec::new());
		};
		let limit = (to - from + 1) as i64;
		let offset = from as i64;

		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT member FROM zset WHERE key = ? ORDER BY score ASC, rowid ASC LIMIT ? OFFSET ?",
			)
			.bind(key)
			.bind(limit)
			.bind(offset)
			.fetch_all(pool)
			.await
			.context("select zset range (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT member FROM zset WHERE key = $1 ORDER BY score ASC, seq ASC LIMIT $2 OFFSET $3",
			)
			.bind(key)
			.bind(limit)
			.bind(offset)
			.fetch_all(pool)
			.await
			.context("select zset range (postgres)")?,
		};
		Ok(rows.into_iter().map(|(m,)| m).collect())
	}

	async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<bool> {
		let res = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO sets (key, member) VALUES (?, ?) ON CONFLICT(key, member) DO NOTHING")
					.bind(key)
					.bind(member)
					.execute(pool)
					.await
					.context("insert set (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO sets (key, member) VALUES ($1, $2) ON CONFLICT (key, member) DO NOTHING")
					.bind(key)
					.bind(member)
					.execute(pool)
					.await
					.context("insert set (postgres)")?
					.rows_affected()
			}
		};
		Ok(res > 0)
	}

	async fn srem(&self, key: &str, member: &str) -> anyhow::Result<bool> {
		let res = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM sets WHERE key = ? AND member = ?")
				.bind(key)
				.bind(member)
				.execute(pool)
				.await
				.context("delete set (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM sets WHERE key = $1 AND member = $2")
				.bind(key)
				.bind(member)
				.execute(pool)
				.await
				.context("delete set (postgres)")?
				.rows_affected(),
		};
		Ok(res > 0)
	}

	async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT member FROM sets WHERE key = ? ORDER BY member")
				.bind(key)
				.fetch_all(pool)
				.await
				.context("select set (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT member FROM sets WHERE key = $1 ORDER BY member")
				.bind(key)
				.fetch_all(pool)
				.await
				.context("select set (postgres)")?,
		};
		Ok(rows.into_iter().map(|(m,)| m).collect())
	}

	async fn sismember(&self, key: &str, member: &str) -> anyhow::Result<bool> {
		let row: Option<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT 1 FROM sets WHERE key = ? AND member = ?")
				.bind(key)
				.bind(member)
				.fetch_optional(pool)
				.await
				.context("select set member (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT 1::BIGINT FROM sets WHERE key = $1 AND member = $2")
				.bind(key)
				.bind(member)
				.fetch_optional(pool)
				.await
				.context("select set member (postgres)")?,
		};
		Ok(row.is_some())
	}
}
