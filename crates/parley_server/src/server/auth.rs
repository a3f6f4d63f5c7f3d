#![forbid(unsafe_code)]

//! Stateless session tokens: `v1.<base64url claims>.<base64url hmac-sha256>`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::{ChatError, UserId};
use parley_protocol::version::API_VERSION;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::config::SecretString;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Resolves a bearer token to the user it was issued for.
pub trait SessionProvider: Send + Sync {
	fn authenticate(&self, token: &str) -> Result<UserId, ChatError>;
}

pub struct HmacSessions {
	secret: SecretString,
}

impl HmacSessions {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	pub fn issue(&self, user: &UserId, ttl: Duration) -> anyhow::Result<String> {
		issue_hmac_token(user, ttl, self.secret.expose())
	}
}

impl SessionProvider for HmacSessions {
	fn authenticate(&self, token: &str) -> Result<UserId, ChatError> {
		let claims = verify_hmac_token(token, self.secret.expose()).map_err(|e| {
			debug!(error = %e, "token rejected");
			ChatError::unauthorized("invalid or expired session")
		})?;
		UserId::new(claims.sub).map_err(|_| ChatError::unauthorized("session subject is not a valid user id"))
	}
}

fn token_prefix() -> String {
	format!("v{API_VERSION}")
}

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

pub fn issue_hmac_token(user: &UserId, ttl: Duration, secret: &str) -> anyhow::Result<String> {
	let claims = AuthClaims {
		sub: user.to_string(),
		exp: now_secs() + ttl.as_secs().max(1),
	};
	let payload = serde_json::to_vec(&claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("{}.{payload_b64}.{}", token_prefix(), URL_SAFE_NO_PAD.encode(sig)))
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != token_prefix() {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= now_secs() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
	let value = header?.trim();
	let (scheme, token) = value.split_once(' ')?;
	if !scheme.eq_ignore_ascii_case("bearer") {
		return None;
	}
	let token = token.trim();
	(!token.is_empty()).then_some(token)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
