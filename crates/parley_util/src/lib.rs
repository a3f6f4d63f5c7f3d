#![forbid(unsafe_code)]

pub mod endpoint {
	use core::fmt;
	use std::net::{IpAddr, SocketAddr};

	use url::{Host, Url};

	#[derive(Debug, thiserror::Error, PartialEq, Eq)]
	pub enum EndpointError {
		#[error("invalid endpoint {0:?}: {1}")]
		Malformed(String, url::ParseError),

		#[error("unsupported scheme {0:?} (expected http or https)")]
		Scheme(String),

		#[error("endpoint must be a bare origin without credentials, path, query or fragment: {0}")]
		NotAnOrigin(String),

		#[error("host must be an IP literal to bind on: {0}")]
		NotIpLiteral(String),
	}

	/// A server origin such as `http://127.0.0.1:18300` or `https://chat.example.com`.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct HttpEndpoint {
		url: Url,
		port: u16,
	}

	impl HttpEndpoint {
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			let url = Url::parse(s).map_err(|e| EndpointError::Malformed(s.to_string(), e))?;

			if !matches!(url.scheme(), "http" | "https") {
				return Err(EndpointError::Scheme(url.scheme().to_string()));
			}
			if !url.username().is_empty()
				|| url.password().is_some()
				|| url.path() != "/"
				|| url.query().is_some()
				|| url.fragment().is_some()
			{
				return Err(EndpointError::NotAnOrigin(s.to_string()));
			}
			// http and https always have a known default.
			let port = url.port_or_known_default().unwrap_or(80);

			Ok(Self { url, port })
		}

		pub fn is_tls(&self) -> bool {
			self.url.scheme() == "https"
		}

		pub fn port(&self) -> u16 {
			self.port
		}

		/// Base URL without a trailing slash, ready for `{base}/api/...`.
		pub fn base_url(&self) -> String {
			self.url.as_str().trim_end_matches('/').to_string()
		}

		/// Bind address; DNS names are refused rather than resolved.
		pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
			let ip: IpAddr = match self.url.host() {
				Some(Host::Ipv4(v4)) => v4.into(),
				Some(Host::Ipv6(v6)) => v6.into(),
				_ => return Err(EndpointError::NotIpLiteral(self.base_url())),
			};
			Ok(SocketAddr::new(ip, self.port()))
		}
	}

	impl fmt::Display for HttpEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str(&self.base_url())
		}
	}

	impl core::str::FromStr for HttpEndpoint {
		type Err = EndpointError;

		fn from_str(s: &str) -> Result<Self, Self::Err> {
			Self::parse(s)
		}
	}

}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}
