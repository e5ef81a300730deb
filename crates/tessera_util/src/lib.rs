#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	use thiserror::Error;

	/// Errors for `ws://host:port` bind strings.
	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointParseError {
		#[error("endpoint must be non-empty (expected ws://host:port)")]
		Empty,
		#[error("unsupported scheme (expected ws://host:port): {0}")]
		Scheme(String),
		#[error("endpoint must not carry a path, query or fragment: {0}")]
		Trailing(String),
		#[error("missing :port (expected ws://host:port): {0}")]
		MissingPort(String),
		#[error("invalid host: {0}")]
		Host(String),
		#[error("invalid port (expected 1..=65535): {0}")]
		Port(String),
	}

	/// Parsed `ws://host:port` endpoint the server listens on.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		/// `host:port`, IPv6 stays bracketed.
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		pub fn url(&self) -> String {
			format!("ws://{}", self.hostport())
		}

		/// Only IP literals resolve; a listener never does DNS.
		pub fn socket_addr(&self) -> Result<SocketAddr, EndpointParseError> {
			self.hostport()
				.parse()
				.map_err(|_| EndpointParseError::Host(format!("{} is not an IP literal", self.host)))
		}

		/// Parse `ws://host:port`. A bare `host:port` is accepted too.
		pub fn parse(s: &str) -> Result<Self, EndpointParseError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointParseError::Empty);
			}

			let rest = match s.split_once("://") {
				Some(("ws", rest)) => rest,
				Some(_) => return Err(EndpointParseError::Scheme(s.to_string())),
				None => s,
			};

			if rest.contains(['/', '?', '#']) {
				return Err(EndpointParseError::Trailing(s.to_string()));
			}

			let (host, port) = rest
				.rsplit_once(':')
				.ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(EndpointParseError::Host(s.to_string()));
			}
			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointParseError::Host(format!(
					"IPv6 must be bracketed like ws://[::1]:8080: {s}"
				)));
			}

			let port: u16 = port.trim().parse().map_err(|_| EndpointParseError::Port(s.to_string()))?;
			if port == 0 {
				return Err(EndpointParseError::Port(s.to_string()));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_ipv4_and_bare_hostport() {
			let e = WsEndpoint::parse("ws://127.0.0.1:8080").unwrap();
			assert_eq!(e.host, "127.0.0.1");
			assert_eq!(e.port, 8080);
			assert_eq!(e, WsEndpoint::parse("127.0.0.1:8080").unwrap());
			assert_eq!(e.url(), "ws://127.0.0.1:8080");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = WsEndpoint::parse("ws://[::1]:9000").unwrap();
			assert_eq!(e.hostport(), "[::1]:9000");
			assert_eq!(e.socket_addr().unwrap().to_string(), "[::1]:9000");
		}

		#[test]
		fn rejects_other_schemes_and_paths() {
			assert!(matches!(
				WsEndpoint::parse("wss://127.0.0.1:443"),
				Err(EndpointParseError::Scheme(_))
			));
			assert!(matches!(
				WsEndpoint::parse("ws://127.0.0.1:8080/ws"),
				Err(EndpointParseError::Trailing(_))
			));
			assert!(WsEndpoint::parse("ws://127.0.0.1:8080?x=1").is_err());
		}

		#[test]
		fn rejects_bad_ports_and_hosts() {
			assert!(matches!(WsEndpoint::parse("ws://127.0.0.1:0"), Err(EndpointParseError::Port(_))));
			assert!(matches!(
				WsEndpoint::parse("ws://127.0.0.1"),
				Err(EndpointParseError::MissingPort(_))
			));
			assert!(matches!(WsEndpoint::parse("ws://::1:8080"), Err(EndpointParseError::Host(_))));
			assert!(matches!(WsEndpoint::parse("   "), Err(EndpointParseError::Empty)));
		}

		#[test]
		fn dns_names_do_not_become_socket_addrs() {
			let e = WsEndpoint::parse("ws://canvas.example.com:80").unwrap();
			assert!(e.socket_addr().is_err());
		}
	}
}
