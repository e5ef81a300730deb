#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::server::auth::{IdentityClaims, verify_session_token};
use crate::server::hub::ConnId;
use crate::server::session::{Cursors, Session};
use crate::server::state::AppState;
use crate::util::time::unix_secs_now;

/// What the upgrade request told us about the client.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
	pub query: HashMap<String, String>,
	pub bearer: Option<String>,
	pub user_agent: String,
}

impl Handshake {
	pub fn from_request(req: &Request) -> Self {
		let bearer = header(req, "authorization")
			.and_then(|v| v.strip_prefix("Bearer "))
			.map(|v| v.trim().to_string())
			.filter(|v| !v.is_empty());
		Self {
			query: parse_query(req.uri().query().unwrap_or_default()),
			bearer,
			user_agent: header(req, "user-agent").unwrap_or_default().to_string(),
		}
	}

	/// Bearer header first, then the `token` query parameter.
	pub fn token(&self) -> Option<&str> {
		self.bearer
			.as_deref()
			.or_else(|| self.query.get("token").map(String::as_str))
			.filter(|t| !t.is_empty())
	}
}

fn header<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
	req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn parse_query(query: &str) -> HashMap<String, String> {
	query
		.split('&')
		.filter(|pair| !pair.is_empty())
		.map(|pair| match pair.split_once('=') {
			Some((k, v)) => (k.to_string(), v.to_string()),
			None => (pair.to_string(), String::new()),
		})
		.collect()
}

/// A bad or missing token downgrades the connection to an anonymous viewer.
fn authenticate(conn_id: ConnId, handshake: &Handshake, state: &AppState) -> Option<IdentityClaims> {
	let token = handshake.token()?;
	let Some(secret) = state.config.server.auth_hmac_secret.as_ref() else {
		debug!(conn_id, "token presented but no auth secret configured");
		return None;
	};
	match verify_session_token(token, secret.expose(), unix_secs_now()) {
		Ok(claims) => Some(claims),
		Err(e) => {
			warn!(conn_id, error = %e, "session token rejected");
			None
		}
	}
}

/// Accept sockets until the listener fails for good.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
	let mut next_conn_id: ConnId = 1;
	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("tessera_server_connections_total").increment(1);

		let state = Arc::clone(&state);
		tokio::spawn(async move {
			debug!(conn_id, %remote, "accepted tcp connection");
			if let Err(e) = handle_connection(conn_id, stream, state).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}

pub async fn handle_connection(conn_id: ConnId, stream: TcpStream, state: Arc<AppState>) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("tessera_server_connections_active").decrement(1.0);
		}
	}

	metrics::gauge!("tessera_server_connections_active").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let settings = &state.config.server;
	let ws_config = WebSocketConfig::default()
		.max_message_size(Some(settings.max_message_bytes))
		.max_frame_size(Some(settings.max_message_bytes));

	let mut handshake = Handshake::default();
	let ws = tokio_tungstenite::accept_hdr_async_with_config(
		stream,
		|req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
			handshake = Handshake::from_request(req);
			Ok(resp)
		},
		Some(ws_config),
	)
	.await
	.context("websocket upgrade")?;

	let claims = authenticate(conn_id, &handshake, &state);
	let cursors = Cursors::from_query(&handshake.query);
	info!(
		conn_id,
		authenticated = claims.is_some(),
		board_id = ?cursors.board,
		"websocket session opened"
	);

	let (sink, mut stream) = ws.split();
	let (out_tx, out_rx) = mpsc::channel::<Message>(settings.outbound_queue.max(1));
	let (closer, closed) = oneshot::channel();
	let pong_wait = settings.pong_wait;
	let mut writer = tokio::spawn(write_loop(
		conn_id,
		sink,
		out_rx,
		closed,
		settings.write_wait,
		pong_wait.mul_f64(0.9),
	));

	let session = Session::connect(
		conn_id,
		Arc::clone(&state),
		out_tx,
		closer,
		claims,
		cursors,
		handshake.user_agent,
	)
	.await;
	let mut session = match session {
		Ok(session) => session,
		Err(e) => {
			state.hub.unregister(conn_id).await;
			finish_writer(conn_id, writer, state.config.server.write_wait).await;
			return Err(e).context("session connect");
		}
	};

	let mut writer_done = false;
	loop {
		let next = tokio::select! {
			_ = &mut writer, if !writer_done => {
				writer_done = true;
				break;
			}
			next = timeout(pong_wait, stream.next()) => next,
		};

		let msg = match next {
			Err(_) => {
				debug!(conn_id, "read deadline elapsed");
				break;
			}
			Ok(None) => break,
			Ok(Some(Err(e))) => {
				debug!(conn_id, error = %e, "read failed");
				break;
			}
			Ok(Some(Ok(msg))) => msg,
		};

		let result = match msg {
			Message::Text(text) => {
				metrics::counter!("tessera_server_messages_in_total", "kind" => "text").increment(1);
				session.handle_text(text.as_str()).await
			}
			Message::Binary(data) => {
				metrics::counter!("tessera_server_messages_in_total", "kind" => "binary").increment(1);
				session.handle_paint(data).await
			}
			Message::Close(_) => break,
			_ => continue,
		};

		if let Err(e) = result {
			metrics::counter!("tessera_server_session_errors_total", "kind" => e.kind()).increment(1);
			if e.is_fatal() {
				break;
			}
			debug!(conn_id, user_id = ?session.user_id(), error = %e, "message rejected");
			if session.send_error(&e).await.is_err() {
				break;
			}
		}
	}

	state.hub.unregister(conn_id).await;
	drop(session);
	if !writer_done {
		finish_writer(conn_id, writer, state.config.server.write_wait).await;
	}
	info!(conn_id, "websocket session closed");
	Ok(())
}

/// Give the writer one write deadline to flush and close, then abort it.
async fn finish_writer(conn_id: ConnId, mut writer: tokio::task::JoinHandle<()>, wait: Duration) {
	if timeout(wait, &mut writer).await.is_err() {
		debug!(conn_id, "writer did not finish in time; aborting");
		writer.abort();
	}
}

async fn write_loop(
	conn_id: ConnId,
	mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
	mut rx: mpsc::Receiver<Message>,
	mut closed: oneshot::Receiver<()>,
	write_wait: Duration,
	ping_every: Duration,
) {
	let mut ping = interval_at(Instant::now() + ping_every, ping_every);
	loop {
		let msg = tokio::select! {
			msg = rx.recv() => match msg {
				Some(msg) => msg,
				None => break,
			},
			_ = ping.tick() => Message::Ping(Bytes::new()),
			_ = &mut closed => {
				debug!(conn_id, "closed by hub");
				break;
			}
		};

		match timeout(write_wait, sink.send(msg)).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				debug!(conn_id, error = %e, "write failed");
				break;
			}
			Err(_) => {
				warn!(conn_id, "write deadline elapsed");
				break;
			}
		}
	}
	let _ = timeout(write_wait, sink.close()).await;
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
		let mut builder = Request::builder().uri(uri);
		for (k, v) in headers {
			builder = builder.header(*k, *v);
		}
		builder.body(()).expect("request")
	}

	#[test]
	fn handshake_prefers_bearer_over_query_token() {
		let req = request(
			"/ws?token=from-query&boardId=3&userIdx=a",
			&[("Authorization", "Bearer from-header"), ("User-Agent", "test-agent/1.0")],
		);
		let hs = Handshake::from_request(&req);
		assert_eq!(hs.token(), Some("from-header"));
		assert_eq!(hs.user_agent, "test-agent/1.0");
		assert_eq!(hs.query.get("boardId").map(String::as_str), Some("3"));
		assert_eq!(hs.query.get("userIdx").map(String::as_str), Some("a"));
	}

	#[test]
	fn handshake_falls_back_to_query_token() {
		let hs = Handshake::from_request(&request("/ws?token=abc&flag", &[]));
		assert_eq!(hs.token(), Some("abc"));
		assert_eq!(hs.query.get("flag").map(String::as_str), Some(""));

		let anon = Handshake::from_request(&request("/ws", &[("Authorization", "Basic xyz")]));
		assert_eq!(anon.token(), None);
	}
}
