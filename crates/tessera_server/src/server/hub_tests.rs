#![forbid(unsafe_code)]

use std::time::Duration;

use tessera_domain::{BoardId, Topic, UserId};
use tessera_protocol::Outbound;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use crate::server::hub::{HubConfig, HubHandle, HubStats, spawn_hub};

fn board(id: u16) -> Topic {
	Topic::Board(BoardId(id))
}

async fn subscribe(hub: &HubHandle, conn: u64, topics: Vec<Topic>, sink: mpsc::Sender<Message>) -> oneshot::Receiver<()> {
	let (closer, closed) = oneshot::channel();
	hub.register(conn, topics, sink, closer).await;
	closed
}

fn text(msg: Message) -> String {
	match msg {
		Message::Text(t) => t.as_str().to_string(),
		other => panic!("expected text message, got: {other:?}"),
	}
}

#[tokio::test]
async fn broadcast_reaches_only_subscribers_of_that_topic() {
	let (hub, _task) = spawn_hub(HubConfig::default());
	let (tx7, mut rx7) = mpsc::channel(16);
	let (tx9, mut rx9) = mpsc::channel(16);
	let _c7 = subscribe(&hub, 1, vec![Topic::Global, board(7)], tx7).await;
	let _c9 = subscribe(&hub, 2, vec![Topic::Global, board(9)], tx9).await;

	hub.broadcast(board(7), Message::text("paint")).await;

	let got = timeout(Duration::from_millis(250), rx7.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	assert_eq!(text(got), "paint");
	assert!(
		timeout(Duration::from_millis(50), rx9.recv()).await.is_err(),
		"board-9 subscriber unexpectedly received a board-7 message"
	);

	hub.broadcast_json(Topic::Global, &Outbound::err("both")).await;
	for rx in [&mut rx7, &mut rx9] {
		let got = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected to receive within timeout")
			.expect("channel open");
		assert!(text(got).contains("both"));
	}
}

#[tokio::test]
async fn update_replaces_topic_membership() {
	let (hub, _task) = spawn_hub(HubConfig::default());
	let (tx, mut rx) = mpsc::channel(16);
	let _closed = subscribe(&hub, 1, vec![board(1)], tx).await;

	hub.update(1, vec![board(2), Topic::User(UserId(5))]).await;
	hub.broadcast(board(1), Message::text("old")).await;
	hub.broadcast(Topic::User(UserId(5)), Message::text("new")).await;

	let got = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	assert_eq!(text(got), "new");
	assert_eq!(
		hub.stats().await,
		Some(HubStats {
			connections: 1,
			topics: 2
		})
	);
}

#[tokio::test]
async fn slow_subscriber_is_evicted_without_stalling_others() {
	let (hub, _task) = spawn_hub(HubConfig::default());
	let (slow_tx, _slow_rx) = mpsc::channel(1);
	let (fast_tx, mut fast_rx) = mpsc::channel(16);
	let slow_closed = subscribe(&hub, 1, vec![board(1)], slow_tx).await;
	let _fast_closed = subscribe(&hub, 2, vec![board(1)], fast_tx).await;

	for i in 0..3 {
		hub.broadcast(board(1), Message::text(format!("m{i}"))).await;
	}

	timeout(Duration::from_millis(250), slow_closed)
		.await
		.expect("slow subscriber should be closed")
		.expect("closer fired rather than dropped");

	for i in 0..3 {
		let got = timeout(Duration::from_millis(250), fast_rx.recv())
			.await
			.expect("expected to receive within timeout")
			.expect("channel open");
		assert_eq!(text(got), format!("m{i}"));
	}
	assert_eq!(hub.stats().await.map(|s| s.connections), Some(1));
}

#[tokio::test]
async fn unregister_releases_the_connection() {
	let (hub, _task) = spawn_hub(HubConfig::default());
	let (tx, mut rx) = mpsc::channel(16);
	let closed = subscribe(&hub, 1, vec![Topic::Global], tx).await;

	hub.unregister(1).await;
	hub.broadcast(Topic::Global, Message::text("late")).await;

	assert!(timeout(Duration::from_millis(250), closed).await.expect("closed").is_err());
	assert!(timeout(Duration::from_millis(250), rx.recv()).await.expect("recv").is_none());
	assert_eq!(hub.stats().await, Some(HubStats::default()));
}
