#![forbid(unsafe_code)]

//! Topic fan-out.
//!
//! One task owns the routing table; everything else talks to it through
//! [`HubHandle`]. Broadcasts never wait on a subscriber: a full outbound
//! queue gets the subscriber evicted.

use std::collections::{HashMap, HashSet};

use tessera_domain::Topic;
use tessera_protocol::Outbound;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

pub type ConnId = u64;

#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Capacity of the command queue feeding the hub task.
	pub command_queue: usize,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self { command_queue: 1024 }
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
	pub connections: usize,
	pub topics: usize,
}

enum HubCommand {
	Register {
		conn: ConnId,
		topics: Vec<Topic>,
		sink: mpsc::Sender<Message>,
		closer: oneshot::Sender<()>,
	},
	Update {
		conn: ConnId,
		topics: Vec<Topic>,
	},
	Unregister {
		conn: ConnId,
	},
	Broadcast {
		topic: Topic,
		msg: Message,
	},
	Stats {
		reply: oneshot::Sender<HubStats>,
	},
}

#[derive(Debug, Clone)]
pub struct HubHandle {
	tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
	/// Route `topics` to `sink`. `closer` fires if the hub evicts the
	/// connection and is dropped when it is unregistered.
	pub async fn register(
		&self,
		conn: ConnId,
		topics: Vec<Topic>,
		sink: mpsc::Sender<Message>,
		closer: oneshot::Sender<()>,
	) {
		self.send(HubCommand::Register {
			conn,
			topics,
			sink,
			closer,
		})
		.await;
	}

	/// Replace the connection's topic set.
	pub async fn update(&self, conn: ConnId, topics: Vec<Topic>) {
		self.send(HubCommand::Update { conn, topics }).await;
	}

	pub async fn unregister(&self, conn: ConnId) {
		self.send(HubCommand::Unregister { conn }).await;
	}

	pub async fn broadcast(&self, topic: Topic, msg: Message) {
		self.send(HubCommand::Broadcast { topic, msg }).await;
	}

	pub async fn broadcast_json(&self, topic: Topic, msg: &Outbound) {
		match msg.to_json() {
			Ok(json) => self.broadcast(topic, Message::text(json)).await,
			Err(e) => warn!(%topic, error = %e, "hub: failed to encode broadcast"),
		}
	}

	pub async fn stats(&self) -> Option<HubStats> {
		let (reply, rx) = oneshot::channel();
		self.send(HubCommand::Stats { reply }).await;
		rx.await.ok()
	}

	async fn send(&self, cmd: HubCommand) {
		if self.tx.send(cmd).await.is_err() {
			warn!("hub: command dropped; hub task is gone");
		}
	}
}

struct Subscriber {
	sink: mpsc::Sender<Message>,
	topics: Vec<Topic>,
	closer: oneshot::Sender<()>,
}

#[derive(Default)]
struct Hub {
	routes: HashMap<Topic, HashSet<ConnId>>,
	conns: HashMap<ConnId, Subscriber>,
}

/// Start the hub task. It stops once every handle is dropped.
pub fn spawn_hub(cfg: HubConfig) -> (HubHandle, JoinHandle<()>) {
	let (tx, rx) = mpsc::channel(cfg.command_queue.max(1));
	let task = tokio::spawn(run_hub(rx));
	(HubHandle { tx }, task)
}

async fn run_hub(mut rx: mpsc::Receiver<HubCommand>) {
	let mut hub = Hub::default();
	while let Some(cmd) = rx.recv().await {
		match cmd {
			HubCommand::Register {
				conn,
				topics,
				sink,
				closer,
			} => hub.register(conn, topics, sink, closer),
			HubCommand::Update { conn, topics } => hub.update(conn, topics),
			HubCommand::Unregister { conn } => {
				hub.remove(conn);
			}
			HubCommand::Broadcast { topic, msg } => hub.broadcast(topic, msg),
			HubCommand::Stats { reply } => {
				let _ = reply.send(HubStats {
					connections: hub.conns.len(),
					topics: hub.routes.len(),
				});
			}
		}
	}
	debug!("hub: all handles dropped; stopping");
}

impl Hub {
	fn register(&mut self, conn: ConnId, topics: Vec<Topic>, sink: mpsc::Sender<Message>, closer: oneshot::Sender<()>) {
		self.remove(conn);
		for topic in &topics {
			self.routes.entry(*topic).or_default().insert(conn);
		}
		debug!(conn_id = conn, topics = topics.len(), "hub: registered");
		self.conns.insert(
			conn,
			Subscriber {
				sink,
				topics,
				closer,
			},
		);
	}

	fn update(&mut self, conn: ConnId, topics: Vec<Topic>) {
		let Some(sub) = self.conns.get_mut(&conn) else {
			debug!(conn_id = conn, "hub: update for unknown connection");
			return;
		};
		let old = std::mem::replace(&mut sub.topics, topics.clone());
		for topic in &old {
			unroute(&mut self.routes, topic, conn);
		}
		for topic in &topics {
			self.routes.entry(*topic).or_default().insert(conn);
		}
	}

	fn remove(&mut self, conn: ConnId) -> Option<Subscriber> {
		let sub = self.conns.remove(&conn)?;
		for topic in &sub.topics {
			unroute(&mut self.routes, topic, conn);
		}
		Some(sub)
	}

	fn broadcast(&mut self, topic: Topic, msg: Message) {
		metrics::counter!("tessera_server_hub_broadcasts_total").increment(1);
		let Some(conns) = self.routes.get(&topic) else {
			return;
		};

		let mut evicted = Vec::new();
		let mut closed = Vec::new();
		for conn in conns {
			let Some(sub) = self.conns.get(conn) else {
				continue;
			};
			match sub.sink.try_send(msg.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => evicted.push(*conn),
				Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*conn),
			}
		}

		for conn in evicted {
			if let Some(sub) = self.remove(conn) {
				metrics::counter!("tessera_server_hub_dropped_subscribers_total").increment(1);
				warn!(conn_id = conn, %topic, "hub: outbound queue full; dropping subscriber");
				let _ = sub.closer.send(());
			}
		}
		for conn in closed {
			self.remove(conn);
			debug!(conn_id = conn, "hub: pruned closed subscriber");
		}
	}
}

fn unroute(routes: &mut HashMap<Topic, HashSet<ConnId>>, topic: &Topic, conn: ConnId) {
	if let Some(set) = routes.get_mut(topic) {
		set.remove(&conn);
		if set.is_empty() {
			routes.remove(topic);
		}
	}
}
