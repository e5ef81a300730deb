#![forbid(unsafe_code)]

//! Per-connection protocol state.
//!
//! [`Session::connect`] sends `init`, replays what the client missed straight
//! into its own queue, subscribes, then replays whatever landed meanwhile and
//! returns a live session. The reader then hands each
//! inbound message to the session and waits for it to finish before reading
//! the next one.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tessera_domain::{Board, BoardId, Fault, Love, Report, TileId, Topic, User, UserBan, UserBucket, UserId};
use tessera_protocol::{Frame, FrameError, Inbound, Outbound, ProtocolError, decode_inbound};
use tessera_store::RepoError;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::auth::IdentityClaims;
use crate::server::hub::ConnId;
use crate::server::state::AppState;
use crate::util::time::unix_secs_now;

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("auth required")]
	AuthRequired,

	#[error("policy not accepted")]
	PolicyNotAccepted,

	#[error("user banned")]
	UserBanned,

	#[error("user timed out")]
	UserTimedOut,

	#[error("moderator only")]
	NotModerator,

	#[error("no board selected")]
	NoBoard,

	#[error("board not active")]
	BoardNotActive,

	#[error("malformed message: {0}")]
	Malformed(String),

	#[error(transparent)]
	Repo(#[from] RepoError),

	/// The outbound queue is gone; nothing more can be sent.
	#[error("connection closed")]
	Disconnected,
}

impl From<ProtocolError> for SessionError {
	fn from(e: ProtocolError) -> Self {
		match e {
			ProtocolError::Malformed(m) => SessionError::Malformed(m),
			other => SessionError::Malformed(other.to_string()),
		}
	}
}

impl From<FrameError> for SessionError {
	fn from(e: FrameError) -> Self {
		SessionError::Malformed(e.to_string())
	}
}

impl SessionError {
	/// Short stable label for metrics.
	pub fn kind(&self) -> &'static str {
		match self {
			SessionError::AuthRequired => "auth_required",
			SessionError::PolicyNotAccepted => "policy_not_accepted",
			SessionError::UserBanned => "user_banned",
			SessionError::UserTimedOut => "user_timed_out",
			SessionError::NotModerator => "not_moderator",
			SessionError::NoBoard => "no_board",
			SessionError::BoardNotActive => "board_not_active",
			SessionError::Malformed(_) => "malformed",
			SessionError::Repo(e) => e.kind(),
			SessionError::Disconnected => "disconnected",
		}
	}

	pub fn is_fatal(&self) -> bool {
		matches!(self, SessionError::Disconnected)
	}
}

/// Replay position reported by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursors {
	pub board: Option<BoardId>,
	pub generation: u16,
	/// Frame id (`timestamp << 8 | tile`) of the last frame seen.
	pub timecode: u32,
	pub user_idx: UserId,
	pub ban_idx: u32,
}

impl Cursors {
	/// `boardId` is decimal, every other cursor is hex. Anything unreadable
	/// falls back to zero, which replays from the start.
	pub fn from_query(query: &HashMap<String, String>) -> Self {
		let hex = |key: &str| {
			query
				.get(key)
				.and_then(|v| u32::from_str_radix(v.trim(), 16).ok())
				.unwrap_or(0)
		};
		Self {
			board: query.get("boardId").and_then(|v| v.parse().ok()),
			generation: u16::try_from(hex("generation")).unwrap_or(0),
			timecode: hex("timecode"),
			user_idx: UserId(hex("userIdx")),
			ban_idx: hex("banIdx"),
		}
	}
}

fn secs32(secs: u64) -> u32 {
	u32::try_from(secs).unwrap_or(u32::MAX)
}

pub struct Session {
	conn_id: ConnId,
	state: Arc<AppState>,
	out: mpsc::Sender<Message>,
	user_id: Option<UserId>,
	policy: bool,
	moderator: bool,
	user_agent: String,
	cursors: Cursors,
}

impl Session {
	/// Run the connect handshake: upsert the user, send `init`, replay
	/// everything after `cursors`, subscribe, catch up on what arrived during
	/// the replay and finish with `sync-complete`.
	pub async fn connect(
		conn_id: ConnId,
		state: Arc<AppState>,
		out: mpsc::Sender<Message>,
		closer: oneshot::Sender<()>,
		claims: Option<IdentityClaims>,
		cursors: Cursors,
		user_agent: String,
	) -> Result<Self, SessionError> {
		let now = unix_secs_now();
		let user = match &claims {
			Some(claims) => {
				let moderator = state.config.is_moderator(&claims.sub);
				let (user, inserted) = state
					.repos
					.users
					.update_profile(&claims.profile(), claims.policy, moderator)
					.await?;
				if inserted {
					state.hub.broadcast_json(Topic::Global, &Outbound::new_user(&user)).await;
				}
				Some(user)
			}
			None => None,
		};

		let mut session = Self {
			conn_id,
			out: out.clone(),
			user_id: user.as_ref().map(|u| u.user_id),
			policy: user.as_ref().is_some_and(|u| u.policy),
			moderator: user.as_ref().is_some_and(|u| u.moderator),
			user_agent,
			cursors,
			state,
		};

		let game = &session.state.repos.game;
		let init = Outbound::Init {
			v: format!("{:016x}", game.version().await?),
			user,
			series: game.active_series(now).await?,
			user_idx: cursors.user_idx,
			ban_idx: cursors.ban_idx,
		};
		session.send(&init).await?;

		// The bulk replay fills the queue before any broadcast can reach it.
		let bulk = session.replay(false).await?;
		let topics = session.topics(session.cursors.board);
		session.state.hub.register(conn_id, topics, out, closer).await;
		if session.moderator {
			session.replay_reports().await?;
		}
		let caught_up = session.replay(true).await?;
		debug!(conn_id, bulk, caught_up, "connect replay done");
		session.sync_complete(now).await?;
		Ok(session)
	}

	pub fn user_id(&self) -> Option<UserId> {
		self.user_id
	}

	fn topics(&self, board: Option<BoardId>) -> Vec<Topic> {
		let mut topics = vec![Topic::Global];
		if let Some(board) = board {
			topics.push(Topic::Board(board));
		}
		if let Some(id) = self.user_id
			&& self.policy
		{
			topics.push(Topic::User(id));
		}
		if self.moderator {
			topics.push(Topic::Moderation);
		}
		topics
	}

	async fn send(&self, msg: &Outbound) -> Result<(), SessionError> {
		let json = msg.to_json()?;
		self.send_raw(Message::text(json)).await
	}

	async fn send_raw(&self, msg: Message) -> Result<(), SessionError> {
		self.out.send(msg).await.map_err(|_| SessionError::Disconnected)
	}

	/// Report a rejected message back to this connection only.
	pub async fn send_error(&self, err: &SessionError) -> Result<(), SessionError> {
		self.send(&Outbound::err(err.to_string())).await
	}

	/// Stream board frames, users and bans past the cursors and advance them.
	/// With `after_cursor` the frames the cursor already covers are skipped;
	/// otherwise the replay starts at the cursor's time bucket. Returns the
	/// number of frames sent.
	async fn replay(&mut self, after_cursor: bool) -> Result<usize, SessionError> {
		let repos = &self.state.repos;
		let mut c = self.cursors;

		let mut frames = 0usize;
		if let Some(board) = c.board {
			let seen = (c.generation, c.timecode);
			for stored in repos.boards.since(board, c.generation, c.timecode).await? {
				if after_cursor && (stored.generation, stored.frame.id()) <= seen {
					continue;
				}
				(c.generation, c.timecode) = (stored.generation, stored.frame.id());
				self.send_raw(Message::Binary(stored.frame.into_bytes())).await?;
				frames += 1;
			}
		}
		for user in repos.users.since(c.user_idx).await? {
			c.user_idx = c.user_idx.max(user.user_id);
			self.send(&Outbound::new_user(&user)).await?;
		}
		for ban in repos.bans.since(c.ban_idx).await? {
			c.ban_idx = c.ban_idx.max(ban.id);
			self.send(&Outbound::UserBan(ban)).await?;
		}
		self.cursors = c;
		Ok(frames)
	}

	/// Open reports, for moderators joining after they were filed.
	async fn replay_reports(&self) -> Result<(), SessionError> {
		for report in self.state.repos.reports.all().await? {
			self.send(&Outbound::Report(report)).await?;
		}
		Ok(())
	}

	async fn sync_complete(&self, now: u64) -> Result<(), SessionError> {
		let repos = &self.state.repos;
		let c = self.cursors;
		let bucket = match (self.user_id, c.board) {
			(Some(id), Some(board)) => {
				let user = repos.users.find(id).await?;
				Some(repos.users.bucket_view(&user, board, now))
			}
			_ => None,
		};

		debug!(conn_id = self.conn_id, board_id = ?c.board, "sync complete");
		self.send(&Outbound::SyncComplete {
			board_id: c.board,
			generation: c.generation,
			timecode: c.timecode,
			user_idx: c.user_idx,
			ban_idx: c.ban_idx,
			bucket,
		})
		.await
	}

	/// A policy-accepted user with no active ban or timeout.
	async fn player(&self, now: u64) -> Result<User, SessionError> {
		let id = self.user_id.ok_or(SessionError::AuthRequired)?;
		let user = self.state.repos.users.find(id).await?;
		if user.banned {
			return Err(SessionError::UserBanned);
		}
		if user.is_timed_out(now) {
			return Err(SessionError::UserTimedOut);
		}
		if !user.policy {
			return Err(SessionError::PolicyNotAccepted);
		}
		Ok(user)
	}

	async fn moderator(&self) -> Result<User, SessionError> {
		let id = self.user_id.ok_or(SessionError::AuthRequired)?;
		let user = self.state.repos.users.find(id).await?;
		if !user.moderator {
			return Err(SessionError::NotModerator);
		}
		Ok(user)
	}

	/// The selected board, provided its series is running.
	async fn live_board(&self, now: u64) -> Result<Board, SessionError> {
		let board = self.cursors.board.ok_or(SessionError::NoBoard)?;
		match self.state.repos.game.find_active_board(board, now).await {
			Ok((_, board)) => Ok(board),
			Err(RepoError::NotFound) => Err(SessionError::BoardNotActive),
			Err(e) => Err(e.into()),
		}
	}

	/// The live board, provided `tile` lies on it.
	async fn live_tile(&self, tile: TileId, now: u64) -> Result<BoardId, SessionError> {
		let board = self.live_board(now).await?;
		if !board.has_tile(tile) {
			return Err(SessionError::Malformed(format!(
				"tile {} outside board {} ({} tiles)",
				tile.get(),
				board.id.get(),
				board.tile_count()
			)));
		}
		Ok(board.id)
	}

	pub async fn handle_text(&mut self, text: &str) -> Result<(), SessionError> {
		let now = unix_secs_now();
		match decode_inbound(text)? {
			Inbound::BoardInit {
				board_id,
				generation,
				timecode,
				user_idx,
			} => self.board_init(board_id, generation, timecode, user_idx, now).await,
			Inbound::TileLock { tile_id } => self.tile_lock(tile_id, now).await,
			Inbound::TileLockRelease { tile_id } => self.tile_lock_release(tile_id, now).await,
			Inbound::Report {
				board_id,
				generation,
				timecode,
				reason,
			} => self.report(board_id, generation, timecode, reason, now).await,
			Inbound::ReportClear { target_id } => self.report_clear(target_id).await,
			Inbound::Love {
				board_id,
				generation,
				timecode,
			} => self.love(board_id, generation, timecode, now).await,
			Inbound::UserBan {
				target_id,
				since,
				duration,
				reason,
				ban,
			} => self.user_ban(target_id, since, duration, reason, ban, now).await,
			Inbound::ErrStorage {
				user_id,
				user_agent,
				err_type,
			} => self.err_storage(user_id, user_agent, err_type, now).await,
		}
	}

	async fn board_init(
		&mut self,
		board: BoardId,
		generation: u16,
		timecode: u32,
		user_idx: Option<UserId>,
		now: u64,
	) -> Result<(), SessionError> {
		self.cursors.board = Some(board);
		self.cursors.generation = generation;
		self.cursors.timecode = timecode;
		if let Some(idx) = user_idx {
			self.cursors.user_idx = idx;
		}
		// Off every board while the bulk replay is queued.
		self.state.hub.update(self.conn_id, self.topics(None)).await;
		self.replay(false).await?;
		self.state.hub.update(self.conn_id, self.topics(Some(board))).await;
		self.replay(true).await?;
		self.sync_complete(now).await
	}

	/// Take a credit, then the lease; the credit is refunded if the lease is refused.
	async fn lease_tile(&self, user: UserId, board: BoardId, tile: TileId, now: u64) -> Result<UserBucket, SessionError> {
		let repos = &self.state.repos;
		let bucket = repos.users.consume(user, board, now).await?;
		match repos.locks.acquire(user, board, tile, now).await {
			Ok(lease) => {
				metrics::counter!("tessera_server_tile_locks_granted_total").increment(1);
				debug!(
					conn_id = self.conn_id,
					user_id = user.get(),
					board_id = board.get(),
					tile_id = tile.get(),
					expires_at = lease.expires_at,
					"tile leased"
				);
				Ok(bucket)
			}
			Err(e) => {
				metrics::counter!("tessera_server_tile_locks_denied_total").increment(1);
				if let Err(refund) = repos.users.credit(user, board, now).await {
					warn!(user_id = user.get(), error = %refund, "failed to refund credit after lost lease");
				}
				Err(e.into())
			}
		}
	}

	/// Undo a lease whose paint never landed: release it and refund the credit.
	async fn return_lease(&self, user: UserId, board: BoardId, tile: TileId, now: u64) {
		let repos = &self.state.repos;
		if let Err(e) = repos.locks.release(user, board, tile, now).await {
			debug!(conn_id = self.conn_id, tile_id = tile.get(), error = %e, "lease already gone after failed paint");
		}
		if let Err(e) = repos.users.credit(user, board, now).await {
			warn!(user_id = user.get(), error = %e, "failed to refund credit after failed paint");
		}
	}

	async fn tile_lock(&self, tile: TileId, now: u64) -> Result<(), SessionError> {
		let user = self.player(now).await?;
		let board = self.live_tile(tile, now).await?;
		let repos = &self.state.repos;

		if repos.locks.holds(user.user_id, board, tile, now).await? {
			return self
				.send(&Outbound::TileLocked {
					tile_id: tile,
					user_id: user.user_id,
					bucket: Some(repos.users.bucket_view(&user, board, now)),
				})
				.await;
		}

		let bucket = self.lease_tile(user.user_id, board, tile, now).await?;
		self.state
			.hub
			.broadcast_json(
				Topic::Board(board),
				&Outbound::TileLocked {
					tile_id: tile,
					user_id: user.user_id,
					bucket: Some(bucket),
				},
			)
			.await;
		Ok(())
	}

	async fn tile_lock_release(&self, tile: TileId, now: u64) -> Result<(), SessionError> {
		let id = self.user_id.ok_or(SessionError::AuthRequired)?;
		let board = self.cursors.board.ok_or(SessionError::NoBoard)?;
		let repos = &self.state.repos;

		repos.locks.release(id, board, tile, now).await?;
		let bucket = repos.users.credit(id, board, now).await?;
		self.state
			.hub
			.broadcast_json(
				Topic::Board(board),
				&Outbound::TileLockReleased {
					tile_id: tile,
					user_id: id,
					bucket: Some(bucket),
				},
			)
			.await;
		Ok(())
	}

	/// Binary submission: lease, persist, release, then fan out.
	pub async fn handle_paint(&mut self, data: Bytes) -> Result<(), SessionError> {
		let now = unix_secs_now();
		let user = self.player(now).await?;
		let mut frame = Frame::decode(data.to_vec())?;
		let tile = frame.tile_id();
		let board = self.live_tile(tile, now).await?;
		let repos = &self.state.repos;

		let bucket = if repos.locks.holds(user.user_id, board, tile, now).await? {
			repos.users.bucket_view(&user, board, now)
		} else {
			self.lease_tile(user.user_id, board, tile, now).await?
		};

		frame.set_user_id(user.user_id)?;
		frame.set_deleted(false);
		let generation = match repos.boards.insert(board, &mut frame, now).await {
			Ok(generation) => generation,
			Err(e) => {
				self.return_lease(user.user_id, board, tile, now).await;
				return Err(e.into());
			}
		};
		metrics::counter!("tessera_server_frames_persisted_total").increment(1);

		let date = secs32(now);
		repos
			.tile_history
			.insert(board, tile, generation, frame.id(), date)
			.await?;
		repos
			.user_frames
			.insert(user.user_id, board, generation, frame.id(), date)
			.await?;

		if let Err(e) = repos.locks.release(user.user_id, board, tile, now).await {
			debug!(conn_id = self.conn_id, tile_id = tile.get(), error = %e, "lease already gone after paint");
		}

		let topic = Topic::Board(board);
		self.state
			.hub
			.broadcast_json(
				topic,
				&Outbound::TileLockReleased {
					tile_id: tile,
					user_id: user.user_id,
					bucket: Some(bucket),
				},
			)
			.await;
		self.state.hub.broadcast(topic, Message::Binary(frame.into_bytes())).await;
		Ok(())
	}

	/// Resolve the frame a report or love points at.
	async fn target_frame(
		&self,
		board: Option<BoardId>,
		generation: Option<u16>,
		timecode: u32,
	) -> Result<(BoardId, u16, Frame, u32), SessionError> {
		let board = board.or(self.cursors.board).ok_or(SessionError::NoBoard)?;
		let generation = generation.unwrap_or(self.cursors.generation);
		let boards = &self.state.repos.boards;
		let frame = boards.find(board, generation, timecode).await?;
		let epochs = boards.checkpoints(board).await?;
		let frame_date = boards.frame_time(&epochs, generation, &frame).map(secs32).unwrap_or(0);
		Ok((board, generation, frame, frame_date))
	}

	async fn report(
		&self,
		board: Option<BoardId>,
		generation: Option<u16>,
		timecode: u32,
		reason: String,
		now: u64,
	) -> Result<(), SessionError> {
		let user = self.player(now).await?;
		let (board, generation, frame, frame_date) = self.target_frame(board, generation, timecode).await?;
		let report = Report {
			target_id: frame.user_id(),
			board_id: board,
			generation,
			timecode,
			user_id: user.user_id,
			date: secs32(now),
			frame_date,
			reason,
		};
		self.state.repos.reports.insert(&report).await?;
		info!(
			reporter = user.user_id.get(),
			target = report.target_id.get(),
			board_id = board.get(),
			"frame reported"
		);
		self.state
			.hub
			.broadcast_json(Topic::Moderation, &Outbound::Report(report))
			.await;
		self.send(&Outbound::ReportSuccess {}).await
	}

	async fn report_clear(&self, target: UserId) -> Result<(), SessionError> {
		let moderator = self.moderator().await?;
		let cleared = self.state.repos.reports.clear(target).await?;
		info!(mod_id = moderator.user_id.get(), target = target.get(), cleared, "reports cleared");
		self.state
			.hub
			.broadcast_json(Topic::Moderation, &Outbound::ReportClear { target_id: target })
			.await;
		Ok(())
	}

	async fn love(&self, board: Option<BoardId>, generation: Option<u16>, timecode: u32, now: u64) -> Result<(), SessionError> {
		let user = self.player(now).await?;
		let (board, generation, frame, _) = self.target_frame(board, generation, timecode).await?;
		let love = Love {
			board_id: board,
			user_id: user.user_id,
			generation,
			timecode,
			date: secs32(now),
		};
		self.state.repos.loves.insert(&love).await?;

		let artist = frame.user_id();
		if artist != user.user_id {
			self.state
				.hub
				.broadcast_json(Topic::User(artist), &Outbound::Love(love.clone()))
				.await;
		}
		self.send(&Outbound::Love(love)).await
	}

	/// Record the ban, flag the target, and soft-delete their frames since
	/// `since` on every board they painted.
	async fn user_ban(
		&self,
		target: UserId,
		since: u32,
		duration: u32,
		reason: String,
		ban: bool,
		now: u64,
	) -> Result<(), SessionError> {
		let moderator = self.moderator().await?;
		let repos = &self.state.repos;
		repos.users.find(target).await?;

		let until = secs32(now.saturating_add(u64::from(duration)));
		let record = repos
			.bans
			.insert(UserBan {
				id: 0,
				mod_id: moderator.user_id,
				target_id: target,
				since,
				until,
				reason,
				ban,
			})
			.await?;

		repos
			.users
			.modify(target, |u| {
				if ban {
					u.banned = true;
				}
				u.timeout = u.timeout.max(u64::from(until));
				Ok(())
			})
			.await?;

		let mut flagged = 0;
		for board in repos.user_frames.boards_since(target, since).await? {
			flagged += repos
				.boards
				.delete_user_frames_after(board, target, u64::from(since))
				.await?;
		}
		info!(
			mod_id = moderator.user_id.get(),
			target = target.get(),
			ban_id = record.id,
			ban,
			until,
			flagged,
			"user banned"
		);

		self.state
			.hub
			.broadcast_json(Topic::Global, &Outbound::UserBan(record))
			.await;
		Ok(())
	}

	async fn err_storage(
		&self,
		user_id: Option<UserId>,
		user_agent: String,
		err_type: String,
		now: u64,
	) -> Result<(), SessionError> {
		let fault = Fault {
			minute: secs32(now / 60),
			user_id: self.user_id.or(user_id).unwrap_or_default(),
			err_type,
			user_agent: if user_agent.is_empty() {
				self.user_agent.clone()
			} else {
				user_agent
			},
		};
		self.state.repos.faults.insert(&fault).await?;
		debug!(conn_id = self.conn_id, err_type = %fault.err_type, "client storage fault recorded");
		Ok(())
	}
}
