#![forbid(unsafe_code)]

//! Periodic housekeeping kept off the request path: retention sweeps for
//! moderation records and hub gauges.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tessera_store::RepoError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::state::AppState;
use crate::util::time::unix_secs_now;

const MAINTENANCE_EVERY: Duration = Duration::from_secs(300);
const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
	pub reports: usize,
	pub loves: usize,
	pub faults: usize,
	/// Swept fault count per client error type.
	pub fault_types: BTreeMap<String, usize>,
}

pub fn spawn_maintenance(state: Arc<AppState>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(MAINTENANCE_EVERY);
		loop {
			interval.tick().await;
			publish_hub_gauges(&state).await;
			match sweep_expired(&state, unix_secs_now()).await {
				Ok(Some(report)) if report != SweepReport::default() => {
					info!(
						reports = report.reports,
						loves = report.loves,
						faults = report.faults,
						fault_types = ?report.fault_types,
						"retention sweep removed records"
					);
				}
				Ok(_) => debug!("retention sweep: nothing to remove"),
				Err(e) => warn!(error = %e, "retention sweep failed"),
			}
		}
	})
}

async fn publish_hub_gauges(state: &AppState) {
	if let Some(stats) = state.hub.stats().await {
		metrics::gauge!("tessera_server_hub_connections").set(stats.connections as f64);
		metrics::gauge!("tessera_server_hub_topics").set(stats.topics as f64);
	}
}

/// Drop reports, loves and faults older than the retention window.
/// Returns `None` when retention is disabled.
pub async fn sweep_expired(state: &AppState, now: u64) -> Result<Option<SweepReport>, RepoError> {
	let days = state.config.storage.retention_days;
	if days == 0 {
		return Ok(None);
	}
	let cutoff = now.saturating_sub(u64::from(days) * DAY_SECS);
	let cutoff32 = u32::try_from(cutoff).unwrap_or(u32::MAX);
	let repos = &state.repos;

	let reports = repos.reports.sweep(cutoff32).await?.len();
	let loves = repos.loves.sweep(cutoff32).await?.len();
	let faults = repos.faults.sweep(u32::try_from(cutoff / 60).unwrap_or(u32::MAX)).await?;

	let mut fault_types: BTreeMap<String, usize> = BTreeMap::new();
	for fault in &faults {
		*fault_types.entry(fault.err_type.clone()).or_default() += 1;
	}
	Ok(Some(SweepReport {
		reports,
		loves,
		faults: faults.len(),
		fault_types,
	}))
}

#[cfg(test)]
mod tests {
	use tessera_domain::{BoardId, Fault, Report, UserId};
	use tessera_store::{Repos, StoreFactory};

	use super::*;
	use crate::config::{ServerConfig, StorageKind};
	use crate::server::hub::{HubConfig, spawn_hub};

	const NOW: u64 = 1_700_000_000;

	async fn state(retention_days: u32) -> AppState {
		let mut cfg = ServerConfig::default();
		cfg.storage.backend = StorageKind::Memory;
		cfg.storage.retention_days = retention_days;
		let repos = Repos::open(Arc::new(StoreFactory::memory()), cfg.repo_settings())
			.await
			.expect("open repos");
		let (hub, _) = spawn_hub(HubConfig::default());
		AppState::new(cfg, repos, hub)
	}

	fn report(reporter: u32, date: u64) -> Report {
		Report {
			target_id: UserId(5),
			board_id: BoardId(1),
			generation: 0,
			timecode: 0x0102,
			user_id: UserId(reporter),
			date: u32::try_from(date).expect("u32"),
			frame_date: 0,
			reason: "spam".into(),
		}
	}

	fn fault(err_type: &str, at: u64) -> Fault {
		Fault {
			minute: u32::try_from(at / 60).expect("u32"),
			user_id: UserId(9),
			err_type: err_type.into(),
			user_agent: "agent".into(),
		}
	}

	#[tokio::test]
	async fn sweep_drops_only_records_past_retention() {
		let state = state(7).await;
		let old = NOW - 8 * DAY_SECS;
		let fresh = NOW - DAY_SECS;
		let repos = &state.repos;
		repos.reports.insert(&report(1, old)).await.expect("insert");
		repos.reports.insert(&report(2, fresh)).await.expect("insert");
		repos.faults.insert(&fault("quota", old)).await.expect("insert");
		repos.faults.insert(&fault("quota", old + 60)).await.expect("insert");
		repos.faults.insert(&fault("private", fresh)).await.expect("insert");

		let swept = sweep_expired(&state, NOW).await.expect("sweep").expect("enabled");
		assert_eq!(swept.reports, 1);
		assert_eq!(swept.loves, 0);
		assert_eq!(swept.faults, 2);
		assert_eq!(swept.fault_types.get("quota"), Some(&2));

		let left = repos.reports.all().await.expect("reports");
		assert_eq!(left, vec![report(2, fresh)]);
		assert_eq!(sweep_expired(&state, NOW).await.expect("sweep"), Some(SweepReport::default()));
	}

	#[tokio::test]
	async fn zero_retention_keeps_everything() {
		let state = state(0).await;
		state.repos.reports.insert(&report(1, 0)).await.expect("insert");
		assert_eq!(sweep_expired(&state, NOW).await.expect("sweep"), None);
		assert_eq!(state.repos.reports.all().await.expect("reports").len(), 1);
	}
}
