//! One reconciliation cycle: fetch, diff, probe, persist.
//!
//! The [`Reconciler`] owns every collaborator explicitly; nothing is looked
//! up from process-wide state. Per-pair fetches and per-instance probes run
//! on the blocking pool, bounded by semaphores, and store access is batched
//! onto the same pool. Classification only starts once every fetch of the
//! cycle has finished.

pub mod diff;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::fetch::{FetchTarget, SnapshotFetcher};
use crate::instance::{Instance, RUNNING};
use crate::probe::{Candidate, CredentialProbe, FailureReason, ProbeReport};
use crate::store::{InventoryStore, StoreError};
use crate::translate::{OsMap, RawInstance, TagFilter, translate};

/// Errors that abort a reconciliation cycle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The inventory store failed; the rest of the cycle was abandoned.
    #[error("inventory store failure: {0}")]
    Store(#[from] StoreError),
    /// A blocking store task panicked or was cancelled.
    #[error("inventory store worker failed: {0}")]
    Worker(#[from] JoinError),
}

/// Inputs of a cycle that do not change between cycles.
#[derive(Clone, Debug, Default)]
pub struct CycleSettings {
    /// (account, region) pairs to list.
    pub targets: Vec<FetchTarget>,
    /// Ordered credential candidates for new instances.
    pub candidates: Vec<Candidate>,
    /// Required and ignored tag keys.
    pub tag_filter: TagFilter,
    /// Platform-to-OS rewrites.
    pub os_map: OsMap,
    /// Maximum concurrent fetches.
    pub fetch_workers: usize,
    /// Maximum concurrent probes.
    pub probe_workers: usize,
}

/// A sub-fetch that failed; its pair contributed nothing to the snapshot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FetchWarning {
    /// Account of the failed pair.
    pub account: String,
    /// Region of the failed pair.
    pub region: String,
    /// Error text.
    pub message: String,
}

/// What credential discovery did for one new instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeStatus {
    /// A candidate opened a working session.
    Found {
        /// Login user.
        user: String,
        /// Port probed.
        port: u16,
        /// Key path, empty for password candidates.
        key: String,
    },
    /// Every candidate failed.
    NotFound {
        /// Terminal reason.
        reason: FailureReason,
    },
    /// The instance was not eligible for probing.
    Skipped {
        /// Why the probe was not attempted.
        reason: String,
    },
}

/// Credential discovery result for one instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProbeOutcome {
    /// Instance the probe targeted.
    pub instance_id: String,
    /// Result.
    #[serde(flatten)]
    pub status: ProbeStatus,
}

/// Aggregated result of a completed cycle.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CycleSummary {
    /// Instances in the merged snapshot.
    pub observed: usize,
    /// Instances dropped by the required-tag filter.
    pub excluded: usize,
    /// Snapshot ids without an active row before this cycle.
    pub new_ids: Vec<String>,
    /// Snapshot ids that already had an active row.
    pub updated_ids: Vec<String>,
    /// Active ids missing from the snapshot, now terminated.
    pub terminated_ids: Vec<String>,
    /// Failed sub-fetches.
    pub fetch_warnings: Vec<FetchWarning>,
    /// Credential discovery results, ordered by instance id.
    pub probes: Vec<ProbeOutcome>,
}

/// Drives reconciliation cycles against one store.
pub struct Reconciler<S, F, P> {
    store: Arc<S>,
    fetcher: Arc<F>,
    probe: Arc<P>,
    settings: CycleSettings,
}

impl<S, F, P> Reconciler<S, F, P>
where
    S: InventoryStore + 'static,
    F: SnapshotFetcher + 'static,
    P: CredentialProbe + 'static,
{
    /// Wires the collaborators of a cycle together.
    #[must_use]
    pub fn new(store: S, fetcher: F, probe: P, settings: CycleSettings) -> Self {
        Self {
            store: Arc::new(store),
            fetcher: Arc::new(fetcher),
            probe: Arc::new(probe),
            settings,
        }
    }

    /// Store the reconciler writes to.
    #[must_use]
    pub fn store(&self) -> &S {
        self.store.as_ref()
    }

    /// Runs one complete cycle.
    ///
    /// Taking `&mut self` keeps two cycles from overlapping on one store.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Store`] when any store operation fails and
    /// [`ReconcileError::Worker`] when a store task dies; the remainder of
    /// the cycle is skipped.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, ReconcileError> {
        info!(targets = self.settings.targets.len(), "starting reconciliation cycle");
        let mut summary = CycleSummary::default();

        let listings = self.fetch_all().await;
        let mut snapshot = BTreeMap::new();
        for (target, result) in listings {
            match result {
                Ok(raws) => {
                    summary.excluded += self.merge(&target, &raws, &mut snapshot);
                }
                Err(message) => {
                    warn!(
                        account = %target.account,
                        region = %target.region,
                        error = %message,
                        "snapshot fetch failed; pair skipped for this cycle"
                    );
                    summary.fetch_warnings.push(FetchWarning {
                        account: target.account,
                        region: target.region,
                        message,
                    });
                }
            }
        }
        summary.observed = snapshot.len();

        let ids: Vec<String> = snapshot.keys().cloned().collect();
        let (new_ids, active, known) = self
            .with_store(move |store| {
                let fresh = diff::new_ids(&ids, |id| store.exists(id))?;
                let active = store.active_instance_ids()?;
                let mut known = Vec::new();
                for id in ids.iter().filter(|id| fresh.binary_search(id).is_err()) {
                    if let Some(stored) = store.instance(id)? {
                        known.push(stored);
                    }
                }
                Ok((fresh, active, known))
            })
            .await?;
        summary.terminated_ids = diff::terminated_ids(&active, snapshot.keys());
        summary.updated_ids = snapshot
            .keys()
            .filter(|id| new_ids.binary_search(id).is_err())
            .cloned()
            .collect();
        summary.new_ids = new_ids;
        for stored in &known {
            if let Some(instance) = snapshot.get_mut(&stored.id) {
                instance.carry_forward(stored);
            }
        }

        summary.probes = self.discover_credentials(&summary.new_ids, &mut snapshot).await;

        let rows: Vec<Instance> = snapshot.into_values().collect();
        let terminated = summary.terminated_ids.clone();
        self.with_store(move |store| {
            for instance in &rows {
                store.upsert(instance)?;
                store.replace_tags(instance)?;
            }
            store.mark_terminated(&terminated)
        })
        .await?;

        info!(
            observed = summary.observed,
            new = summary.new_ids.len(),
            updated = summary.updated_ids.len(),
            terminated = summary.terminated_ids.len(),
            warnings = summary.fetch_warnings.len(),
            "reconciliation cycle complete"
        );
        Ok(summary)
    }

    /// Runs `op` against the store on the blocking pool.
    async fn with_store<T, Op>(&self, op: Op) -> Result<T, ReconcileError>
    where
        T: Send + 'static,
        Op: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let done = task::spawn_blocking(move || op(&store)).await?;
        Ok(done?)
    }

    /// Translates, filters and merges one pair's listing. Returns the number
    /// of excluded descriptors.
    fn merge(
        &self,
        target: &FetchTarget,
        raws: &[RawInstance],
        snapshot: &mut BTreeMap<String, Instance>,
    ) -> usize {
        let placement = target.placement();
        let mut excluded = 0;
        for raw in raws {
            let mut instance = translate(raw, &placement, &self.settings.os_map);
            if !self.settings.tag_filter.admits(&instance) {
                debug!(instance_id = %instance.id, "missing required tags; excluded");
                excluded += 1;
                continue;
            }
            self.settings.tag_filter.scrub(&mut instance);
            snapshot.insert(instance.id.clone(), instance);
        }
        excluded
    }

    async fn fetch_all(&self) -> Vec<(FetchTarget, Result<Vec<RawInstance>, String>)> {
        let semaphore = Arc::new(Semaphore::new(self.settings.fetch_workers.max(1)));
        let mut set = JoinSet::new();
        for (index, target) in self.settings.targets.iter().cloned().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let pool = Arc::clone(&semaphore);
            set.spawn(async move {
                let result = match pool.acquire_owned().await {
                    Ok(permit) => {
                        let blocking_target = target.clone();
                        let joined =
                            task::spawn_blocking(move || fetcher.fetch(&blocking_target)).await;
                        drop(permit);
                        match joined {
                            Ok(fetched) => fetched.map_err(|err| err.to_string()),
                            Err(err) => Err(format!("fetch worker failed: {err}")),
                        }
                    }
                    Err(err) => Err(format!("fetch worker pool closed: {err}")),
                };
                (index, target, result)
            });
        }

        let mut listings = Vec::with_capacity(self.settings.targets.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(listing) => listings.push(listing),
                Err(err) => warn!(error = %err, "fetch task aborted"),
            }
        }
        // Merge in configuration order so duplicate ids resolve the same way
        // every cycle.
        listings.sort_by_key(|(index, _, _)| *index);
        listings
            .into_iter()
            .map(|(_, target, result)| (target, result))
            .collect()
    }

    async fn discover_credentials(
        &self,
        new_ids: &[String],
        snapshot: &mut BTreeMap<String, Instance>,
    ) -> Vec<ProbeOutcome> {
        let candidates: Arc<[Candidate]> = Arc::from(self.settings.candidates.as_slice());
        let semaphore = Arc::new(Semaphore::new(self.settings.probe_workers.max(1)));
        let mut outcomes = Vec::new();
        let mut set = JoinSet::new();

        for id in new_ids {
            let Some(instance) = snapshot.get(id) else {
                continue;
            };
            let host = match probe_target(instance) {
                Ok(host) => host.to_owned(),
                Err(reason) => {
                    debug!(instance_id = %id, %reason, "probe skipped");
                    outcomes.push(ProbeOutcome {
                        instance_id: id.clone(),
                        status: ProbeStatus::Skipped { reason },
                    });
                    continue;
                }
            };
            let port = instance.ssh_port_or_default();
            let probe = Arc::clone(&self.probe);
            let tried = Arc::clone(&candidates);
            let pool = Arc::clone(&semaphore);
            let instance_id = id.clone();
            set.spawn(async move {
                let report = match pool.acquire_owned().await {
                    Ok(permit) => {
                        let joined = task::spawn_blocking(move || {
                            probe.probe(&host, port, &tried)
                        })
                        .await;
                        drop(permit);
                        joined.map_err(|err| format!("probe worker failed: {err}"))
                    }
                    Err(err) => Err(format!("probe worker pool closed: {err}")),
                };
                (instance_id, report)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (instance_id, attempted) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(error = %err, "probe task aborted");
                    continue;
                }
            };
            let status = match attempted {
                Ok(report) => fold_report(&instance_id, &report, snapshot),
                Err(detail) => ProbeStatus::NotFound {
                    reason: FailureReason::Unclassified { detail },
                },
            };
            outcomes.push(ProbeOutcome {
                instance_id,
                status,
            });
        }
        outcomes.sort_by(|left, right| left.instance_id.cmp(&right.instance_id));
        outcomes
    }
}

/// Address to probe, or why the instance is not eligible.
fn probe_target(instance: &Instance) -> Result<&str, String> {
    if instance.skip {
        return Err(String::from("skip flag set"));
    }
    if instance.state != RUNNING {
        return Err(format!("state is {}", instance.state));
    }
    instance
        .connection_address()
        .ok_or_else(|| String::from("no public or private address"))
}

/// Writes a successful candidate back into the in-memory instance.
fn fold_report(
    instance_id: &str,
    report: &ProbeReport,
    snapshot: &mut BTreeMap<String, Instance>,
) -> ProbeStatus {
    match (&report.chosen, snapshot.get_mut(instance_id)) {
        (Some(chosen), Some(instance)) => {
            let key = chosen
                .key
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            instance.user.clone_from(&chosen.user);
            instance.ssh_key.clone_from(&key);
            instance.ssh_port = Some(report.port);
            info!(instance_id, user = %chosen.user, port = report.port, "credential discovered");
            ProbeStatus::Found {
                user: chosen.user.clone(),
                port: report.port,
                key,
            }
        }
        _ => {
            let reason = report.reason.clone().unwrap_or(FailureReason::Unclassified {
                detail: String::from("no candidate succeeded"),
            });
            info!(instance_id, %reason, "no working credential found");
            ProbeStatus::NotFound { reason }
        }
    }
}
