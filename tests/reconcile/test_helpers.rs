//! Shared fixtures for reconciliation BDD scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use fleetroll::test_support::{ScriptedRunner, StaticFetcher};
use fleetroll::{CycleSummary, FetchTarget};
use rstest::fixture;
use tempfile::TempDir;

/// State threaded through the steps of one scenario.
///
/// The inventory lives in a database file so that seeding, the cycle and
/// the assertions each open their own store, as separate runs would.
#[derive(Clone, Debug)]
pub struct ReconcileContext {
    pub workdir: Arc<TempDir>,
    pub targets: Vec<FetchTarget>,
    pub fetcher: StaticFetcher,
    pub runner: ScriptedRunner,
    pub summary: Option<CycleSummary>,
}

impl ReconcileContext {
    pub fn database_path(&self) -> Utf8PathBuf {
        let db = self.workdir.path().join("inventory.db");
        Utf8PathBuf::from_path_buf(db)
            .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()))
    }

    pub fn add_target(&mut self, account: &str, region: &str) {
        let already_listed = self
            .targets
            .iter()
            .any(|target| target.account == account && target.region == region);
        if !already_listed {
            self.targets.push(FetchTarget {
                account: account.to_owned(),
                region: region.to_owned(),
                env: String::from("production"),
            });
        }
    }
}

#[fixture]
pub fn reconcile_context() -> ReconcileContext {
    let workdir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    ReconcileContext {
        workdir: Arc::new(workdir),
        targets: Vec::new(),
        fetcher: StaticFetcher::new(),
        runner: ScriptedRunner::new(),
        summary: None,
    }
}
