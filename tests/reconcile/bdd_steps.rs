//! BDD step definitions for the reconciliation cycle.

use fleetroll::instance::TERMINATED;
use fleetroll::test_support::{instance_fixture, output, raw_instance};
use fleetroll::{
    Candidate, CycleSettings, InventoryStore, ProbeStatus, ReconcileError, Reconciler,
    SqliteStore, SshProbe, SshProbeConfig, StoreError, TagFilter,
};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::ReconcileContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("an empty inventory")]
fn empty_inventory(reconcile_context: ReconcileContext) -> ReconcileContext {
    reconcile_context
}

#[given("an inventory holding instance \"{id}\"")]
fn inventory_holding(
    reconcile_context: ReconcileContext,
    id: String,
) -> Result<ReconcileContext, StepError> {
    let store = SqliteStore::open_and_init(&reconcile_context.database_path())?;
    store.upsert(&instance_fixture(&id))?;
    Ok(reconcile_context)
}

#[given("account \"{account}\" in region \"{region}\" lists instance \"{id}\" at \"{address}\"")]
fn account_lists_instance(
    mut reconcile_context: ReconcileContext,
    account: String,
    region: String,
    id: String,
    address: String,
) -> ReconcileContext {
    reconcile_context.add_target(&account, &region);
    reconcile_context.fetcher = reconcile_context.fetcher.with_listing(
        &account,
        &region,
        vec![raw_instance(&id, &address)],
    );
    reconcile_context
}

#[given("listing account \"{account}\" in region \"{region}\" fails")]
fn listing_fails(
    mut reconcile_context: ReconcileContext,
    account: String,
    region: String,
) -> ReconcileContext {
    reconcile_context.add_target(&account, &region);
    reconcile_context
}

#[given("only user \"{user}\" is accepted")]
fn only_user_accepted(reconcile_context: ReconcileContext, user: String) -> ReconcileContext {
    reconcile_context
        .runner
        .respond_when(format!("-l {user}"), output(Some(0), "", ""));
    reconcile_context
        .runner
        .set_fallback(output(Some(255), "", "Permission denied (publickey)."));
    reconcile_context
}

#[given("every login is refused")]
fn every_login_refused(reconcile_context: ReconcileContext) -> ReconcileContext {
    reconcile_context.runner.set_fallback(output(
        Some(255),
        "",
        "ssh: connect to host 10.0.0.5 port 22: Connection refused",
    ));
    reconcile_context
}

#[when("a reconciliation cycle runs")]
fn run_cycle(mut reconcile_context: ReconcileContext) -> Result<ReconcileContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let store = SqliteStore::open_and_init(&reconcile_context.database_path())?;
    let settings = CycleSettings {
        targets: reconcile_context.targets.clone(),
        candidates: vec![
            Candidate::with_key("ubuntu", "/keys/id_ed25519"),
            Candidate::with_key("ec2-user", "/keys/id_ed25519"),
        ],
        tag_filter: TagFilter::default(),
        os_map: Default::default(),
        fetch_workers: 2,
        probe_workers: 2,
    };
    let probe = SshProbe::new(SshProbeConfig::default(), reconcile_context.runner.clone());
    let mut reconciler =
        Reconciler::new(store, reconcile_context.fetcher.clone(), probe, settings);

    let summary = runtime.block_on(async move { reconciler.run_cycle().await })?;
    reconcile_context.summary = Some(summary);
    Ok(reconcile_context)
}

fn open_store(reconcile_context: &ReconcileContext) -> Result<SqliteStore, StepError> {
    Ok(SqliteStore::open_and_init(&reconcile_context.database_path())?)
}

#[then("instance \"{id}\" is active")]
fn instance_active(reconcile_context: &ReconcileContext, id: String) -> Result<(), StepError> {
    let store = open_store(reconcile_context)?;
    if store.exists(&id)? {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("{id} has no active row")))
    }
}

#[then("instance \"{id}\" is terminated")]
fn instance_terminated(reconcile_context: &ReconcileContext, id: String) -> Result<(), StepError> {
    let store = open_store(reconcile_context)?;
    if store.exists(&id)? {
        return Err(StepError::Assertion(format!("{id} is still active")));
    }
    let terminated = store
        .list_instances(true)?
        .iter()
        .any(|instance| instance.id == id && instance.state == TERMINATED);
    if terminated {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("{id} has no terminated row")))
    }
}

#[then("instance \"{id}\" logs in as \"{user}\"")]
fn instance_logs_in_as(
    reconcile_context: &ReconcileContext,
    id: String,
    user: String,
) -> Result<(), StepError> {
    let store = open_store(reconcile_context)?;
    let instance = store
        .instance(&id)?
        .ok_or_else(|| StepError::Assertion(format!("{id} has no active row")))?;
    if instance.user == user && instance.ssh_key == "/keys/id_ed25519" {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {user} with /keys/id_ed25519, found {:?} with {:?}",
            instance.user, instance.ssh_key
        )))
    }
}

#[then("instance \"{id}\" has no login user")]
fn instance_has_no_login(reconcile_context: &ReconcileContext, id: String) -> Result<(), StepError> {
    let store = open_store(reconcile_context)?;
    let instance = store
        .instance(&id)?
        .ok_or_else(|| StepError::Assertion(format!("{id} has no active row")))?;
    if instance.user.is_empty() && instance.ssh_key.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no credential, found user {:?}",
            instance.user
        )))
    }
}

#[then("the cycle reports {count} fetch warnings")]
fn cycle_reports_warnings(reconcile_context: &ReconcileContext, count: usize) -> Result<(), StepError> {
    let summary = reconcile_context
        .summary
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("no cycle has run")))?;
    if summary.fetch_warnings.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} warnings, got {:?}",
            summary.fetch_warnings
        )))
    }
}

#[then("the probe of \"{id}\" failed with \"{kind}\"")]
fn probe_failed_with(
    reconcile_context: &ReconcileContext,
    id: String,
    kind: String,
) -> Result<(), StepError> {
    let summary = reconcile_context
        .summary
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("no cycle has run")))?;
    let outcome = summary
        .probes
        .iter()
        .find(|probe| probe.instance_id == id)
        .ok_or_else(|| StepError::Assertion(format!("{id} was not probed")))?;
    let ProbeStatus::NotFound { ref reason } = outcome.status else {
        return Err(StepError::Assertion(format!(
            "expected a failed probe, got {:?}",
            outcome.status
        )));
    };
    let rendered =
        serde_json::to_value(reason).map_err(|err| StepError::Assertion(err.to_string()))?;
    if rendered.get("kind").and_then(|value| value.as_str()) == Some(kind.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("expected {kind}, got {rendered}")))
    }
}
