//! BDD scenarios for the reconciliation cycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ReconcileContext, reconcile_context};

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Record a new instance with a discovered login"
)]
fn scenario_new_instance(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Terminate an instance missing from the snapshot"
)]
fn scenario_vanished_instance(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Terminate the instances of a pair whose listing failed"
)]
fn scenario_failed_listing(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Keep a new instance when every login is refused"
)]
fn scenario_refused_logins(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}
