//! Unit tests for the SSH credential probe.

use super::classify::{classify, classify_stderr};
use super::*;
use crate::test_support::{ScriptedRunner, output};
use rstest::{fixture, rstest};

const REFUSED: &str = "ssh: connect to host 10.0.0.9 port 22: Connection refused\r\n";
const DENIED: &str = "ubuntu@10.0.0.9: Permission denied (publickey).\r\n";
const TIMED_OUT: &str = "ssh: connect to host 10.0.0.9 port 22: Connection timed out\r\n";

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn probe_with(runner: &ScriptedRunner) -> SshProbe<ScriptedRunner> {
    SshProbe::new(SshProbeConfig::default(), runner.clone())
}

#[rstest]
fn empty_candidate_list_fails_without_io(runner: ScriptedRunner) {
    let report = probe_with(&runner).probe("10.0.0.9", 22, &[]);

    assert!(!report.is_success());
    assert!(matches!(
        report.reason,
        Some(FailureReason::Configuration { .. })
    ));
    assert_eq!(report.exit_code(), 255);
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[case::neither(Candidate { user: String::from("ubuntu"), key: None, password: None })]
#[case::both(Candidate {
    user: String::from("ubuntu"),
    key: Some(Utf8PathBuf::from("/keys/id_rsa")),
    password: Some(String::from("hunter2")),
})]
fn malformed_candidate_fails_without_io(runner: ScriptedRunner, #[case] bad: Candidate) {
    let candidates = [Candidate::with_key("root", "/keys/id_ed25519"), bad];

    let report = probe_with(&runner).probe("10.0.0.9", 22, &candidates);

    assert!(matches!(
        report.reason,
        Some(FailureReason::Configuration { .. })
    ));
    assert!(runner.invocations().is_empty());
}

#[rstest]
fn stops_at_first_successful_candidate(runner: ScriptedRunner) {
    runner.push_failure(255, DENIED);
    runner.push_success();
    let candidates = [
        Candidate::with_key("u1", "/keys/bad"),
        Candidate::with_key("u2", "/keys/good"),
        Candidate::with_key("u3", "/keys/other"),
    ];

    let report = probe_with(&runner).probe("10.0.0.9", 22, &candidates);

    assert!(report.is_success());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.chosen.as_ref().map(|c| c.user.as_str()), Some("u2"));
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(runner.invocations().len(), 2);
}

#[rstest]
fn first_candidate_success_is_never_overridden(runner: ScriptedRunner) {
    runner.set_fallback(output(Some(0), "", ""));
    let candidates = [
        Candidate::with_key("u2", "/keys/good"),
        Candidate::with_key("u1", "/keys/bad"),
    ];

    let report = probe_with(&runner).probe("10.0.0.9", 22, &candidates);

    assert_eq!(report.chosen.map(|c| c.user), Some(String::from("u2")));
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
fn refused_host_is_classified_as_refused(runner: ScriptedRunner) {
    runner.set_fallback(output(Some(255), "", REFUSED));
    let candidates = [
        Candidate::with_key("ubuntu", "/keys/a"),
        Candidate::with_key("ec2-user", "/keys/a"),
    ];

    let report = probe_with(&runner).probe("10.0.0.9", 22, &candidates);

    assert_eq!(report.reason, Some(FailureReason::ConnectionRefused));
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.attempts.len(), 2);
}

#[rstest]
fn terminal_reason_is_highest_precedence_observed(runner: ScriptedRunner) {
    runner.push_failure(255, TIMED_OUT);
    runner.push_failure(255, DENIED);
    runner.push_failure(255, REFUSED);
    let candidates = [
        Candidate::with_key("a", "/keys/a"),
        Candidate::with_key("b", "/keys/b"),
        Candidate::with_key("c", "/keys/c"),
    ];

    let report = probe_with(&runner).probe("10.0.0.9", 22, &candidates);

    assert_eq!(report.reason, Some(FailureReason::Authentication));
    assert_eq!(report.exit_code(), 1);
}

#[rstest]
fn key_candidates_use_batch_mode_and_identity(runner: ScriptedRunner) {
    runner.push_success();

    probe_with(&runner).probe("host.example", 2222, &[Candidate::with_key("ubuntu", "/keys/id_rsa")]);

    let calls = runner.invocations();
    let line = calls
        .first()
        .map(crate::test_support::CommandInvocation::command_string)
        .unwrap_or_default();
    assert!(line.starts_with("ssh "));
    assert!(line.contains("-o BatchMode=yes"));
    assert!(line.contains("-o IdentitiesOnly=yes"));
    assert!(line.contains("-o ConnectTimeout=5"));
    assert!(line.contains("-o ServerAliveInterval=5 -o ServerAliveCountMax=1"));
    assert!(line.contains("-p 2222 -i /keys/id_rsa -l ubuntu -- host.example ls -l /"));
    assert_eq!(calls.first().and_then(|call| call.limit), Some(ATTEMPT_TIMEOUT));
}

#[rstest]
fn host_cannot_be_read_as_an_option(runner: ScriptedRunner) {
    runner.push_failure(255, "ssh: Could not resolve hostname -oproxycommand=true");

    probe_with(&runner).probe("-oProxyCommand=true", 22, &[Candidate::with_key("u", "/k")]);

    let calls = runner.invocations();
    let args: Vec<String> = calls
        .first()
        .map(|call| {
            call.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    let host_at = args.iter().position(|arg| arg == "-oProxyCommand=true");
    let guard_at = args.iter().position(|arg| arg == "--");
    assert!(
        matches!((guard_at, host_at), (Some(guard), Some(host)) if guard + 1 == host),
        "host must follow the option terminator: {args:?}"
    );
}

#[rstest]
fn overrunning_attempt_is_a_timeout(runner: ScriptedRunner) {
    runner.time_out_when("-l stalled");
    runner.push_failure(255, DENIED);
    let candidates = [
        Candidate::with_key("stalled", "/keys/a"),
        Candidate::with_key("other", "/keys/a"),
    ];

    let report = probe_with(&runner).probe("10.0.0.9", 22, &candidates);

    assert_eq!(
        report.attempts.first().and_then(ConnectionAttempt::failure_reason),
        Some(&FailureReason::Timeout)
    );
    assert_eq!(report.attempts.len(), 2, "a stalled attempt must not end the walk");
    assert_eq!(report.reason, Some(FailureReason::Authentication));
}

#[rstest]
fn password_candidates_pass_secret_through_environment(runner: ScriptedRunner) {
    runner.push_success();

    let report = probe_with(&runner).probe(
        "10.0.0.9",
        22,
        &[Candidate::with_password("admin", "hunter2")],
    );

    let calls = runner.invocations();
    let call = calls.first().expect("one invocation");
    assert_eq!(call.program, "sshpass");
    assert!(!call.command_string().contains("hunter2"));
    assert_eq!(
        call.env,
        vec![(String::from("SSHPASS"), String::from("hunter2"))]
    );
    let json = serde_json::to_string(&report).expect("report serialises");
    assert!(!json.contains("hunter2"));
    assert!(!format!("{report:?}").contains("hunter2"));
}

#[rstest]
fn rejected_sshpass_password_is_authentication(runner: ScriptedRunner) {
    runner.push_failure(5, "");

    let report = probe_with(&runner).probe(
        "10.0.0.9",
        22,
        &[Candidate::with_password("admin", "wrong")],
    );

    assert_eq!(report.reason, Some(FailureReason::Authentication));
}

#[rstest]
fn failing_check_command_is_not_a_success(runner: ScriptedRunner) {
    runner.push_failure(2, "ls: cannot access '/': Permission denied");

    let report = probe_with(&runner).probe("10.0.0.9", 22, &[Candidate::with_key("u", "/k")]);

    assert!(!report.is_success());
    assert!(matches!(
        report.reason,
        Some(FailureReason::Unclassified { .. })
    ));
}

#[rstest]
fn spawn_failure_preserves_raw_error(runner: ScriptedRunner) {
    let report = probe_with(&runner).probe("10.0.0.9", 22, &[Candidate::with_key("u", "/k")]);

    let attempt = report.attempts.first().expect("one attempt");
    match &attempt.outcome {
        AttemptOutcome::Failure { reason, raw_error } => {
            assert!(matches!(reason, FailureReason::Unclassified { .. }));
            assert!(raw_error.contains("no scripted response"));
        }
        AttemptOutcome::Success => panic!("spawn failure must not succeed"),
    }
}

#[rstest]
#[case("ssh: Could not resolve hostname nowhere: Name or service not known", FailureReason::NameResolution { temporary: false })]
#[case("ssh: Could not resolve hostname db: Temporary failure in name resolution", FailureReason::NameResolution { temporary: true })]
#[case("ssh: connect to host h port 22: Operation timed out", FailureReason::Timeout)]
#[case("Received disconnect: Too many authentication failures", FailureReason::Authentication)]
fn stderr_markers_map_to_taxonomy(#[case] stderr: &str, #[case] expected: FailureReason) {
    assert_eq!(classify_stderr(&stderr.to_lowercase()), Some(expected));
}

#[rstest]
#[case(FailureReason::Authentication, 1)]
#[case(FailureReason::Timeout, 2)]
#[case(FailureReason::ConnectionRefused, 3)]
#[case(FailureReason::NameResolution { temporary: false }, 5)]
#[case(FailureReason::NameResolution { temporary: true }, 6)]
#[case(FailureReason::Unclassified { detail: String::from("x") }, 255)]
fn exit_codes_follow_the_taxonomy(#[case] reason: FailureReason, #[case] code: i32) {
    assert_eq!(reason.exit_code(), code);
}

#[rstest]
fn unknown_connection_error_is_unclassified() {
    let result = classify(&output(Some(255), "", "kex_exchange_identification: read: Connection reset by peer"), false);
    assert!(matches!(
        result,
        Some(FailureReason::Unclassified { detail }) if detail.contains("Connection reset")
    ));
}

#[rstest]
fn chosen_key_path_serialises_as_a_string(runner: ScriptedRunner) {
    runner.push_success();

    let report = probe_with(&runner).probe(
        "10.0.0.9",
        22,
        &[Candidate::with_key("ubuntu", "/keys/id_ed25519")],
    );

    let json = serde_json::to_value(&report).expect("report serialises");
    assert_eq!(json["chosen"]["key"], "/keys/id_ed25519");
    assert_eq!(json["chosen"]["user"], "ubuntu");
}
