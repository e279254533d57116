//! End-to-end campaigns against shell stand-ins for the device and the controller.

use pairprobe_core::campaign::CommandCampaign;
use pairprobe_core::config::{ProbeConfig, SignatureSettings};
use pairprobe_core::cycle::CycleError;
use pairprobe_core::device::DeviceState;
use pairprobe_core::oracle::OutcomeKind;
use pairprobe_core::passcode::Passcode;
use pairprobe_core::process::group_exists;
use pairprobe_core::stats::{CampaignEnd, CycleEnd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

fn get_test_target_path(name: &str) -> String {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let path = manifest_dir.join("../test_targets").join(name);
    if !path.exists() {
        panic!("Test target missing: {path:?}");
    }
    path.to_str().unwrap().to_string()
}

fn config_for(controller_script: &str, pid_file: &Path, state_file: &Path) -> ProbeConfig {
    let mut config = ProbeConfig::default();
    config.device.command = vec![
        "/bin/sh".to_string(),
        get_test_target_path("device_pidfile.sh"),
        pid_file.to_str().unwrap().to_string(),
    ];
    config.device.state_file = Some(state_file.to_path_buf());
    config.device.settle_ms = 200;
    config.device.reader_join_ms = 100;
    config.device.stop_grace_ms = 1000;
    config.controller.command = vec!["/bin/sh".to_string(), get_test_target_path(controller_script)];
    config.controller.timeout_secs = 2;
    config.controller.timeout_margin_secs = 1;
    config.campaign.max_cycles = Some(1);
    config
}

fn recorded_pgid(pid_file: &Path) -> i32 {
    std::fs::read_to_string(pid_file)
        .expect("device should have written its pid")
        .trim()
        .parse()
        .expect("pid file holds a number")
}

fn assert_group_gone(pgid: i32) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while group_exists(pgid) {
        assert!(
            Instant::now() < deadline,
            "device process group {pgid} is still alive"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn never_interrupted() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[test]
fn rejected_passcodes_complete_the_cycle_and_leave_no_device() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("device.pid");
    let state_file = dir.path().join("chip_kvs");
    std::fs::write(&state_file, b"stale fabric").unwrap();

    let mut config = config_for("controller_wrong_passcode.sh", &pid_file, &state_file);
    config.campaign.attempts_per_cycle = 3;
    let mut campaign = CommandCampaign::from_config(&config, never_interrupted());
    let report = campaign.run();

    assert!(matches!(report.end, CampaignEnd::Completed), "{}", report.end);
    assert_eq!(report.stats.cycles, 1);
    assert_eq!(report.stats.total_attempts, 3);
    assert_eq!(report.stats.last_passcode, Some(Passcode::new(20202022)));
    assert!(report.stats.average_per_attempt().is_some());

    let cycle = &report.cycles[0];
    assert_eq!(cycle.end, CycleEnd::Completed);
    assert!(!cycle.lockout_suspected);
    assert!(
        cycle
            .samples
            .iter()
            .all(|s| s.outcome == OutcomeKind::WrongCredential)
    );

    assert!(!state_file.exists());
    assert_eq!(campaign.cycles().device().state(), DeviceState::Absent);
    assert_group_gone(recorded_pgid(&pid_file));
}

#[test]
fn success_on_second_attempt_halts_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("device.pid");
    let mut config = config_for(
        "controller_success_on.sh",
        &pid_file,
        &dir.path().join("chip_kvs"),
    );
    config.campaign.attempts_per_cycle = 5;
    let mut campaign = CommandCampaign::from_config(&config, never_interrupted());
    let report = campaign.run();

    let cycle = &report.cycles[0];
    assert_eq!(cycle.end, CycleEnd::UnexpectedSuccess);
    assert_eq!(cycle.attempts, 2);
    assert_eq!(cycle.samples[1].outcome, OutcomeKind::Success);
    assert_eq!(cycle.last_passcode, Some(Passcode::new(20202021)));
    assert!(!report.end.is_abort());
    assert_group_gone(recorded_pgid(&pid_file));
}

#[test]
fn invalid_controller_path_aborts_after_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("device.pid");
    let mut config = config_for(
        "controller_wrong_passcode.sh",
        &pid_file,
        &dir.path().join("chip_kvs"),
    );
    config.controller.command = vec!["./no_such_chip_tool_12345".to_string()];
    config.campaign.max_cycles = Some(5);
    let mut campaign = CommandCampaign::from_config(&config, never_interrupted());
    let report = campaign.run();

    match &report.end {
        CampaignEnd::Aborted(CycleError::ToolMissing { program }) => {
            assert_eq!(program, "./no_such_chip_tool_12345")
        }
        other => panic!("Expected ToolMissing abort, got {other}"),
    }
    assert_eq!(report.stats.cycles, 1);
    assert_eq!(report.stats.total_attempts, 1);
    assert_eq!(report.cycles[0].samples[0].outcome, OutcomeKind::Fatal);
    assert_group_gone(recorded_pgid(&pid_file));
}

#[test]
fn late_timeouts_are_flagged_as_suspected_lockout() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("device.pid");
    let mut config = config_for(
        "controller_timeout_from.sh",
        &pid_file,
        &dir.path().join("chip_kvs"),
    );
    config.campaign.start_passcode = 98;
    config.campaign.attempts_per_cycle = 6;
    let mut campaign = CommandCampaign::from_config(&config, never_interrupted());
    let report = campaign.run();

    let cycle = &report.cycles[0];
    assert_eq!(cycle.end, CycleEnd::Completed);
    assert_eq!(cycle.timeouts, 2);
    assert!(cycle.lockout_suspected);
    assert_eq!(report.lockout_suspected_cycles(), 1);
    assert_group_gone(recorded_pgid(&pid_file));
}

#[test]
fn unrecognised_controller_failure_aborts_as_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("device.pid");
    let mut config = config_for(
        "controller_unknown_error.sh",
        &pid_file,
        &dir.path().join("chip_kvs"),
    );
    config.campaign.max_cycles = None;
    let mut campaign = CommandCampaign::from_config(&config, never_interrupted());
    let report = campaign.run();

    match &report.end {
        CampaignEnd::Aborted(CycleError::TransportError { passcode, exit }) => {
            assert_eq!(*passcode, Passcode::new(20202020));
            assert_eq!(exit, "exit code 3");
        }
        other => panic!("Expected TransportError abort, got {other}"),
    }
    assert_eq!(report.stats.cycles, 1);
    assert_group_gone(recorded_pgid(&pid_file));
}

#[test]
fn custom_signature_table_reclassifies_controller_output() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("device.pid");
    let mut config = config_for(
        "controller_unknown_error.sh",
        &pid_file,
        &dir.path().join("chip_kvs"),
    );
    config.controller.signatures.push(SignatureSettings {
        pattern: "mDNS: browse failed".to_string(),
        outcome: OutcomeKind::Timeout,
    });
    config.campaign.attempts_per_cycle = 2;
    let mut campaign = CommandCampaign::from_config(&config, never_interrupted());
    let report = campaign.run();

    assert!(matches!(report.end, CampaignEnd::Completed), "{}", report.end);
    assert_eq!(report.cycles[0].timeouts, 2);
    assert!(!report.cycles[0].lockout_suspected);
}

#[test]
fn device_that_dies_on_launch_aborts_the_campaign() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(
        "controller_wrong_passcode.sh",
        &dir.path().join("device.pid"),
        &dir.path().join("chip_kvs"),
    );
    config.device.command = vec!["/bin/sh".to_string(), get_test_target_path("device_exits.sh")];
    config.campaign.max_cycles = Some(3);
    let mut campaign = CommandCampaign::from_config(&config, never_interrupted());
    let report = campaign.run();

    assert!(matches!(
        report.end,
        CampaignEnd::Aborted(CycleError::StartupError(_))
    ));
    assert_eq!(report.stats.cycles, 1);
    assert_eq!(report.stats.total_attempts, 0);
    assert_eq!(report.stats.average_per_attempt(), None);
}

#[test]
fn interrupt_mid_campaign_stops_the_device_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("device.pid");
    let mut config = config_for(
        "controller_wrong_passcode.sh",
        &pid_file,
        &dir.path().join("chip_kvs"),
    );
    config.campaign.max_cycles = None;
    config.campaign.attempts_per_cycle = 1000;
    let interrupted = never_interrupted();
    let mut campaign = CommandCampaign::from_config(&config, Arc::clone(&interrupted));

    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(800));
        interrupted.store(true, Ordering::SeqCst);
    });
    let report = campaign.run();
    trigger.join().unwrap();

    assert!(matches!(report.end, CampaignEnd::Interrupted), "{}", report.end);
    assert_eq!(report.stats.cycles, 1);
    assert_eq!(report.cycles[0].end, CycleEnd::Interrupted);
    assert!(report.stats.total_attempts < 1000);
    assert_eq!(campaign.cycles().device().state(), DeviceState::Absent);
    assert_group_gone(recorded_pgid(&pid_file));
}
