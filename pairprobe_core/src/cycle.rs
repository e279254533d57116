use crate::device::{Device, DeviceError};
use crate::executor::{AttemptExecutor, ProcessOutput, ToolRun};
use crate::oracle::{AttemptOutcome, Oracle, OutcomeKind};
use crate::passcode::{Passcode, PasscodeSequence};
use crate::stats::{CycleEnd, CycleStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// Faults that end a cycle and the whole campaign with it.
///
/// These mean the harness or its environment is broken; retrying would only
/// hide that, so they are never absorbed.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("device failed to start: {0}")]
    StartupError(#[from] DeviceError),
    #[error("controller executable not found: {program}")]
    ToolMissing { program: String },
    #[error("controller could not be run: {0}")]
    ControllerFailure(String),
    #[error("controller failed with {exit} on passcode {passcode} for an unrecognised reason")]
    TransportError { passcode: Passcode, exit: String },
    #[error("passcode space exhausted")]
    CredentialSpaceExhausted,
}

/// Decides whether a timeout counts as evidence of a lockout defence.
///
/// Timeouts within the first `early_attempt_threshold + 1` attempts of a batch
/// are treated as start-up noise. The threshold is a tunable guess, not a
/// protocol constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutHeuristic {
    pub early_attempt_threshold: usize,
}

impl LockoutHeuristic {
    pub fn new(early_attempt_threshold: usize) -> Self {
        Self {
            early_attempt_threshold,
        }
    }

    pub fn is_evidence(&self, index: usize, kind: OutcomeKind) -> bool {
        kind == OutcomeKind::Timeout && index > self.early_attempt_threshold
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleSettings {
    pub attempts_per_cycle: usize,
    pub lockout: LockoutHeuristic,
}

/// What one cycle produced. `abort` is set when the campaign must stop.
#[derive(Debug)]
pub struct CycleOutcome {
    pub stats: CycleStats,
    pub abort: Option<CycleError>,
}

/// Runs restart-then-batch cycles against a device through a controller.
pub struct CycleController<D, E, O> {
    device: D,
    executor: E,
    oracle: O,
    settings: CycleSettings,
}

impl<D, E, O> CycleController<D, E, O>
where
    D: Device,
    E: AttemptExecutor,
    O: Oracle,
{
    pub fn new(device: D, executor: E, oracle: O, settings: CycleSettings) -> Self {
        Self {
            device,
            executor,
            oracle,
            settings,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn settings(&self) -> &CycleSettings {
        &self.settings
    }

    /// Runs cycle number `cycle`, drawing passcodes from `sequence`.
    ///
    /// `interrupted` is checked before every attempt. The device is stopped before
    /// returning whenever it was started, however the batch ended.
    pub fn run_cycle(
        &mut self,
        cycle: u64,
        sequence: &mut PasscodeSequence,
        interrupted: &AtomicBool,
    ) -> CycleOutcome {
        info!("--- Cycle {cycle} ---");
        let cycle_start = Instant::now();
        let mut stats = CycleStats::new(cycle);

        let restart_start = Instant::now();
        if let Err(e) = self.device.start() {
            error!("failed to start device, aborting");
            stats.end = CycleEnd::Aborted;
            stats.cycle_duration = cycle_start.elapsed();
            return CycleOutcome {
                stats,
                abort: Some(CycleError::StartupError(e)),
            };
        }
        stats.restart_duration = restart_start.elapsed();
        info!(
            "Time to restart commissioning session: {:.2} seconds",
            stats.restart_duration.as_secs_f64()
        );
        info!(
            "device started, beginning {} commissioning attempts",
            self.settings.attempts_per_cycle
        );

        let batch_start = Instant::now();
        let abort = self.run_batch(sequence, interrupted, &mut stats);
        stats.batch_duration = batch_start.elapsed();

        self.device.stop();
        stats.cycle_duration = cycle_start.elapsed();

        info!(
            cycle,
            attempts = stats.attempts,
            timeouts = stats.timeouts,
            lockout_suspected = stats.lockout_suspected,
            end = ?stats.end,
            "cycle finished in {:.2} seconds",
            stats.cycle_duration.as_secs_f64()
        );
        CycleOutcome { stats, abort }
    }

    fn run_batch(
        &mut self,
        sequence: &mut PasscodeSequence,
        interrupted: &AtomicBool,
        stats: &mut CycleStats,
    ) -> Option<CycleError> {
        for index in 0..self.settings.attempts_per_cycle {
            if interrupted.load(Ordering::SeqCst) {
                info!("interrupt requested, ending batch after {index} attempts");
                stats.end = CycleEnd::Interrupted;
                return None;
            }
            let Some(passcode) = sequence.next_passcode() else {
                error!("no passcodes left to try");
                stats.end = CycleEnd::Aborted;
                return Some(CycleError::CredentialSpaceExhausted);
            };

            let outcome = self.attempt(index, passcode);
            let evidence = self.settings.lockout.is_evidence(index, outcome.kind);
            stats.record(&outcome, evidence);

            match outcome.kind {
                OutcomeKind::Success => {
                    error!(
                        %passcode,
                        "commissioning succeeded with a wrong passcode! check the device and controller"
                    );
                    stats.end = CycleEnd::UnexpectedSuccess;
                    return None;
                }
                OutcomeKind::WrongCredential => {}
                OutcomeKind::Timeout if evidence => {
                    warn!(index, "timeout occurred, potentially due to device lockout");
                }
                OutcomeKind::Timeout => {
                    info!(index, "timeout occurred early in cycle");
                }
                OutcomeKind::TransportError | OutcomeKind::Fatal => {
                    error!("unrecoverable error during controller execution, aborting");
                    stats.end = CycleEnd::Aborted;
                    return Some(abort_reason(&outcome));
                }
            }
        }
        stats.end = CycleEnd::Completed;
        None
    }

    fn attempt(&mut self, index: usize, passcode: Passcode) -> AttemptOutcome {
        let started = Instant::now();
        let run = self.executor.execute(passcode);
        let elapsed = started.elapsed();
        let kind = self.oracle.classify(&run);
        let outcome = AttemptOutcome {
            index,
            passcode,
            kind,
            elapsed,
            run,
        };
        report_attempt(&outcome);
        outcome
    }
}

fn abort_reason(outcome: &AttemptOutcome) -> CycleError {
    match &outcome.run {
        ToolRun::Missing { program } => CycleError::ToolMissing {
            program: program.clone(),
        },
        ToolRun::LaunchFailed(reason) => CycleError::ControllerFailure(reason.clone()),
        ToolRun::Exited(output) | ToolRun::TimedOut(output) => CycleError::TransportError {
            passcode: outcome.passcode,
            exit: output.describe_exit(),
        },
    }
}

fn dump_output(label: &str, output: &ProcessOutput) {
    warn!(
        "\n----- controller stdout ({label}) -----\n{}\n----- controller stderr ({label}) -----\n{}\n--------------------------------------",
        String::from_utf8_lossy(&output.stdout).trim(),
        String::from_utf8_lossy(&output.stderr).trim(),
    );
}

fn report_attempt(outcome: &AttemptOutcome) {
    let passcode = outcome.passcode;
    let secs = outcome.elapsed.as_secs_f64();
    match (&outcome.kind, &outcome.run) {
        (OutcomeKind::Success, _) => {
            error!("Attempting passcode: {passcode} ... SUCCESS (Unexpected!) - Duration: {secs:.2}s")
        }
        (OutcomeKind::WrongCredential, _) => {
            info!("Attempting passcode: {passcode} ... FAIL (Wrong Passcode) - Duration: {secs:.2}s")
        }
        (OutcomeKind::Timeout, ToolRun::TimedOut(output)) => {
            dump_output("Command Timeout", output);
            warn!("Attempting passcode: {passcode} ... FAIL (Command Timeout) - Duration: {secs:.2}s")
        }
        (OutcomeKind::Timeout, run) => {
            if let Some(output) = run.output() {
                dump_output("Timeout", output);
            }
            warn!("Attempting passcode: {passcode} ... FAIL (Timeout) - Duration: {secs:.2}s")
        }
        (OutcomeKind::TransportError, run) => {
            let exit = run
                .output()
                .map(ProcessOutput::describe_exit)
                .unwrap_or_else(|| "no exit status".to_string());
            error!("Attempting passcode: {passcode} ... FAIL (Unknown Error, {exit}) - Duration: {secs:.2}s");
            if let Some(output) = run.output() {
                dump_output("Unknown Error", output);
            }
        }
        (OutcomeKind::Fatal, ToolRun::Missing { program }) => {
            error!("Attempting passcode: {passcode} ... FAIL (Fatal, controller executable not found at {program}) - Duration: {secs:.2}s")
        }
        (OutcomeKind::Fatal, ToolRun::LaunchFailed(reason)) => {
            error!("Attempting passcode: {passcode} ... FAIL (Fatal, {reason}) - Duration: {secs:.2}s")
        }
        (OutcomeKind::Fatal, run) => {
            error!("Attempting passcode: {passcode} ... FAIL (Fatal, {run:?}) - Duration: {secs:.2}s")
        }
    }
}
