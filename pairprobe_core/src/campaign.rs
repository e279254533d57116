use crate::config::ProbeConfig;
use crate::cycle::{CycleController, CycleSettings, LockoutHeuristic};
use crate::device::{Device, DeviceSession, DeviceSessionConfig};
use crate::executor::{AttemptExecutor, CommandExecutor, CommandExecutorConfig};
use crate::oracle::{Oracle, SignatureOracle};
use crate::passcode::PasscodeSequence;
use crate::stats::{CampaignEnd, CampaignReport, CampaignStats, CycleEnd, CycleStats};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{error, info};

/// The production wiring: a real device process and the real controller tool.
pub type CommandCampaign = Campaign<DeviceSession, CommandExecutor, SignatureOracle>;

/// Top-level loop: runs cycles until the cycle budget is spent, the operator
/// interrupts, or a cycle reports a harness fault.
///
/// Whatever ends the loop, the device is stopped once more before the report is
/// built, and the report is always produced.
pub struct Campaign<D, E, O> {
    cycles: CycleController<D, E, O>,
    sequence: PasscodeSequence,
    max_cycles: Option<u64>,
    interrupted: Arc<AtomicBool>,
}

impl<D, E, O> Campaign<D, E, O>
where
    D: Device,
    E: AttemptExecutor,
    O: Oracle,
{
    pub fn new(
        cycles: CycleController<D, E, O>,
        sequence: PasscodeSequence,
        max_cycles: Option<u64>,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cycles,
            sequence,
            max_cycles,
            interrupted,
        }
    }

    /// Handle the operator side (e.g. a Ctrl-C handler) sets to request a stop.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn cycles(&self) -> &CycleController<D, E, O> {
        &self.cycles
    }

    pub fn run(&mut self) -> CampaignReport {
        self.run_with(|_| {})
    }

    /// Like [`Campaign::run`], handing each finished cycle's stats to `on_cycle` as it ends.
    pub fn run_with<F>(&mut self, mut on_cycle: F) -> CampaignReport
    where
        F: FnMut(&CycleStats),
    {
        let started = Instant::now();
        let mut stats = CampaignStats::default();
        let mut history = Vec::new();

        let end = loop {
            if self.max_cycles.is_some_and(|max| stats.cycles >= max) {
                break CampaignEnd::Completed;
            }
            if self.interrupted.load(Ordering::SeqCst) {
                info!("interrupt received, cleaning up");
                break CampaignEnd::Interrupted;
            }

            stats.cycles += 1;
            let outcome = self
                .cycles
                .run_cycle(stats.cycles, &mut self.sequence, &self.interrupted);
            stats.absorb(&outcome.stats);
            on_cycle(&outcome.stats);
            let cycle_end = outcome.stats.end;
            history.push(outcome.stats);

            if let Some(abort) = outcome.abort {
                error!("aborting campaign: {abort}");
                break CampaignEnd::Aborted(abort);
            }
            if cycle_end == CycleEnd::Interrupted {
                info!("interrupt received, cleaning up");
                break CampaignEnd::Interrupted;
            }
        };

        info!("performing final cleanup");
        self.cycles.device_mut().stop();

        stats.total_duration = started.elapsed();
        CampaignReport {
            stats,
            end,
            cycles: history,
        }
    }
}

impl CommandCampaign {
    pub fn from_config(config: &ProbeConfig, interrupted: Arc<AtomicBool>) -> Self {
        let device = DeviceSession::new(DeviceSessionConfig::from_settings(&config.device));
        let executor = CommandExecutor::new(CommandExecutorConfig::from_settings(&config.controller));
        let oracle = SignatureOracle::new(config.controller.signature_table());
        let settings = CycleSettings {
            attempts_per_cycle: config.campaign.attempts_per_cycle,
            lockout: LockoutHeuristic::new(config.campaign.early_attempt_threshold),
        };
        let sequence = PasscodeSequence::new(
            config.campaign.start_passcode,
            config.campaign.correct_passcode,
        )
        .skip_forbidden(config.campaign.skip_forbidden);

        Campaign::new(
            CycleController::new(device, executor, oracle, settings),
            sequence,
            config.campaign.max_cycles,
            interrupted,
        )
    }
}
