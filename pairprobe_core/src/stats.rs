use crate::cycle::CycleError;
use crate::oracle::{AttemptOutcome, OutcomeKind};
use crate::passcode::Passcode;
use serde::{Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// How a cycle's batch of attempts came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleEnd {
    /// Every attempt of the batch ran.
    Completed,
    /// The controller reported a pairing; the rest of the batch was skipped.
    UnexpectedSuccess,
    /// The operator asked to stop between two attempts.
    Interrupted,
    /// A harness fault ended the cycle and the campaign with it.
    Aborted,
}

/// Timing of a single attempt, kept for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptSample {
    pub passcode: Passcode,
    pub outcome: OutcomeKind,
    #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleStats {
    pub cycle: u64,
    pub attempts: usize,
    pub first_passcode: Option<Passcode>,
    pub last_passcode: Option<Passcode>,
    pub timeouts: usize,
    pub lockout_suspected: bool,
    #[serde(rename = "restart_secs", serialize_with = "as_secs")]
    pub restart_duration: Duration,
    #[serde(rename = "batch_secs", serialize_with = "as_secs")]
    pub batch_duration: Duration,
    #[serde(rename = "cycle_secs", serialize_with = "as_secs")]
    pub cycle_duration: Duration,
    pub end: CycleEnd,
    pub samples: Vec<AttemptSample>,
}

impl CycleStats {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            attempts: 0,
            first_passcode: None,
            last_passcode: None,
            timeouts: 0,
            lockout_suspected: false,
            restart_duration: Duration::ZERO,
            batch_duration: Duration::ZERO,
            cycle_duration: Duration::ZERO,
            end: CycleEnd::Completed,
            samples: Vec::new(),
        }
    }

    /// Folds one attempt in. `lockout_evidence` comes from the lockout heuristic.
    pub fn record(&mut self, outcome: &AttemptOutcome, lockout_evidence: bool) {
        self.attempts += 1;
        self.first_passcode.get_or_insert(outcome.passcode);
        self.last_passcode = Some(outcome.passcode);
        if outcome.kind == OutcomeKind::Timeout {
            self.timeouts += 1;
        }
        if lockout_evidence {
            self.lockout_suspected = true;
        }
        self.samples.push(AttemptSample {
            passcode: outcome.passcode,
            outcome: outcome.kind,
            elapsed: outcome.elapsed,
        });
    }
}

impl fmt::Display for CycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Cycle {} Finished ---", self.cycle)?;
        writeln!(f, "Attempts in this cycle: {}", self.attempts)?;
        match (self.first_passcode, self.last_passcode) {
            (Some(first), Some(last)) => writeln!(f, "Passcodes tried: {first} to {last}")?,
            _ => writeln!(f, "Passcodes tried: none")?,
        }
        writeln!(
            f,
            "Time to restart commissioning session: {:.2} seconds",
            self.restart_duration.as_secs_f64()
        )?;
        writeln!(
            f,
            "Time for {} attempts: {:.2} seconds",
            self.attempts,
            self.batch_duration.as_secs_f64()
        )?;
        write!(
            f,
            "Cycle duration: {:.2} seconds",
            self.cycle_duration.as_secs_f64()
        )?;
        if self.lockout_suspected {
            write!(
                f,
                "\nLockout was suspected during this cycle (based on timeouts)."
            )?;
        }
        Ok(())
    }
}

/// Cumulative counters owned by the campaign driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CampaignStats {
    pub cycles: u64,
    pub total_attempts: u64,
    pub last_passcode: Option<Passcode>,
    #[serde(rename = "total_secs", serialize_with = "as_secs")]
    pub total_duration: Duration,
}

impl CampaignStats {
    pub fn absorb(&mut self, cycle: &CycleStats) {
        self.total_attempts += cycle.attempts as u64;
        if cycle.last_passcode.is_some() {
            self.last_passcode = cycle.last_passcode;
        }
    }

    /// `None` until at least one attempt has run.
    pub fn average_per_attempt(&self) -> Option<Duration> {
        if self.total_attempts == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            self.total_duration.as_secs_f64() / self.total_attempts as f64,
        ))
    }
}

/// Why the campaign loop stopped.
#[derive(Debug)]
pub enum CampaignEnd {
    /// The configured number of cycles ran.
    Completed,
    Interrupted,
    Aborted(CycleError),
}

impl CampaignEnd {
    pub fn is_abort(&self) -> bool {
        matches!(self, CampaignEnd::Aborted(_))
    }
}

impl fmt::Display for CampaignEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CampaignEnd::Completed => f.write_str("completed"),
            CampaignEnd::Interrupted => f.write_str("interrupted"),
            CampaignEnd::Aborted(e) => write!(f, "aborted: {e}"),
        }
    }
}

/// Everything a finished campaign has to say, whatever ended it.
#[derive(Debug)]
pub struct CampaignReport {
    pub stats: CampaignStats,
    pub end: CampaignEnd,
    pub cycles: Vec<CycleStats>,
}

#[derive(Serialize)]
struct TimingExport<'a> {
    end: String,
    #[serde(flatten)]
    stats: &'a CampaignStats,
    average_secs_per_attempt: Option<f64>,
    cycles: &'a [CycleStats],
}

impl CampaignReport {
    pub fn lockout_suspected_cycles(&self) -> usize {
        self.cycles.iter().filter(|c| c.lockout_suspected).count()
    }

    /// Writes the raw per-cycle and per-attempt timings as JSON for offline analysis.
    pub fn write_timings(&self, path: &Path) -> Result<(), anyhow::Error> {
        let file = File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create timings file {:?}: {}", path, e))?;
        let mut writer = BufWriter::new(file);
        let export = TimingExport {
            end: self.end.to_string(),
            stats: &self.stats,
            average_secs_per_attempt: self.stats.average_per_attempt().map(|d| d.as_secs_f64()),
            cycles: &self.cycles,
        };
        serde_json::to_writer_pretty(&mut writer, &export)?;
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Display for CampaignReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Test Finished ({}) ---", self.end)?;
        writeln!(f, "Total cycles completed: {}", self.stats.cycles)?;
        writeln!(f, "Total attempts overall: {}", self.stats.total_attempts)?;
        match self.stats.last_passcode {
            Some(passcode) => writeln!(f, "Last passcode tried: {passcode}")?,
            None => writeln!(f, "Last passcode tried: none")?,
        }
        writeln!(
            f,
            "Cycles with suspected lockout: {}",
            self.lockout_suspected_cycles()
        )?;
        write!(
            f,
            "Total duration: {:.2} seconds",
            self.stats.total_duration.as_secs_f64()
        )?;
        if let Some(average) = self.stats.average_per_attempt() {
            write!(
                f,
                "\nAverage time per attempt: {:.2} seconds",
                average.as_secs_f64()
            )?;
        }
        Ok(())
    }
}
