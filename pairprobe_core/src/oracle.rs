use crate::executor::ToolRun;
use crate::passcode::Passcode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Signature the controller prints when the peer rejects the passcode.
pub const WRONG_PASSCODE_SIGNATURE: &str = "CHIP Error 0x000000AC";
/// Signature the controller prints when the peer stops responding.
pub const PROTOCOL_TIMEOUT_SIGNATURE: &str = "CHIP Error 0x00000032";

/// The closed set of verdicts an attempt can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The controller reported a completed pairing. Never expected, since the
    /// known-correct passcode is never submitted.
    Success,
    WrongCredential,
    Timeout,
    /// The controller failed for a reason no signature explains.
    TransportError,
    /// The controller could not be run at all.
    Fatal,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::WrongCredential => "wrong_credential",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::TransportError => "transport_error",
            OutcomeKind::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

/// An output substring the controller is known to print, and what it means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub pattern: String,
    pub outcome: OutcomeKind,
}

impl Signature {
    pub fn new(pattern: impl Into<String>, outcome: OutcomeKind) -> Self {
        Self {
            pattern: pattern.into(),
            outcome,
        }
    }
}

/// Ordered lookup table from controller output signatures to outcomes.
///
/// Patterns are matched as exact substrings, first match wins. The table is
/// configuration: supporting a new controller error format means adding a row,
/// not touching [`SignatureOracle::classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureTable {
    entries: Vec<Signature>,
}

impl SignatureTable {
    pub fn new(entries: Vec<Signature>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.entries.iter()
    }

    /// Returns the outcome of the first signature contained in `text`.
    pub fn lookup(&self, text: &str) -> Option<OutcomeKind> {
        self.entries
            .iter()
            .find(|sig| text.contains(sig.pattern.as_str()))
            .map(|sig| sig.outcome)
    }
}

impl Default for SignatureTable {
    fn default() -> Self {
        Self::new(vec![
            Signature::new(WRONG_PASSCODE_SIGNATURE, OutcomeKind::WrongCredential),
            Signature::new(PROTOCOL_TIMEOUT_SIGNATURE, OutcomeKind::Timeout),
        ])
    }
}

/// The judged result of one pairing attempt. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// Zero-based position of the attempt within its cycle's batch.
    pub index: usize,
    pub passcode: Passcode,
    pub kind: OutcomeKind,
    pub elapsed: Duration,
    /// What the controller invocation actually produced, kept for diagnostics.
    pub run: ToolRun,
}

/// An `Oracle` turns the raw result of a controller invocation into a verdict.
///
/// Implementations must be pure: the same [`ToolRun`] always yields the same
/// [`OutcomeKind`], and every possible run yields some verdict.
pub trait Oracle: Send + Sync {
    fn classify(&self, run: &ToolRun) -> OutcomeKind;
}

/// The standard `Oracle`, driven by a [`SignatureTable`].
///
/// Priority order:
/// 1. exit code zero is `Success`, whatever the output says;
/// 2. the first matching signature in the captured stdout and stderr;
/// 3. a harness-level timeout is `Timeout`;
/// 4. a missing or unlaunchable controller is `Fatal`;
/// 5. anything else is `TransportError`.
#[derive(Debug, Clone, Default)]
pub struct SignatureOracle {
    table: SignatureTable,
}

impl SignatureOracle {
    pub fn new(table: SignatureTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &SignatureTable {
        &self.table
    }
}

impl Oracle for SignatureOracle {
    fn classify(&self, run: &ToolRun) -> OutcomeKind {
        match run {
            ToolRun::Exited(output) if output.exit_code == Some(0) => OutcomeKind::Success,
            ToolRun::Exited(output) => self
                .table
                .lookup(&output.combined_text())
                .unwrap_or(OutcomeKind::TransportError),
            ToolRun::TimedOut(output) => self
                .table
                .lookup(&output.combined_text())
                .unwrap_or(OutcomeKind::Timeout),
            ToolRun::Missing { .. } | ToolRun::LaunchFailed(_) => OutcomeKind::Fatal,
        }
    }
}
