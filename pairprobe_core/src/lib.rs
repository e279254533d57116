pub mod campaign;
pub mod config;
pub mod cycle;
pub mod device;
pub mod executor;
pub mod oracle;
pub mod passcode;
pub mod process;
pub mod stats;

pub use campaign::{Campaign, CommandCampaign};
pub use config::{ConfigError, ProbeConfig};
pub use cycle::{CycleController, CycleError, CycleOutcome, CycleSettings, LockoutHeuristic};
pub use device::{Device, DeviceError, DeviceSession, DeviceSessionConfig, DeviceState};
pub use executor::{AttemptExecutor, CommandExecutor, CommandExecutorConfig, ProcessOutput, ToolRun};
pub use oracle::{AttemptOutcome, Oracle, OutcomeKind, Signature, SignatureOracle, SignatureTable};
pub use passcode::{Passcode, PasscodeSequence};
pub use stats::{CampaignEnd, CampaignReport, CampaignStats, CycleEnd, CycleStats};
