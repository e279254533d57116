use crate::oracle::{OutcomeKind, Signature, SignatureTable};
use crate::passcode::PASSCODE_CEILING;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device command is empty")]
    EmptyDeviceCommand,
    #[error("controller command is empty")]
    EmptyControllerCommand,
    #[error("attempts-per-cycle must be at least 1")]
    ZeroAttemptsPerCycle,
    #[error("start passcode {0} is above the passcode ceiling 99999998")]
    StartPasscodeOutOfRange(u32),
    #[error("signature pattern for {0:?} is empty")]
    EmptySignaturePattern(OutcomeKind),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DeviceSettings {
    #[serde(default = "default_device_command")]
    pub command: Vec<String>,
    #[serde(default = "default_state_file")]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_reader_join_ms")]
    pub reader_join_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_device_command() -> Vec<String> {
    vec!["chip-lighting-app".to_string()]
}

fn default_state_file() -> Option<PathBuf> {
    Some(PathBuf::from("/tmp/chip_kvs"))
}

fn default_settle_ms() -> u64 {
    5000
}

fn default_reader_join_ms() -> u64 {
    2000
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_kill_wait_ms() -> u64 {
    2000
}

impl DeviceSettings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn reader_join(&self) -> Duration {
        Duration::from_millis(self.reader_join_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            command: default_device_command(),
            state_file: default_state_file(),
            settle_ms: default_settle_ms(),
            reader_join_ms: default_reader_join_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            kill_wait_ms: default_kill_wait_ms(),
            working_dir: None,
        }
    }
}

/// One row of the `[[controller.signatures]]` table.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SignatureSettings {
    pub pattern: String,
    pub outcome: OutcomeKind,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ControllerSettings {
    #[serde(default = "default_controller_command")]
    pub command: Vec<String>,
    #[serde(default = "default_node_id")]
    pub node_id: u64,
    #[serde(default = "default_discriminator")]
    pub discriminator: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_timeout_margin_secs")]
    pub timeout_margin_secs: u64,
    #[serde(default = "default_signatures")]
    pub signatures: Vec<SignatureSettings>,
    pub working_dir: Option<PathBuf>,
}

fn default_controller_command() -> Vec<String> {
    vec![
        "chip-tool".to_string(),
        "pairing".to_string(),
        "onnetwork-long".to_string(),
    ]
}

fn default_node_id() -> u64 {
    5
}

fn default_discriminator() -> u16 {
    3840
}

fn default_timeout_secs() -> u64 {
    7
}

fn default_timeout_margin_secs() -> u64 {
    5
}

fn default_signatures() -> Vec<SignatureSettings> {
    SignatureTable::default()
        .iter()
        .map(|sig| SignatureSettings {
            pattern: sig.pattern.clone(),
            outcome: sig.outcome,
        })
        .collect()
}

impl ControllerSettings {
    /// Hard limit the harness enforces on a single invocation.
    pub fn harness_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs + self.timeout_margin_secs)
    }

    pub fn signature_table(&self) -> SignatureTable {
        SignatureTable::new(
            self.signatures
                .iter()
                .map(|s| Signature::new(s.pattern.clone(), s.outcome))
                .collect(),
        )
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            command: default_controller_command(),
            node_id: default_node_id(),
            discriminator: default_discriminator(),
            timeout_secs: default_timeout_secs(),
            timeout_margin_secs: default_timeout_margin_secs(),
            signatures: default_signatures(),
            working_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    #[serde(default = "default_correct_passcode")]
    pub correct_passcode: u32,
    #[serde(default = "default_start_passcode")]
    pub start_passcode: u32,
    #[serde(default = "default_attempts_per_cycle")]
    pub attempts_per_cycle: usize,
    /// `None` runs until interrupted or aborted.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: Option<u64>,
    #[serde(default = "default_early_attempt_threshold")]
    pub early_attempt_threshold: usize,
    #[serde(default)]
    pub skip_forbidden: bool,
    pub timings_out: Option<PathBuf>,
}

pub fn default_correct_passcode() -> u32 {
    20191960
}

pub fn default_start_passcode() -> u32 {
    20202020
}

pub fn default_attempts_per_cycle() -> usize {
    20
}

pub fn default_max_cycles() -> Option<u64> {
    Some(10)
}

pub fn default_early_attempt_threshold() -> usize {
    3
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            correct_passcode: default_correct_passcode(),
            start_passcode: default_start_passcode(),
            attempts_per_cycle: default_attempts_per_cycle(),
            max_cycles: default_max_cycles(),
            early_attempt_threshold: default_early_attempt_threshold(),
            skip_forbidden: false,
            timings_out: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub campaign: CampaignSettings,
}

impl ProbeConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: ProbeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.command.is_empty() {
            return Err(ConfigError::EmptyDeviceCommand);
        }
        if self.controller.command.is_empty() {
            return Err(ConfigError::EmptyControllerCommand);
        }
        if self.campaign.attempts_per_cycle == 0 {
            return Err(ConfigError::ZeroAttemptsPerCycle);
        }
        if self.campaign.skip_forbidden && self.campaign.start_passcode > PASSCODE_CEILING {
            return Err(ConfigError::StartPasscodeOutOfRange(
                self.campaign.start_passcode,
            ));
        }
        if let Some(sig) = self.controller.signatures.iter().find(|s| s.pattern.is_empty()) {
            return Err(ConfigError::EmptySignaturePattern(sig.outcome));
        }
        Ok(())
    }
}
