use crate::config::ControllerSettings;
use crate::passcode::Passcode;
use crate::process::{isolate_group, pgid_of, signal_group, wait_with_timeout};
use nix::sys::signal::Signal;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Everything the controller left behind after one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    /// Stdout followed by stderr, lossily decoded. Signatures are matched against this.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }

    pub fn describe_exit(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("terminated by signal {signal}"),
            (None, None) => "no exit status".to_string(),
        }
    }
}

/// Raw, unjudged result of running the controller once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRun {
    /// The controller ran to completion (successfully or not).
    Exited(ProcessOutput),
    /// The harness-level deadline fired and the controller was killed.
    TimedOut(ProcessOutput),
    /// The controller executable does not exist.
    Missing { program: String },
    /// The controller could not be spawned or reaped for another OS reason.
    LaunchFailed(String),
}

impl ToolRun {
    pub fn output(&self) -> Option<&ProcessOutput> {
        match self {
            ToolRun::Exited(output) | ToolRun::TimedOut(output) => Some(output),
            ToolRun::Missing { .. } | ToolRun::LaunchFailed(_) => None,
        }
    }
}

/// Runs one pairing attempt against the device with a single candidate passcode.
///
/// No retries and no judgement happen here; that belongs to the `Oracle` and the
/// cycle controller.
pub trait AttemptExecutor {
    fn execute(&mut self, passcode: Passcode) -> ToolRun;
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    /// Program plus leading arguments, e.g. `chip-tool pairing onnetwork-long`.
    pub command: Vec<String>,
    pub node_id: u64,
    pub discriminator: u16,
    /// Value handed to the controller's own `--timeout` flag.
    pub tool_timeout_secs: u64,
    /// Deadline the harness enforces, normally the tool timeout plus a margin.
    pub harness_timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

impl CommandExecutorConfig {
    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self {
            command: settings.command.clone(),
            node_id: settings.node_id,
            discriminator: settings.discriminator,
            tool_timeout_secs: settings.timeout_secs,
            harness_timeout: settings.harness_timeout(),
            working_dir: settings.working_dir.clone(),
        }
    }

    /// Positional arguments appended to `command` for one attempt.
    pub fn attempt_args(&self, passcode: Passcode) -> Vec<String> {
        vec![
            self.node_id.to_string(),
            passcode.to_string(),
            self.discriminator.to_string(),
            "--timeout".to_string(),
            self.tool_timeout_secs.to_string(),
        ]
    }
}

/// `AttemptExecutor` that shells out to the external controller tool.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }
}

fn spawn_capture<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.read_to_end(&mut buf) {
                debug!("controller output capture ended early: {e}");
            }
        }
        buf
    })
}

/// Minimum time granted to the capture threads once the controller group is gone.
const CAPTURE_GRACE: Duration = Duration::from_millis(500);

fn join_within(reader: JoinHandle<Vec<u8>>, deadline: Instant) -> Vec<u8> {
    while !reader.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if reader.is_finished() {
        reader.join().unwrap_or_default()
    } else {
        // A process outside the controller's group still holds the pipe; leave the thread behind.
        warn!("controller output capture still open at the deadline, discarding it");
        Vec::new()
    }
}

fn collect(
    readers: (JoinHandle<Vec<u8>>, JoinHandle<Vec<u8>>),
    deadline: Instant,
) -> (Vec<u8>, Vec<u8>) {
    let (stdout, stderr) = readers;
    (join_within(stdout, deadline), join_within(stderr, deadline))
}

impl AttemptExecutor for CommandExecutor {
    fn execute(&mut self, passcode: Passcode) -> ToolRun {
        let Some((program, leading_args)) = self.config.command.split_first() else {
            return ToolRun::LaunchFailed("controller command is empty".to_string());
        };

        let mut cmd = Command::new(program);
        cmd.args(leading_args)
            .args(self.config.attempt_args(passcode))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        isolate_group(&mut cmd);

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return ToolRun::Missing {
                    program: program.clone(),
                };
            }
            Err(e) => {
                return ToolRun::LaunchFailed(format!(
                    "Failed to spawn command '{:?}': {e}",
                    self.config.command
                ));
            }
        };
        let pgid = pgid_of(&child);
        let readers = (
            spawn_capture(child.stdout.take()),
            spawn_capture(child.stderr.take()),
        );

        match wait_with_timeout(&mut child, self.config.harness_timeout) {
            Ok(Some(status)) => {
                // Helpers forked by the controller may outlive it and keep the capture pipes open.
                if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
                    warn!("failed to sweep controller group {pgid}: {e}");
                }
                let deadline = (started + self.config.harness_timeout)
                    .max(Instant::now() + CAPTURE_GRACE);
                let (stdout, stderr) = collect(readers, deadline);
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                ToolRun::Exited(ProcessOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    signal,
                })
            }
            Ok(None) => {
                warn!(
                    %passcode,
                    timeout = ?self.config.harness_timeout,
                    "controller exceeded the harness deadline, killing it"
                );
                if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
                    warn!("failed to kill timed-out controller group {pgid}: {e}");
                }
                let _ = child.wait();
                let (stdout, stderr) = collect(readers, Instant::now() + CAPTURE_GRACE);
                ToolRun::TimedOut(ProcessOutput {
                    stdout,
                    stderr,
                    exit_code: None,
                    signal: None,
                })
            }
            Err(e) => {
                let _ = signal_group(pgid, Signal::SIGKILL);
                let _ = child.wait();
                let _ = collect(readers, Instant::now() + CAPTURE_GRACE);
                ToolRun::LaunchFailed(format!("Error waiting for controller: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn script_executor(name: &str, harness_timeout: Duration) -> CommandExecutor {
        let target_path = get_test_target_path(name);
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        CommandExecutor::new(CommandExecutorConfig {
            command: vec![
                "/bin/sh".to_string(),
                target_path.to_str().unwrap().to_string(),
            ],
            node_id: 5,
            discriminator: 3840,
            tool_timeout_secs: 7,
            harness_timeout,
            working_dir: None,
        })
    }

    #[test]
    fn attempt_args_follow_the_pairing_command_layout() {
        let config = CommandExecutorConfig::from_settings(&ControllerSettings::default());
        assert_eq!(
            config.attempt_args(Passcode::new(20202020)),
            vec!["5", "20202020", "3840", "--timeout", "7"]
        );
        assert_eq!(config.harness_timeout, Duration::from_secs(12));
    }

    #[test]
    fn captures_exit_code_and_both_streams() {
        let mut executor = script_executor("controller_wrong_passcode.sh", Duration::from_secs(5));
        let run = executor.execute(Passcode::new(20202021));
        let ToolRun::Exited(output) = run else {
            panic!("Expected Exited, got {run:?}");
        };
        assert_eq!(output.exit_code, Some(1));
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            stdout.contains("args: 5 20202021 3840 --timeout 7"),
            "unexpected stdout: {stdout}"
        );
        assert!(String::from_utf8_lossy(&output.stderr).contains("CHIP Error 0x000000AC"));
        assert!(output.combined_text().contains("args:"));
        assert!(output.combined_text().contains("CHIP Error 0x000000AC"));
    }

    #[test]
    fn zero_exit_is_reported_as_exited_success() {
        let mut executor = script_executor("controller_success_on.sh", Duration::from_secs(5));
        let run = executor.execute(Passcode::new(20202021));
        assert_eq!(run.output().and_then(|o| o.exit_code), Some(0));

        let run = executor.execute(Passcode::new(20202022));
        assert_eq!(run.output().and_then(|o| o.exit_code), Some(1));
    }

    #[test]
    fn hung_controller_is_killed_at_the_harness_deadline() {
        let mut executor = script_executor("controller_hang.sh", Duration::from_millis(300));
        let started = Instant::now();
        let run = executor.execute(Passcode::new(1));
        assert!(matches!(run, ToolRun::TimedOut(_)), "got {run:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        let output = run.output().unwrap();
        assert!(String::from_utf8_lossy(&output.stdout).contains("discovering"));
    }

    #[test]
    fn forked_helper_cannot_hold_the_attempt_past_the_deadline() {
        let mut executor =
            script_executor("controller_leaves_helper.sh", Duration::from_secs(2));
        let started = Instant::now();
        let run = executor.execute(Passcode::new(20202020));
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "attempt took {:?}",
            started.elapsed()
        );
        let ToolRun::Exited(output) = run else {
            panic!("Expected Exited, got {run:?}");
        };
        assert_eq!(output.exit_code, Some(1));
        assert!(String::from_utf8_lossy(&output.stderr).contains("CHIP Error 0x000000AC"));
    }

    #[test]
    fn missing_controller_is_reported_as_missing() {
        let mut executor = CommandExecutor::new(CommandExecutorConfig {
            command: vec!["./this_controller_does_not_exist_ever_12345".to_string()],
            node_id: 5,
            discriminator: 3840,
            tool_timeout_secs: 1,
            harness_timeout: Duration::from_secs(1),
            working_dir: None,
        });
        match executor.execute(Passcode::new(1)) {
            ToolRun::Missing { program } => {
                assert_eq!(program, "./this_controller_does_not_exist_ever_12345")
            }
            other => panic!("Expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn empty_command_is_a_launch_failure() {
        let mut executor = CommandExecutor::new(CommandExecutorConfig {
            command: vec![],
            node_id: 5,
            discriminator: 3840,
            tool_timeout_secs: 1,
            harness_timeout: Duration::from_secs(1),
            working_dir: None,
        });
        assert!(matches!(
            executor.execute(Passcode::new(1)),
            ToolRun::LaunchFailed(_)
        ));
    }

    #[test]
    fn describe_exit_prefers_code_over_signal() {
        let by_code = ProcessOutput {
            exit_code: Some(2),
            ..ProcessOutput::default()
        };
        let by_signal = ProcessOutput {
            signal: Some(9),
            ..ProcessOutput::default()
        };
        assert_eq!(by_code.describe_exit(), "exit code 2");
        assert_eq!(by_signal.describe_exit(), "terminated by signal 9");
        assert_eq!(ProcessOutput::default().describe_exit(), "no exit status");
    }
}
