use crate::config::DeviceSettings;
use crate::process::{GroupSignal, group_exists, isolate_group, pgid_of, signal_group, wait_with_timeout};
use nix::sys::signal::Signal;
use std::io::{self, BufRead, BufReader, ErrorKind, PipeReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors surfaced by [`Device::start`]. Every one of them aborts the campaign.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device command is empty")]
    EmptyCommand,
    #[error("device executable not found: {program}")]
    NotFound { program: String },
    #[error("failed to launch device {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("device exited immediately after starting ({status})")]
    ExitedEarly { status: String },
    #[error("could not check on the freshly started device: {0}")]
    Probe(#[source] io::Error),
}

/// Lifecycle of the single device process a session owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Absent,
    Starting,
    Running,
    Stopping,
}

/// The device under test, as seen by the cycle controller.
pub trait Device {
    /// Brings up a fresh device with clean persisted state, replacing any
    /// instance that is still around.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Tears the device down. Best effort, never fails, safe to repeat.
    fn stop(&mut self);
}

#[derive(Debug, Clone)]
pub struct DeviceSessionConfig {
    pub command: Vec<String>,
    /// Persisted commissioning state, deleted before every start.
    pub state_file: Option<PathBuf>,
    pub settle: Duration,
    pub reader_join: Duration,
    pub stop_grace: Duration,
    pub kill_wait: Duration,
    pub working_dir: Option<PathBuf>,
}

impl DeviceSessionConfig {
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        Self {
            command: settings.command.clone(),
            state_file: settings.state_file.clone(),
            settle: settings.settle(),
            reader_join: settings.reader_join(),
            stop_grace: settings.stop_grace(),
            kill_wait: settings.kill_wait(),
            working_dir: settings.working_dir.clone(),
        }
    }
}

/// Background echo of the device's combined stdout/stderr.
///
/// Keeps the pipe drained so the device never blocks on a full buffer. It only
/// looks at the stop flag between lines, so a quiet device can keep it parked in
/// a read until the process goes away.
struct OutputDrain {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl OutputDrain {
    fn spawn(reader: PipeReader) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("device-output".to_string())
            .spawn(move || {
                for line in BufReader::new(reader).split(b'\n') {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match line {
                        Ok(bytes) => {
                            let text = String::from_utf8_lossy(&bytes);
                            info!(target: "device", "{}", text.trim_end());
                        }
                        Err(e) => {
                            if !flag.load(Ordering::SeqCst) {
                                error!("device output drain failed: {e}");
                            }
                            break;
                        }
                    }
                }
                debug!("device output drain finished");
            })?;
        Ok(Self { stop, handle })
    }

    /// Signals the drain and waits up to `within` for it. Returns whether it exited.
    fn shutdown(self, within: Duration) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + within;
        while !self.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if self.handle.is_finished() {
            let _ = self.handle.join();
            true
        } else {
            // Detached; it ends by itself once the device's pipe closes.
            false
        }
    }
}

/// Owns the one live device process, its process group and its output drain.
pub struct DeviceSession {
    config: DeviceSessionConfig,
    state: DeviceState,
    child: Option<Child>,
    pgid: Option<i32>,
    drain: Option<OutputDrain>,
}

impl DeviceSession {
    pub fn new(config: DeviceSessionConfig) -> Self {
        Self {
            config,
            state: DeviceState::Absent,
            child: None,
            pgid: None,
            drain: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Process group of the live device, if any.
    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    fn clear_persisted_state(&self) {
        let Some(path) = &self.config.state_file else {
            return;
        };
        match std::fs::remove_file(path) {
            Ok(()) => info!("removed device state file {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!("failed to remove device state file {}: {e}", path.display()),
        }
    }

    fn spawn_child(&self, program: &str, args: &[String]) -> Result<(Child, PipeReader), DeviceError> {
        let spawn_error = |source: io::Error| DeviceError::Spawn {
            program: program.to_string(),
            source,
        };
        let (reader, writer) = io::pipe().map_err(spawn_error)?;
        let stderr_writer = writer.try_clone().map_err(spawn_error)?;

        // `cmd` holds the write ends; it must drop before the drain can see EOF.
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        isolate_group(&mut cmd);

        match cmd.spawn() {
            Ok(child) => Ok((child, reader)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DeviceError::NotFound {
                program: program.to_string(),
            }),
            Err(e) => Err(spawn_error(e)),
        }
    }

    fn launch(&mut self) -> Result<(), DeviceError> {
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(DeviceError::EmptyCommand);
        };
        info!(command = ?self.config.command, "starting device");
        let (child, reader) = self.spawn_child(program, args)?;
        let pgid = pgid_of(&child);
        self.child = Some(child);
        self.pgid = Some(pgid);

        match OutputDrain::spawn(reader) {
            Ok(drain) => self.drain = Some(drain),
            Err(e) => {
                return Err(DeviceError::Spawn {
                    program: program.to_string(),
                    source: e,
                });
            }
        }

        debug!(settle = ?self.config.settle, "waiting for device to initialize");
        std::thread::sleep(self.config.settle);

        let Some(child) = self.child.as_mut() else {
            return Err(DeviceError::Probe(io::Error::other("device handle vanished")));
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(DeviceError::ExitedEarly {
                status: status.to_string(),
            }),
            Err(e) => Err(DeviceError::Probe(e)),
        }
    }

    fn terminate(&self, child: &mut Child, pgid: i32) {
        match child.try_wait() {
            Ok(Some(status)) => debug!("device had already exited ({status})"),
            Ok(None) | Err(_) => {
                info!(pgid, "stopping device process group");
                match signal_group(pgid, Signal::SIGTERM) {
                    Ok(GroupSignal::Gone) => info!("device process already gone"),
                    Ok(GroupSignal::Delivered) => {
                        match wait_with_timeout(child, self.config.stop_grace) {
                            Ok(Some(_)) => info!("device process stopped"),
                            Ok(None) => {
                                warn!("device did not terminate gracefully, sending SIGKILL");
                                self.kill(child, pgid);
                            }
                            Err(e) => {
                                error!("error waiting for device to stop: {e}");
                                self.kill(child, pgid);
                            }
                        }
                    }
                    Err(e) => {
                        error!("error signalling device process group {pgid}: {e}");
                        self.kill(child, pgid);
                    }
                }
            }
        }

        if group_exists(pgid) {
            debug!(pgid, "sweeping leftover members of the device process group");
            if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
                error!("failed to sweep device process group {pgid}: {e}");
            }
        }
    }

    fn kill(&self, child: &mut Child, pgid: i32) {
        match signal_group(pgid, Signal::SIGKILL) {
            Ok(GroupSignal::Gone) => return,
            Ok(GroupSignal::Delivered) => {}
            Err(e) => {
                error!("failed to kill device process group {pgid}: {e}");
                return;
            }
        }
        match wait_with_timeout(child, self.config.kill_wait) {
            Ok(Some(_)) => info!("device process killed"),
            Ok(None) => error!("device process survived SIGKILL for {:?}", self.config.kill_wait),
            Err(e) => error!("error reaping killed device: {e}"),
        }
    }
}

impl Device for DeviceSession {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.stop();
        self.state = DeviceState::Starting;
        self.clear_persisted_state();

        match self.launch() {
            Ok(()) => {
                self.state = DeviceState::Running;
                info!(pgid = ?self.pgid, "device assumed ready");
                Ok(())
            }
            Err(e) => {
                error!("device failed to start: {e}");
                self.stop();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        if self.state == DeviceState::Absent && self.child.is_none() && self.drain.is_none() {
            return;
        }
        self.state = DeviceState::Stopping;

        if let Some(drain) = self.drain.take() {
            debug!("signalling device output drain to stop");
            if !drain.shutdown(self.config.reader_join) {
                warn!(
                    "device output drain did not stop within {:?}, leaving it behind",
                    self.config.reader_join
                );
            }
        }

        let pgid = self.pgid.take();
        if let Some(mut child) = self.child.take() {
            if let Some(pgid) = pgid {
                self.terminate(&mut child, pgid);
            }
        }
        self.state = DeviceState::Absent;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop();
    }
}
