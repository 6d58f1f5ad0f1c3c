//! Transcoder Subprocess Management
//!
//! One external transcoder per streaming session. The relay writes the
//! publisher's bytes to the child's stdin; the child publishes to the
//! destination on its own, so its stdout is discarded. A monitor task owns
//! the `Child`, reports its exit once, and escalates EOF -> SIGTERM -> SIGKILL
//! when asked to stop.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::error::RelayError;

/// Placeholder replaced with the destination URL in the argument template
pub const DESTINATION_PLACEHOLDER: &str = "{destination}";

/// Extra time `stop` waits beyond the grace periods for the kill to land
const KILL_SLACK: Duration = Duration::from_secs(2);

/// Encoding envelope applied to every stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingProfile {
    pub input_format: String,
    pub frame_rate: u32,
    pub gop_size: u32,
    pub video_bitrate: String,
    pub video_maxrate: String,
    pub video_bufsize: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        EncodingProfile {
            input_format: "webm".to_string(),
            frame_rate: 30,
            gop_size: 60,
            video_bitrate: "1200k".to_string(),
            video_maxrate: "1500k".to_string(),
            video_bufsize: "3000k".to_string(),
            audio_bitrate: "96k".to_string(),
            audio_sample_rate: 44100,
        }
    }
}

impl EncodingProfile {
    /// ffmpeg argument template: read the container from stdin, publish FLV
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-f",
            self.input_format.as_str(),
            "-i",
            "pipe:0",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-pix_fmt",
            "yuv420p",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.extend([
            "-r".to_string(),
            self.frame_rate.to_string(),
            "-g".to_string(),
            self.gop_size.to_string(),
            "-b:v".to_string(),
            self.video_bitrate.clone(),
            "-maxrate".to_string(),
            self.video_maxrate.clone(),
            "-bufsize".to_string(),
            self.video_bufsize.clone(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            self.audio_bitrate.clone(),
            "-ar".to_string(),
            self.audio_sample_rate.to_string(),
            "-f".to_string(),
            "flv".to_string(),
            DESTINATION_PLACEHOLDER.to_string(),
        ]);
        args
    }
}

/// How to launch and stop the transcoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeSettings {
    pub program: String,
    /// Argument template; `{destination}` is substituted per session
    pub args: Vec<String>,
    /// Time allowed at each stop step (after EOF, after SIGTERM) before escalating
    pub stop_grace: Duration,
    /// Upper bound for a single write to the child's stdin
    pub write_timeout: Duration,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        TranscodeSettings {
            program: "ffmpeg".to_string(),
            args: EncodingProfile::default().ffmpeg_args(),
            stop_grace: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl TranscodeSettings {
    pub fn command_args(&self, destination: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(DESTINATION_PLACEHOLDER, destination))
            .collect()
    }
}

/// Check that the transcoder can be executed at all (`<program> -version`).
pub async fn probe(program: &str) -> Result<String, RelayError> {
    let output = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| RelayError::SpawnFailed {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(RelayError::SpawnFailed {
            program: program.to_string(),
            reason: format!("-version exited with {}", output.status),
        });
    }
    let banner = String::from_utf8_lossy(&output.stdout);
    Ok(banner.lines().next().unwrap_or_default().to_string())
}

/// How a transcoder process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// None if the status could not be collected
    pub status: Option<ExitStatus>,
    /// Whether the relay asked the process to stop
    pub requested: bool,
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{}", status),
            None => write!(f, "exit status unavailable"),
        }
    }
}

/// Cloneable view of a running process used to force it down from elsewhere
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<Notify>,
    stop_requested: Arc<AtomicBool>,
    input_closed: Arc<AtomicBool>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl StopHandle {
    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Ask the monitor to terminate the process. Does not wait.
    pub fn force_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }
}

/// Handle to one running transcoder
pub struct TranscodeProcess {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    control: StopHandle,
    monitor: Option<JoinHandle<()>>,
    write_timeout: Duration,
    stop_grace: Duration,
    stopped: bool,
}

impl TranscodeProcess {
    /// Spawn the transcoder for `destination` and feed it `initial` bytes.
    pub async fn start(
        settings: &TranscodeSettings,
        destination: &str,
        initial: &[u8],
    ) -> Result<Self, RelayError> {
        let spawn_failed = |reason: String| RelayError::SpawnFailed {
            program: settings.program.clone(),
            reason,
        };

        let mut child = Command::new(&settings.program)
            .args(settings.command_args(destination))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("stdin was not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[transcoder {}] {}", pid.unwrap_or_default(), line);
                }
            });
        }

        let stop = Arc::new(Notify::new());
        let stop_requested = Arc::new(AtomicBool::new(false));
        let input_closed = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);
        let control = StopHandle {
            stop,
            stop_requested,
            input_closed,
            exit: exit_rx,
        };
        let monitor = tokio::spawn(supervise(child, control.clone(), exit_tx, settings.stop_grace));

        log::info!(
            "Transcoder {} started (pid {:?}), {} initial bytes",
            settings.program,
            pid,
            initial.len()
        );

        let mut process = TranscodeProcess {
            pid,
            stdin: Some(stdin),
            control,
            monitor: Some(monitor),
            write_timeout: settings.write_timeout,
            stop_grace: settings.stop_grace,
            stopped: false,
        };

        if initial.is_empty() {
            return Ok(process);
        }
        if let Err(e) = process.write(initial).await {
            process.stop().await;
            return Err(e);
        }
        Ok(process)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.control.clone()
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Forward bytes to the child's stdin.
    ///
    /// Awaits a full pipe, so a slow transcoder slows this session's reads;
    /// a write stuck longer than the write timeout fails the session.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        if !self.is_running() {
            return Err(RelayError::WriteFailed("transcoder has exited".to_string()));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RelayError::WriteFailed("input already closed".to_string()))?;

        match tokio::time::timeout(self.write_timeout, stdin.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::WriteFailed(e.to_string())),
            Err(_) => Err(RelayError::WriteFailed(format!(
                "input blocked for {:?}",
                self.write_timeout
            ))),
        }
    }

    /// Resolves once the process has exited, for whatever reason.
    ///
    /// The returned future owns its receiver, so it can be raced and dropped freely.
    pub fn exited(&self) -> impl std::future::Future<Output = ProcessExit> + Send + 'static {
        let mut exit = self.control.exit.clone();
        let stop_requested = self.control.stop_requested.clone();
        async move {
            let observed = exit
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|state| state.clone());
            observed.unwrap_or_else(|| ProcessExit {
                status: None,
                requested: stop_requested.load(Ordering::SeqCst),
            })
        }
    }

    /// Close stdin, then terminate; kill if the grace period runs out.
    ///
    /// Returns once the process is gone or the monitor has been given up on.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.control.stop_requested.store(true, Ordering::SeqCst);

        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
            self.control.input_closed.store(true, Ordering::SeqCst);
        }
        self.control.stop.notify_one();

        if let Some(mut monitor) = self.monitor.take() {
            if tokio::time::timeout(self.stop_grace * 2 + KILL_SLACK, &mut monitor)
                .await
                .is_err()
            {
                log::error!("Transcoder monitor for pid {:?} did not finish", self.pid);
                monitor.abort();
            }
        }
    }
}

impl Drop for TranscodeProcess {
    fn drop(&mut self) {
        if !self.stopped {
            self.control.force_stop();
        }
    }
}

async fn supervise(
    mut child: Child,
    control: StopHandle,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    grace: Duration,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = control.stop.notified() => {
            let input_closed = control.input_closed.load(Ordering::SeqCst);
            terminate(&mut child, grace, input_closed).await
        }
    };

    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            log::error!("Failed to collect transcoder {:?} exit status: {}", pid, e);
            None
        }
    };
    let exit = ProcessExit {
        status,
        requested: control.stop_requested.load(Ordering::SeqCst),
    };
    if exit.requested {
        log::info!("Transcoder {:?} stopped: {}", pid, exit);
    } else {
        log::warn!("Transcoder {:?} exited on its own: {}", pid, exit);
    }
    exit_tx.send_replace(Some(exit));
}

async fn terminate(
    child: &mut Child,
    grace: Duration,
    input_closed: bool,
) -> std::io::Result<ExitStatus> {
    // A stdin-fed transcoder finalizes its output on EOF; give it the chance.
    if input_closed {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
    }

    request_termination(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            log::warn!(
                "Transcoder {:?} did not exit within {:?}, killing",
                child.id(),
                grace
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            log::debug!("SIGTERM to transcoder {} failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}
