//! FFmpeg-backed transcoder
//!
//! Each started camera gets one `ffmpeg` child that pulls the RTSP source over
//! TCP, re-encodes to browser friendly H.264 baseline and publishes to the
//! relay over RTSP. A per-process task owns the child: it reports exits on the
//! liveness watch and performs the graceful stop.
//!
//! Progress comes from `-progress pipe:1` on stdout (one `progress=` line per
//! stats period); stderr only carries warnings and errors.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, OnceCell};
use tracing::{debug, info, warn};

use super::{Liveness, TranscodeHandle, TranscodeRequest, Transcoder};
use crate::config::TranscodeConfig;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// H.264 encoders in order of preference
const ENCODER_PREFERENCE: &[&str] = &["h264_nvenc", "h264_qsv", "h264_videotoolbox", "libx264"];

const SOFTWARE_ENCODER: &str = "libx264";

/// Recent stderr lines kept per process for start error messages
const STDERR_TAIL_SIZE: usize = 20;

/// Stderr fragments worth surfacing as warnings
const ERROR_KEYWORDS: &[&str] = &["error", "fail", "cannot", "refused", "invalid", "unable"];

type StopReply = oneshot::Sender<Result<()>>;

struct RunningProcess {
    camera_id: String,
    pid: Option<u32>,
    stop_tx: oneshot::Sender<(Duration, StopReply)>,
}

/// Spawns and supervises `ffmpeg` processes
pub struct FfmpegTranscoder {
    config: RwLock<TranscodeConfig>,
    /// Auto-detected encoder (probed once)
    detected_encoder: OnceCell<String>,
    processes: Mutex<HashMap<String, RunningProcess>>,
    throttler: Arc<LogThrottler>,
}

impl FfmpegTranscoder {
    pub fn new(config: TranscodeConfig) -> Self {
        Self {
            config: RwLock::new(config),
            detected_encoder: OnceCell::new(),
            processes: Mutex::new(HashMap::new()),
            throttler: Arc::new(LogThrottler::with_secs(10)),
        }
    }

    /// Replace the settings used for processes started from now on
    pub fn set_config(&self, config: TranscodeConfig) {
        *self.config.write() = config;
    }

    /// Number of processes currently owned
    pub fn running(&self) -> usize {
        self.processes.lock().len()
    }

    /// Encoder that will be used for new processes
    pub async fn encoder(&self) -> String {
        let (configured, ffmpeg_path) = {
            let config = self.config.read();
            (config.encoder.clone(), config.ffmpeg_path.clone())
        };
        if configured != "auto" && !configured.is_empty() {
            return configured;
        }
        self.detected_encoder
            .get_or_init(|| detect_encoder(ffmpeg_path))
            .await
            .clone()
    }

    fn spawn_monitors(
        &self,
        child: &mut Child,
        camera_id: &str,
        stall_timeout: Duration,
        liveness_tx: Arc<watch::Sender<Liveness>>,
        stderr_tail: Arc<Mutex<VecDeque<String>>>,
    ) {
        if let Some(stdout) = child.stdout.take() {
            let camera_id = camera_id.to_string();
            let liveness_tx = liveness_tx.clone();
            tokio::spawn(async move {
                monitor_progress(camera_id, stdout, stall_timeout, liveness_tx).await;
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let camera_id = camera_id.to_string();
            let throttler = self.throttler.clone();
            tokio::spawn(async move {
                monitor_stderr(camera_id, stderr, stderr_tail, throttler).await;
            });
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(&self, request: &TranscodeRequest) -> Result<TranscodeHandle> {
        let encoder = self.encoder().await;
        let config = self.config.read().clone();
        let args = build_args(request, &encoder);

        info!(
            camera_id = %request.camera_id,
            encoder = %encoder,
            output = %request.output_url,
            "Starting ffmpeg"
        );

        let mut child = Command::new(&config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::UpstreamStartFailed {
                camera_id: request.camera_id.clone(),
                reason: format!("failed to spawn {}: {}", config.ffmpeg_path, e),
            })?;

        let pid = child.id();
        let (liveness_tx, mut liveness_rx) = watch::channel(Liveness::Running);
        let liveness_tx = Arc::new(liveness_tx);
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_SIZE)));

        self.spawn_monitors(
            &mut child,
            &request.camera_id,
            Duration::from_secs(config.stall_timeout_secs.max(1)),
            liveness_tx.clone(),
            stderr_tail.clone(),
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(own_process(
            request.camera_id.clone(),
            child,
            liveness_tx,
            stop_rx,
        ));

        // Startup probe: the process must survive the probe window
        let probe = Duration::from_millis(config.startup_probe_ms);
        let exited = tokio::time::timeout(
            probe,
            liveness_rx.wait_for(|l| matches!(l, Liveness::Exited(_))),
        )
        .await
        .map(|result| match result.as_deref() {
            Ok(Liveness::Exited(code)) => *code,
            _ => None,
        });
        if let Ok(code) = exited {
            let tail = stderr_tail.lock().iter().cloned().collect::<Vec<_>>();
            return Err(AppError::UpstreamStartFailed {
                camera_id: request.camera_id.clone(),
                reason: format!(
                    "ffmpeg exited during startup (code {:?}){}",
                    code,
                    tail.last().map(|l| format!(": {}", l)).unwrap_or_default()
                ),
            });
        }

        let handle = TranscodeHandle::new(
            request.camera_id.clone(),
            format!("ffmpeg pid {} ({})", pid.unwrap_or_default(), encoder),
            liveness_rx,
        );
        self.processes.lock().insert(
            handle.id().to_string(),
            RunningProcess {
                camera_id: request.camera_id.clone(),
                pid,
                stop_tx,
            },
        );
        self.throttler.clear_prefix(&format!("{}:", request.camera_id));

        info!(camera_id = %request.camera_id, pid = ?pid, "ffmpeg started");
        Ok(handle)
    }

    async fn stop(&self, handle: TranscodeHandle) -> Result<()> {
        let Some(process) = self.processes.lock().remove(handle.id()) else {
            debug!(camera_id = %handle.camera_id(), "ffmpeg handle already released");
            return Ok(());
        };
        let grace = Duration::from_millis(self.config.read().stop_grace_ms);

        info!(camera_id = %process.camera_id, pid = ?process.pid, "Stopping ffmpeg");

        let (reply_tx, reply_rx) = oneshot::channel();
        if process.stop_tx.send((grace, reply_tx)).is_err() {
            // Owner task finished: the process already exited
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }
}

/// Owns the child until it exits or is asked to stop
async fn own_process(
    camera_id: String,
    mut child: Child,
    liveness_tx: Arc<watch::Sender<Liveness>>,
    stop_rx: oneshot::Receiver<(Duration, StopReply)>,
) {
    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            warn!(camera_id = %camera_id, code = ?code, "ffmpeg exited");
            liveness_tx.send_replace(Liveness::Exited(code));
        }
        request = stop_rx => {
            let Ok((grace, reply)) = request else {
                // Transcoder dropped: kill_on_drop takes care of the child
                return;
            };
            let result = graceful_stop(&camera_id, &mut child, grace).await;
            let code = child.try_wait().ok().flatten().and_then(|s| s.code());
            liveness_tx.send_replace(Liveness::Exited(code));
            let _ = reply.send(result);
        }
    }
}

/// `q` on stdin, wait `grace`, then kill
async fn graceful_stop(camera_id: &str, child: &mut Child, grace: Duration) -> Result<()> {
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(b"q").await {
            debug!(camera_id = %camera_id, "Failed to send quit to ffmpeg: {}", e);
        }
        let _ = stdin.flush().await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(camera_id = %camera_id, status = %status, "ffmpeg quit");
            Ok(())
        }
        Ok(Err(e)) => Err(AppError::Io(e)),
        Err(_) => {
            warn!(camera_id = %camera_id, "ffmpeg ignored quit, killing");
            child.kill().await.map_err(AppError::Io)
        }
    }
}

/// Watch `-progress` output and flag stalls
async fn monitor_progress<R: tokio::io::AsyncRead + Unpin>(
    camera_id: String,
    reader: R,
    stall_timeout: Duration,
    liveness_tx: Arc<watch::Sender<Liveness>>,
) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        match tokio::time::timeout(stall_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if !line.starts_with("progress=") {
                    continue;
                }
                liveness_tx.send_if_modified(|current| {
                    if matches!(current, Liveness::Stalled(_)) {
                        info!(camera_id = %camera_id, "ffmpeg output resumed");
                        *current = Liveness::Running;
                        true
                    } else {
                        false
                    }
                });
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                warn!(camera_id = %camera_id, "Error reading ffmpeg progress: {}", e);
                break;
            }
            Err(_) => {
                liveness_tx.send_if_modified(|current| {
                    if *current == Liveness::Running {
                        *current = Liveness::Stalled(format!(
                            "no output for {}s",
                            stall_timeout.as_secs()
                        ));
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }
}

/// Log stderr; keep a short tail for error reports
async fn monitor_stderr<R: tokio::io::AsyncRead + Unpin>(
    camera_id: String,
    reader: R,
    tail: Arc<Mutex<VecDeque<String>>>,
    throttler: Arc<LogThrottler>,
) {
    let mut lines = BufReader::new(reader).lines();
    let key = format!("{}:stderr", camera_id);

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        {
            let mut tail = tail.lock();
            if tail.len() >= STDERR_TAIL_SIZE {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }

        let lower = line.to_lowercase();
        if ERROR_KEYWORDS.iter().any(|k| lower.contains(k)) {
            warn_throttled!(throttler, &key, "[ffmpeg {}] {}", camera_id, line);
        } else {
            debug!("[ffmpeg {}] {}", camera_id, line);
        }
    }
}

/// Pick the first available encoder from `ffmpeg -encoders`
async fn detect_encoder(ffmpeg_path: String) -> String {
    let output = Command::new(&ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .await;

    let listing = match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
        Err(e) => {
            warn!("Failed to probe ffmpeg encoders: {}, using {}", e, SOFTWARE_ENCODER);
            return SOFTWARE_ENCODER.to_string();
        }
    };

    let encoder = pick_encoder(&listing);
    info!("Selected H.264 encoder: {}", encoder);
    encoder.to_string()
}

fn pick_encoder(listing: &str) -> &'static str {
    ENCODER_PREFERENCE
        .iter()
        .find(|name| {
            listing
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(**name))
        })
        .copied()
        .unwrap_or(SOFTWARE_ENCODER)
}

/// Double a bitrate such as "2M" or "800k" for the VBV buffer size
fn double_bitrate(bitrate: &str) -> String {
    let split = bitrate
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(bitrate.len());
    let (digits, unit) = bitrate.split_at(split);
    match digits.parse::<u64>() {
        Ok(value) => format!("{}{}", value * 2, unit),
        Err(_) => bitrate.to_string(),
    }
}

/// Full ffmpeg argument list for one camera
pub fn build_args(request: &TranscodeRequest, encoder: &str) -> Vec<String> {
    let fps = request.fps.max(1);
    let gop = fps * 2;
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-nostats",
        "-progress",
        "pipe:1",
        "-rtsp_transport",
        "tcp",
        "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(request.source_url.clone());

    args.extend(["-c:v".to_string(), encoder.to_string()]);
    match encoder {
        SOFTWARE_ENCODER => args.extend(["-preset".to_string(), "ultrafast".to_string()]),
        "h264_videotoolbox" => {}
        _ => args.extend(["-preset".to_string(), "fast".to_string()]),
    }
    args.extend([
        "-b:v".to_string(),
        request.bitrate.clone(),
        "-maxrate".to_string(),
        request.bitrate.clone(),
        "-bufsize".to_string(),
        double_bitrate(&request.bitrate),
        "-r".to_string(),
        fps.to_string(),
        "-g".to_string(),
        gop.to_string(),
        "-sc_threshold".to_string(),
        "0".to_string(),
    ]);

    if let Some(resolution) = &request.resolution {
        args.extend(["-s".to_string(), resolution.clone()]);
    }

    match encoder {
        "h264_nvenc" => {
            for arg in [
                "-profile:v", "baseline", "-level", "3.1", "-rc", "cbr", "-zerolatency", "1",
                "-delay", "0", "-forced-idr", "1",
            ] {
                args.push(arg.to_string());
            }
        }
        SOFTWARE_ENCODER => {
            for arg in ["-tune", "zerolatency", "-profile:v", "baseline", "-level", "3.1"] {
                args.push(arg.to_string());
            }
            args.extend([
                "-x264opts".to_string(),
                format!("keyint={}:min-keyint={}:no-scenecut", gop, fps),
            ]);
        }
        _ => {}
    }

    for arg in [
        "-bsf:v", "dump_extra", "-c:a", "aac", "-b:a", "128k", "-ar", "48000", "-f", "rtsp",
        "-rtsp_transport", "tcp",
    ] {
        args.push(arg.to_string());
    }
    args.push(request.output_url.clone());
    args
}
