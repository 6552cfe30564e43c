// Detection model hosted in a child process
//
// Protocol, one exchange per frame:
//   -> {"width":W,"height":H,"format":"rgb24","len":N}\n followed by N raw bytes
//   <- one JSON line: an array of detections, or {"error":"..."}
//
// The child is spawned lazily and respawned on the frame after it dies or
// fails to answer in time. Pipe I/O runs on helper threads so a hung child
// can only delay the caller by the reply timeout.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use super::{Detection, DetectionError, DetectionModel};
use crate::video::Frame;

/// How long a reply may take before the child is considered hung
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct FrameHeader<'a> {
    width: u32,
    height: u32,
    format: &'a str,
    len: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Reply {
    Detections(Vec<Detection>),
    Error { error: String },
}

/// Header line plus pixel bytes for the writer thread
type Request = (Vec<u8>, Arc<[u8]>);

struct Running {
    child: Child,
    requests: Sender<Request>,
    replies: Receiver<std::io::Result<String>>,
}

/// Detection model that talks to an external inference process over stdio
pub struct ExternalProcessModel {
    program: String,
    args: Vec<String>,
    reply_timeout: Duration,
    running: Option<Running>,
}

impl ExternalProcessModel {
    /// `command` is the program followed by its arguments
    pub fn new(command: &[String]) -> Result<Self, DetectionError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| DetectionError::Process("Detector command is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            running: None,
        })
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    fn spawn(&self) -> Result<Running, DetectionError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| DetectionError::Process(format!("Failed to spawn {}: {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DetectionError::Process("Detector stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DetectionError::Process("Detector stdout unavailable".into()))?;

        let pid = child.id();
        let (requests, request_rx) = crossbeam_channel::bounded::<Request>(1);
        let (reply_tx, replies) = crossbeam_channel::bounded(1);

        // Both threads end once the child is killed or the model drops its channels
        let spawned = std::thread::Builder::new()
            .name(format!("vigil-detector-in-{}", pid))
            .spawn(move || {
                for (header, data) in request_rx {
                    let written = stdin
                        .write_all(&header)
                        .and_then(|_| stdin.write_all(&data))
                        .and_then(|_| stdin.flush());
                    if let Err(e) = written {
                        log::debug!("Detector {} stopped reading input: {}", pid, e);
                        break;
                    }
                }
            })
            .and_then(|_| {
                std::thread::Builder::new()
                    .name(format!("vigil-detector-out-{}", pid))
                    .spawn(move || {
                        let mut stdout = BufReader::new(stdout);
                        loop {
                            let mut line = String::new();
                            let reply = match stdout.read_line(&mut line) {
                                Ok(0) => break,
                                Ok(_) => Ok(line),
                                Err(e) => Err(e),
                            };
                            let failed = reply.is_err();
                            if reply_tx.send(reply).is_err() || failed {
                                break;
                            }
                        }
                    })
            });

        let mut running = Running {
            child,
            requests,
            replies,
        };
        if let Err(e) = spawned {
            stop_child(&mut running.child);
            return Err(DetectionError::Process(format!("Failed to start detector I/O threads: {}", e)));
        }

        log::info!("Detector process started: {} (pid {})", self.program, pid);
        Ok(running)
    }

    fn exchange(&self, running: &Running, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        let header = FrameHeader {
            width: frame.width,
            height: frame.height,
            format: "rgb24",
            len: frame.data.len(),
        };
        let mut header = serde_json::to_vec(&header)?;
        header.push(b'\n');

        running
            .requests
            .send_timeout((header, frame.data.clone()), self.reply_timeout)
            .map_err(|_| DetectionError::Process("Detector is not accepting frames".into()))?;

        let line = match running.replies.recv_timeout(self.reply_timeout) {
            Ok(reply) => reply?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(DetectionError::Process(format!(
                    "Detector did not answer within {} ms",
                    self.reply_timeout.as_millis()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DetectionError::Process("Detector closed its output".into()))
            }
        };

        match serde_json::from_str::<Reply>(line.trim())? {
            Reply::Detections(detections) => Ok(detections),
            Reply::Error { error } => Err(DetectionError::Inference(error)),
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut running) = self.running.take() {
            stop_child(&mut running.child);
        }
    }
}

fn stop_child(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = child.kill() {
        log::debug!("Detector {} could not be killed: {}", pid, e);
    }
    match child.wait() {
        Ok(status) => log::debug!("Detector {} exited: {}", pid, status),
        Err(e) => log::warn!("Failed to reap detector {}: {}", pid, e),
    }
}

impl DetectionModel for ExternalProcessModel {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        if self.running.is_none() {
            self.running = Some(self.spawn()?);
        }
        let Some(running) = self.running.as_ref() else {
            return Err(DetectionError::Process("Detector not running".into()));
        };

        match self.exchange(running, frame) {
            Ok(detections) => Ok(detections),
            // Inference errors are reported by a healthy process; keep it
            Err(e @ DetectionError::Inference(_)) => Err(e),
            Err(e) => {
                log::warn!("Detector process failed, restarting on next frame: {}", e);
                self.shutdown();
                Err(e)
            }
        }
    }
}

impl Drop for ExternalProcessModel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
