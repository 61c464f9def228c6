use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, mpsc};

use crate::pipeline::Stage;
use crate::targets::Target;

#[derive(Debug, Clone)]
pub enum PackEvent {
    SourceFingerprinted {
        digest: String,
        record: PathBuf,
    },
    TargetStarted {
        target: Target,
    },
    StageStarted {
        target: Target,
        stage: Stage,
    },
    StageLog {
        target: Target,
        stage: Stage,
        line: String,
    },
    StageFinished {
        target: Target,
        stage: Stage,
        ok: bool,
        elapsed_ms: u128,
    },
    TargetFinished {
        target: Target,
        ok: bool,
        error: Option<String>,
        error_log: Option<PathBuf>,
        elapsed_ms: u128,
    },
    Done {
        ok: bool,
        succeeded: usize,
        failed: usize,
    },
}

pub trait PackSink: Send + Sync {
    fn emit(&self, ev: PackEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PackSink for NullSink {
    fn emit(&self, _ev: PackEvent) {}
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PackEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<PackEvent>) -> Self {
        Self { tx }
    }
}

impl PackSink for ChannelSink {
    fn emit(&self, ev: PackEvent) {
        let _ = self.tx.send(ev);
    }
}

const MAX_BUFFERED_LINES: usize = 4000;

/// Line-oriented progress on stdout. Keeps the tool output of each running
/// target so a failure can be written out as `error.log` next to its working
/// files.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    logs: BTreeMap<Target, VecDeque<String>>,
    failed: Vec<Target>,
}

impl PackSink for StdoutSink {
    fn emit(&self, ev: PackEvent) {
        match ev {
            PackEvent::SourceFingerprinted { digest, record } => {
                println!("SOURCE: {digest} => {}", record.display());
            }
            PackEvent::TargetStarted { target } => {
                if let Ok(mut s) = self.state.lock() {
                    s.logs.insert(target, VecDeque::new());
                }
                println!("TARGET: {target}");
            }
            PackEvent::StageStarted { target, stage } => {
                println!("RUN: {target}.{stage} ({})", stage.label());
            }
            PackEvent::StageLog {
                target,
                stage,
                line,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    let q = s.logs.entry(target).or_default();
                    while q.len() >= MAX_BUFFERED_LINES {
                        q.pop_front();
                    }
                    q.push_back(format!("[{stage}] {line}"));
                }
                println!("[{target}.{stage}] {line}");
            }
            PackEvent::StageFinished {
                target,
                stage,
                ok,
                elapsed_ms,
            } => {
                if ok {
                    println!("DONE: {target}.{stage} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {target}.{stage} ({elapsed_ms}ms)");
                }
            }
            PackEvent::TargetFinished {
                target,
                ok,
                error,
                error_log,
                elapsed_ms,
            } => {
                let lines = self
                    .state
                    .lock()
                    .ok()
                    .and_then(|mut s| {
                        if !ok {
                            s.failed.push(target);
                        }
                        s.logs.remove(&target)
                    })
                    .unwrap_or_default();
                if ok {
                    println!("TARGET DONE: {target} ({elapsed_ms}ms)");
                    return;
                }
                let error = error.unwrap_or_default();
                println!("TARGET FAIL: {target} ({elapsed_ms}ms) {error}");
                if let Some(path) = error_log {
                    match write_error_log(&path, target, &error, elapsed_ms, &lines) {
                        Ok(()) => println!("ERROR_LOG: {target} => {}", path.display()),
                        Err(e) => println!("WARN: failed to write error log for {target}: {e}"),
                    }
                }
            }
            PackEvent::Done {
                ok,
                succeeded,
                failed,
            } => {
                let failed_targets = self
                    .state
                    .lock()
                    .ok()
                    .map(|mut s| std::mem::take(&mut s.failed))
                    .unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!("  targets: ok={succeeded} failed={failed}");
                if !failed_targets.is_empty() {
                    let names: Vec<&str> = failed_targets.iter().map(|t| t.label()).collect();
                    println!("  failed_targets: {}", names.join(", "));
                }
            }
        }
    }
}

fn write_error_log(
    path: &Path,
    target: Target,
    error: &str,
    elapsed_ms: u128,
    lines: &VecDeque<String>,
) -> std::io::Result<()> {
    let mut body = String::new();
    body.push_str(&format!("target: {target}\n"));
    body.push_str("status: failed\n");
    body.push_str(&format!("elapsed_ms: {elapsed_ms}\n"));
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, body)
}
