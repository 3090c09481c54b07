//! `vidconvert-queue [--verbose] <config.json> <queue.json>`
//!
//! Runs the queue and writes one JSON object per line on stdout: every queue
//! event as `{"event": ..., "payload": ...}`, replies to stdin requests as
//! `{"id": ..., "result": ...}` / `{"id": ..., "error": ...}`, and finally the
//! remaining queue as a `queueSnapshot` event. Logs go to stderr.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use vidconvert_core::error::{AppError, ErrorPayload};
use vidconvert_core::job::Job;
use vidconvert_core::queue::{QueueEvent, QueueProcessor};
use vidconvert_core::{AppConfig, logging};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
}

#[derive(Debug, Serialize)]
struct RpcSuccess {
    id: u64,
    result: Value,
}

#[derive(Debug, Serialize)]
struct RpcFailure {
    id: u64,
    error: ErrorPayload,
}

#[derive(Debug, Serialize)]
struct RpcEvent {
    event: &'static str,
    payload: Value,
}

/// A bare array of jobs or `{"jobs": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QueueFile {
    Jobs(Vec<Job>),
    Wrapped { jobs: Vec<Job> },
}

type SharedWriter = Arc<Mutex<io::Stdout>>;

fn write_json_line<T: Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| io::Error::other(format!("serialize output: {}", e)))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn write_json_line_shared<T: Serialize>(writer: &SharedWriter, value: &T) {
    let mut guard = writer.lock();
    if let Err(e) = write_json_line(&mut *guard, value) {
        log::warn!(target: "vidconvert::bin", "Could not write to stdout: {}", e);
    }
}

fn load_queue(path: &Path) -> Result<Vec<Job>, AppError> {
    let text = fs::read_to_string(path)?;
    let parsed: QueueFile = serde_json::from_str(&text)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    Ok(match parsed {
        QueueFile::Jobs(jobs) | QueueFile::Wrapped { jobs } => jobs,
    })
}

fn dispatch(method: &str, queue: &QueueProcessor) -> Result<Value, AppError> {
    match method {
        "queue.stop" => {
            let was_processing = queue.is_processing();
            queue.stop();
            Ok(json!({ "stopped": was_processing }))
        }
        "queue.status" => Ok(json!({ "state": queue.state() })),
        _ => Err(AppError::from(format!("Unknown method: {}", method))),
    }
}

fn handle_request(line: &str, queue: &QueueProcessor, writer: &SharedWriter) {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            let failure = RpcFailure {
                id: 0,
                error: ErrorPayload {
                    summary: "Invalid request".to_string(),
                    detail: err.to_string(),
                },
            };
            write_json_line_shared(writer, &failure);
            return;
        }
    };
    match dispatch(&request.method, queue) {
        Ok(result) => write_json_line_shared(
            writer,
            &RpcSuccess {
                id: request.id,
                result,
            },
        ),
        Err(err) => write_json_line_shared(
            writer,
            &RpcFailure {
                id: request.id,
                error: err.payload(),
            },
        ),
    }
}

fn usage() -> ExitCode {
    eprintln!("usage: vidconvert-queue [--verbose] <config.json> <queue.json>");
    ExitCode::from(2)
}

fn main() -> ExitCode {
    let mut verbose = false;
    let mut paths: Vec<PathBuf> = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "-h" | "--help" => return usage(),
            _ => paths.push(PathBuf::from(arg)),
        }
    }
    let [config_path, queue_path] = paths.as_slice() else {
        return usage();
    };

    logging::init(verbose);

    let config = match AppConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!(target: "vidconvert::bin", "{}", e);
            return ExitCode::from(2);
        }
    };
    let jobs = match load_queue(queue_path) {
        Ok(jobs) => jobs,
        Err(e) => {
            log::error!(target: "vidconvert::bin", "Could not read queue: {}", e);
            return ExitCode::from(2);
        }
    };

    let stdout: SharedWriter = Arc::new(Mutex::new(io::stdout()));
    let queue = Arc::new(QueueProcessor::new(config));
    let events = match queue.start(jobs) {
        Ok(events) => events,
        Err(e) => {
            log::error!(target: "vidconvert::bin", "{}", e);
            return ExitCode::from(2);
        }
    };

    // never joined: a blocked stdin read must not keep the process alive
    {
        let queue = Arc::clone(&queue);
        let writer = Arc::clone(&stdout);
        thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                handle_request(&line, &queue, &writer);
            }
        });
    }

    let mut failed = 0;
    for event in events.iter() {
        if let QueueEvent::QueueCompleted { failed: count, .. } = &event {
            failed = *count;
        }
        write_json_line_shared(&stdout, &event);
    }

    match queue.wait() {
        Ok(remaining) => write_json_line_shared(
            &stdout,
            &RpcEvent {
                event: "queueSnapshot",
                payload: json!({ "jobs": remaining }),
            },
        ),
        Err(e) => {
            log::error!(target: "vidconvert::bin", "{}", e);
            return ExitCode::FAILURE;
        }
    }

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
