//! Batch progress reporting.
//!
//! Reports observable progress during `pfx index` and `pfx classify` so
//! users see how many profiles are done and what happened to each.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a batch pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// The batch is starting with this many candidate profiles.
    Started { pipeline: &'static str, total: u64 },
    /// One profile finished: `n` of `total` done.
    Profile {
        pipeline: &'static str,
        n: u64,
        total: u64,
        profile_id: String,
        outcome: String,
    },
}

/// Reports batch progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the pipelines.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "index  1,234 / 5,000  1790342 indexed".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Started { pipeline, total } => {
                format!("{}  {} profiles\n", pipeline, format_number(*total))
            }
            ProgressEvent::Profile {
                pipeline,
                n,
                total,
                profile_id,
                outcome,
            } => format!(
                "{}  {} / {}  {} {}\n",
                pipeline,
                format_number(*n),
                format_number(*total),
                profile_id,
                outcome
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Started { pipeline, total } => serde_json::json!({
                "event": "started",
                "pipeline": pipeline,
                "total": total
            }),
            ProgressEvent::Profile {
                pipeline,
                n,
                total,
                profile_id,
                outcome,
            } => serde_json::json!({
                "event": "progress",
                "pipeline": pipeline,
                "n": n,
                "total": total,
                "profile_id": profile_id,
                "outcome": outcome
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse `off`, `human` or `json`.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!("unknown progress mode '{}': expected off, human or json", other)),
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
