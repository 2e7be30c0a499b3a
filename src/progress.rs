//! Progress reporting for bulk commands (`ingest`, `import`,
//! `index-docs`).
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;

#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Walking the input; total unknown yet.
    Scanning { source: String },
    /// `n` of `total` records handled.
    Processing { source: String, n: u64, total: u64 },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// `import general  processing  1,234 / 5,000 records`
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning { source } => format!("{}  scanning...\n", source),
            ProgressEvent::Processing { source, n, total } => format!(
                "{}  processing  {} / {} records\n",
                source,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Scanning { source } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "scanning"
            }),
            ProgressEvent::Processing { source, n, total } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "processing",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
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

/// Emits a `Processing` event every `every` records and at the end.
pub struct Throttled<'a> {
    reporter: &'a dyn ProgressReporter,
    source: String,
    total: u64,
    every: u64,
}

impl<'a> Throttled<'a> {
    pub fn new(reporter: &'a dyn ProgressReporter, source: &str, total: u64, every: u64) -> Self {
        Self {
            reporter,
            source: source.to_string(),
            total,
            every: every.max(1),
        }
    }

    pub fn tick(&self, n: u64) {
        if n % self.every == 0 || n == self.total {
            self.reporter.report(ProgressEvent::Processing {
                source: self.source.clone(),
                n,
                total: self.total,
            });
        }
    }
}
