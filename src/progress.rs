//! Import progress reporting.
//!
//! Emitted on **stderr** so the import summary on stdout stays parseable.

use std::io::{IsTerminal, Write};

#[derive(Clone, Debug, PartialEq)]
pub enum ImportProgressEvent {
    /// Starting document `n` of `total`.
    Started { n: u64, total: u64, name: String },
    Imported { name: String, chunks: u64 },
    Skipped { name: String, reason: String },
}

pub trait ImportProgressReporter: Send + Sync {
    fn report(&self, event: ImportProgressEvent);
}

/// `import  3 / 12  contract.pdf`
pub struct StderrProgress;

impl ImportProgressReporter for StderrProgress {
    fn report(&self, event: ImportProgressEvent) {
        let line = match &event {
            ImportProgressEvent::Started { n, total, name } => format!(
                "import  {} / {}  {}\n",
                format_number(*n),
                format_number(*total),
                name
            ),
            ImportProgressEvent::Imported { name, chunks } => {
                format!("  ok    {} ({} chunks)\n", name, format_number(*chunks))
            }
            ImportProgressEvent::Skipped { name, reason } => {
                format!("  skip  {}: {}\n", name, reason)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line.
pub struct JsonProgress;

impl ImportProgressReporter for JsonProgress {
    fn report(&self, event: ImportProgressEvent) {
        let obj = match &event {
            ImportProgressEvent::Started { n, total, name } => serde_json::json!({
                "event": "started", "n": n, "total": total, "name": name
            }),
            ImportProgressEvent::Imported { name, chunks } => serde_json::json!({
                "event": "imported", "name": name, "chunks": chunks
            }),
            ImportProgressEvent::Skipped { name, reason } => serde_json::json!({
                "event": "skipped", "name": name, "reason": reason
            }),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", obj);
        let _ = stderr.flush();
    }
}

pub struct NoProgress;

impl ImportProgressReporter for NoProgress {
    fn report(&self, _event: ImportProgressEvent) {}
}

fn format_number(n: u64) -> String {
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
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ImportProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
