//! Optional subprocess scanner run alongside the built-in detectors.
//!
//! The scanner reads the source on stdin and reports JSON on stdout. Every
//! failure mode (missing binary, timeout, bad exit, unparseable output) is
//! surfaced as a `ScanFailure` so the orchestrator can record a degraded
//! detector note instead of failing the analysis.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::config::ExternalScannerConfig;
use crate::models::{Category, Finding, Language, Severity, SourceUnit};

/// Cap on scanner stdout kept in memory.
const MAX_OUTPUT_BYTES: u64 = 8 * 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ScanFailure {
    #[error("scanner '{0}' is not installed")]
    NotInstalled(String),

    #[error("scanner I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("scanner exceeded its {0} ms timeout")]
    TimedOut(u64),

    #[error("scanner exited with status {0}")]
    Exit(i32),

    #[error("scanner output was not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

pub trait ExternalScanner: Send + Sync {
    fn name(&self) -> &str;

    /// Scan one unit within `budget`. Languages the scanner does not
    /// understand yield no findings.
    fn scan(&self, unit: &SourceUnit, budget: Duration) -> Result<Vec<Finding>, ScanFailure>;
}

// ---------------------------------------------------------------------------
// Bandit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BanditReport {
    #[serde(default)]
    results: Vec<BanditIssue>,
}

#[derive(Debug, Deserialize)]
struct BanditIssue {
    test_id: String,
    issue_severity: String,
    issue_text: String,
    line_number: usize,
}

pub struct BanditScanner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl BanditScanner {
    pub fn new(config: &ExternalScannerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

impl ExternalScanner for BanditScanner {
    fn name(&self) -> &str {
        "bandit"
    }

    fn scan(&self, unit: &SourceUnit, budget: Duration) -> Result<Vec<Finding>, ScanFailure> {
        if unit.language != Language::Python {
            return Ok(Vec::new());
        }
        let limit = self.timeout.min(budget);
        let (stdout, status) = run_with_stdin(&self.program, &self.args, &unit.text, limit)?;
        // bandit exits 1 when it found issues
        match status.code() {
            Some(0) | Some(1) => {}
            Some(code) => return Err(ScanFailure::Exit(code)),
            None => return Err(ScanFailure::Exit(-1)),
        }
        parse_bandit_report(&stdout)
    }
}

pub fn parse_bandit_report(raw: &str) -> Result<Vec<Finding>, ScanFailure> {
    let report: BanditReport = serde_json::from_str(raw)?;
    Ok(report
        .results
        .into_iter()
        .map(|issue| {
            let severity = match issue.issue_severity.to_ascii_uppercase().as_str() {
                "HIGH" => Severity::High,
                "MEDIUM" => Severity::Medium,
                "LOW" => Severity::Low,
                _ => Severity::Info,
            };
            Finding::new(
                Category::Security,
                format!("SEC_BANDIT_{}", issue.test_id.to_ascii_uppercase()),
                severity,
                issue.issue_text,
                issue.line_number.max(1),
            )
        })
        .collect())
}

/// Spawn `program`, feed `input` on stdin and collect stdout, killing the
/// child once `limit` has elapsed.
fn run_with_stdin(
    program: &str,
    args: &[String],
    input: &str,
    limit: Duration,
) -> Result<(String, ExitStatus), ScanFailure> {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ScanFailure::NotInstalled(program.to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(mut stdin) = child.stdin.take() {
        let input = input.to_owned();
        // Broken pipe means the scanner stopped reading; its exit status tells the rest.
        thread::spawn(move || {
            let _ = stdin.write_all(input.as_bytes());
        });
    }

    let Some(stdout) = child.stdout.take() else {
        reap(&mut child);
        return Err(ScanFailure::Io(std::io::Error::other("scanner stdout unavailable")));
    };
    let reader = thread::spawn(move || {
        let mut output = Vec::new();
        stdout
            .take(MAX_OUTPUT_BYTES)
            .read_to_end(&mut output)
            .map(|_| output)
    });

    let deadline = Instant::now() + limit;
    while !reader.is_finished() {
        if Instant::now() >= deadline {
            debug!(program, limit_ms = limit.as_millis() as u64, "Killing scanner after timeout");
            let _ = child.kill();
            reap(&mut child);
            return Err(ScanFailure::TimedOut(limit.as_millis() as u64));
        }
        thread::sleep(POLL_INTERVAL);
    }

    let output = reader
        .join()
        .map_err(|_| std::io::Error::other("scanner reader thread panicked"))??;
    let status = match reap(&mut child) {
        Some(status) => status,
        None => child.wait()?,
    };
    Ok((String::from_utf8_lossy(&output).into_owned(), status))
}

/// Bounded reap: wait briefly, then kill.
fn reap(child: &mut Child) -> Option<ExitStatus> {
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(_) => return None,
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            return child.wait().ok();
        }
        thread::sleep(POLL_INTERVAL);
    }
}
