use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::thread;
use std::time::Duration;

/// Shortest accepted interval between two status fetches.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Which remote record is being polled; decides the terminal statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Terminal on any status containing `COMPLETED`, or `FAILED`, `STOPPED`.
    Inference,
    /// Terminal on `Finished` or `Failed`.
    Tune,
    /// Terminal on `Succeeded` or `Failed`.
    DatasetOnboarding,
}

impl JobKind {
    pub fn is_terminal(&self, status: &str) -> bool {
        match self {
            JobKind::Inference => {
                status.contains("COMPLETED") || status == "FAILED" || status == "STOPPED"
            }
            JobKind::Tune => status == "Finished" || status == "Failed",
            JobKind::DatasetOnboarding => status == "Succeeded" || status == "Failed",
        }
    }
}

/// Blocks until a fetched record reaches a terminal status.
///
/// There is no overall timeout and no cancellation: a job stuck in an intermediate
/// status keeps the caller polling.
pub struct Poller<S = fn(Duration)> {
    kind: JobKind,
    interval: Duration,
    sleep: S,
}

impl Poller {
    /// `interval` is raised to [`MIN_POLL_INTERVAL`] when shorter.
    pub fn new(kind: JobKind, interval: Duration) -> Self {
        Self {
            kind,
            interval: interval.max(MIN_POLL_INTERVAL),
            sleep: thread::sleep,
        }
    }
}

impl<S: FnMut(Duration)> Poller<S> {
    /// Replaces the sleep between fetches.
    pub fn with_sleep<T: FnMut(Duration)>(self, sleep: T) -> Poller<T> {
        Poller {
            kind: self.kind,
            interval: self.interval,
            sleep,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn run<F>(&mut self, fetch: F) -> Result<Value>
    where
        F: FnMut() -> Result<Value>,
    {
        self.run_with_detail(fetch, |_| None)
    }

    /// Like [`Poller::run`], with `detail` adding a segment (e.g. the current epoch)
    /// to every progress line.
    pub fn run_with_detail<F, D>(&mut self, mut fetch: F, mut detail: D) -> Result<Value>
    where
        F: FnMut() -> Result<Value>,
        D: FnMut(&Value) -> Option<String>,
    {
        loop {
            let record = fetch()?;
            let status = record
                .get("status")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("polled record has no status: {}", record))?
                .to_string();

            let elapsed = record
                .get("created_at")
                .and_then(Value::as_str)
                .and_then(|c| elapsed_seconds(c, Utc::now()));
            let line = progress_line(&status, detail(&record).as_deref(), elapsed);

            if self.kind.is_terminal(&status) {
                eprintln!("{}", line);
                log::debug!(target: "GEOFM", "{:?} reached {}", self.kind, status);
                return Ok(record);
            }

            eprint!("{}\r", line);
            (self.sleep)(self.interval);
        }
    }
}

fn progress_line(status: &str, detail: Option<&str>, elapsed: Option<i64>) -> String {
    let elapsed = match elapsed {
        Some(s) => format!("{} seconds", s),
        None => "unknown time".to_string(),
    };
    match detail {
        Some(d) => format!("{} - {} - {}", status, d, elapsed),
        None => format!("{} - {}", status, elapsed),
    }
}

/// Seconds between `created_at` and `now`. Timestamps without an offset are UTC.
pub(crate) fn elapsed_seconds(created_at: &str, now: DateTime<Utc>) -> Option<i64> {
    let created = DateTime::parse_from_rfc3339(created_at)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(created_at, "%Y-%m-%dT%H:%M:%S%.f").map(|n| n.and_utc())
        })
        .ok()?;
    Some((now - created).num_seconds())
}
