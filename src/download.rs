use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderValue, RANGE};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::util::{backoff, retriable_status};

/// Fetches a URL into a local file and returns the number of bytes written.
pub trait Download {
    fn download(&self, url: &str, target: &Path) -> Result<u64>;
}

/// Streams presigned URLs to disk with a progress bar, resuming with `Range`
/// requests after interrupted reads.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    http: HttpClient,
    progress: bool,
    retry_max: usize,
    retry_pause: Duration,
    sleep_max: Duration,
}

impl HttpDownloader {
    pub fn new(verify_tls: bool, timeout: Duration) -> Result<Self> {
        let agent = format!("geostudio-rs/{}", env!("CARGO_PKG_VERSION"));
        let http = HttpClient::builder()
            .user_agent(agent)
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .context("failed to build download client")?;
        Ok(Self {
            http,
            progress: true,
            retry_max: 3,
            retry_pause: Duration::from_secs(1),
            sleep_max: Duration::from_secs(30),
        })
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Attempts allowed after the first, shared between failed requests and broken reads.
    pub fn with_retry_max(mut self, retry_max: usize) -> Self {
        self.retry_max = retry_max;
        self
    }

    fn progress_bar(&self, total: Option<u64>) -> Result<Option<ProgressBar>> {
        if !self.progress {
            return Ok(None);
        }
        let pb = total.map_or_else(ProgressBar::new_spinner, ProgressBar::new);
        pb.set_style(
            ProgressStyle::with_template("{msg} {bytes}/{total_bytes} [{wide_bar}] {bytes_per_sec} {eta}")?
                .progress_chars("=>-"),
        );
        Ok(Some(pb))
    }

    /// GET from byte `offset`, retrying gateway errors and transport failures.
    fn request(&self, url: &str, offset: u64, attempts: &mut usize, pause: &mut Duration) -> Result<Response> {
        loop {
            let mut req = self.http.get(url);
            if offset > 0 {
                req = req.header(RANGE, HeaderValue::from_str(&format!("bytes={}-", offset))?);
            }
            let retry = match req.send() {
                Ok(resp) if !retriable_status(resp.status().as_u16()) => {
                    return resp.error_for_status().context("download request failed");
                }
                Ok(resp) => format!("status {}", resp.status()),
                Err(e) => e.to_string(),
            };
            if *attempts >= self.retry_max {
                bail!("could not download {}: {}", url, retry);
            }
            *attempts += 1;
            log::warn!("download of {} failed ({}), retrying in {:?}", url, retry, pause);
            thread::sleep(*pause);
            *pause = backoff(*pause, self.sleep_max);
        }
    }
}

impl Download for HttpDownloader {
    fn download(&self, url: &str, target: &Path) -> Result<u64> {
        if let Some(dir) = target.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let mut attempts = 0usize;
        let mut pause = self.retry_pause;
        let mut written = 0u64;
        let mut expected: Option<u64> = None;
        let mut pb: Option<ProgressBar> = None;

        loop {
            let mut resp = self.request(url, written, &mut attempts, &mut pause)?;
            // Servers that ignore Range send the whole file again.
            let resume = written > 0 && resp.status() == StatusCode::PARTIAL_CONTENT;
            if !resume {
                written = 0;
                expected = resp.content_length();
            }
            if pb.is_none() {
                pb = self.progress_bar(expected)?;
            }
            if let Some(pb) = &pb {
                pb.set_position(written);
            }

            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(resume)
                .truncate(!resume)
                .open(target)
                .with_context(|| format!("failed to open {}", target.display()))?;
            let mut sink = BufWriter::new(file);
            let copied = match &pb {
                Some(pb) => io::copy(&mut resp, &mut pb.wrap_write(&mut sink)),
                None => io::copy(&mut resp, &mut sink),
            };
            sink.flush()?;
            drop(sink);

            written = fs::metadata(target)?.len();
            match copied {
                Ok(_) => break,
                Err(e) if attempts < self.retry_max => {
                    attempts += 1;
                    log::warn!("download of {} interrupted at {} bytes ({}), resuming", url, written, e);
                    thread::sleep(pause);
                    pause = backoff(pause, self.sleep_max);
                }
                Err(e) => return Err(e).context("download interrupted"),
            }
        }

        if let Some(total) = expected {
            if written < total {
                bail!("download incomplete: got {} of {} bytes", written, total);
            }
        }
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        log::debug!("downloaded {} bytes from {} to {}", written, url, target.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedServer};

    fn downloader(retry_max: usize) -> HttpDownloader {
        let mut d = HttpDownloader::new(true, Duration::from_secs(10))
            .unwrap()
            .with_progress(false)
            .with_retry_max(retry_max);
        d.retry_pause = Duration::from_millis(5);
        d.sleep_max = Duration::from_millis(20);
        d
    }

    #[test]
    fn interrupted_read_resumes_with_range() {
        let server = ScriptedServer::start(vec![
            Reply::truncated("200 OK", b"hello", 10),
            Reply::new("206 Partial Content", b"world"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.zip");

        let n = downloader(2).download(&server.url("/out.zip"), &target).unwrap();
        assert_eq!(n, 10);
        assert_eq!(fs::read(&target).unwrap(), b"helloworld");
        assert_eq!(server.header(0, "range"), None);
        assert_eq!(server.header(1, "range").as_deref(), Some("bytes=5-"));
    }

    #[test]
    fn ignored_range_rewrites_from_start() {
        let server = ScriptedServer::start(vec![
            Reply::truncated("200 OK", b"hello", 10),
            Reply::new("200 OK", b"0123456789"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.zip");

        let n = downloader(2).download(&server.url("/out.zip"), &target).unwrap();
        assert_eq!(n, 10);
        assert_eq!(fs::read(&target).unwrap(), b"0123456789");
    }

    #[test]
    fn short_resume_is_incomplete() {
        let server = ScriptedServer::start(vec![
            Reply::truncated("200 OK", b"hello", 10),
            Reply::new("206 Partial Content", b"wo"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.zip");

        let err = downloader(2).download(&server.url("/out.zip"), &target).unwrap_err();
        assert!(err.to_string().contains("download incomplete: got 7 of 10 bytes"), "{}", err);
    }

    #[test]
    fn gateway_error_is_retried() {
        let server = ScriptedServer::start(vec![
            Reply::new("503 Service Unavailable", b""),
            Reply::new("200 OK", b"abc"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("out.bin");

        assert_eq!(downloader(1).download(&server.url("/out.bin"), &target).unwrap(), 3);
        assert_eq!(server.hits(), 2);
        assert_eq!(fs::read(&target).unwrap(), b"abc");
    }

    #[test]
    fn retry_budget_exhausted() {
        let server = ScriptedServer::start(vec![Reply::new("503 Service Unavailable", b"")]);
        let dir = tempfile::tempdir().unwrap();

        let err = downloader(0)
            .download(&server.url("/out.bin"), &dir.path().join("out.bin"))
            .unwrap_err();
        assert!(err.to_string().contains("could not download"), "{}", err);
        assert_eq!(server.hits(), 1);
    }
}
