use anyhow::{Context, Result};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::config::{Credentials, Settings};
use crate::error::StudioError;
use crate::util::{backoff, retriable_status};

const REQUEST_ORIGIN: &str = "python-sdk/";
static X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
static X_REQUEST_ORIGIN: HeaderName = HeaderName::from_static("x-request-origin");

/// Authenticated HTTP session shared by every resource client.
///
/// The header map is shared mutable state: file uploads drop `Content-Type` for the
/// duration of the request and put it back afterwards. Two callers uploading and
/// sending JSON at the same time can observe each other's headers, so use one
/// session from one call site at a time.
#[derive(Debug)]
pub struct Session {
    http: HttpClient,
    headers: Mutex<HeaderMap>,
    max_retry: usize,
    retry_pause: Duration,
    sleep_max: Duration,
}

impl Session {
    pub fn new(credentials: &Credentials, settings: &Settings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(X_REQUEST_ORIGIN.clone(), HeaderValue::from_static(REQUEST_ORIGIN));
        match credentials {
            Credentials::ApiKey(key) => {
                headers.insert(X_API_KEY.clone(), secret_header(key)?);
            }
            Credentials::Token(token) => {
                headers.insert(AUTHORIZATION, secret_header(&format!("Bearer {}", token))?);
            }
        }

        let http = HttpClient::builder()
            .user_agent(format!("geostudio-rs/{}", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify)
            .build()
            .context("failed to build gateway client")?;

        Ok(Self {
            http,
            headers: Mutex::new(headers),
            max_retry: settings.max_retry,
            retry_pause: Duration::from_secs(1),
            sleep_max: Duration::from_secs(120),
        })
    }

    pub(crate) fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Snapshot of the headers every request carries right now.
    pub fn headers(&self) -> HeaderMap {
        self.lock().clone()
    }

    /// Runs `f` with `Content-Type` removed from the session headers, then restores
    /// it to `application/json` whatever `f` returned.
    pub(crate) fn without_content_type<T>(&self, f: impl FnOnce() -> T) -> T {
        self.lock().remove(CONTENT_TYPE);
        let out = f();
        self.lock()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        out
    }

    /// Sends a request built by `f`, retrying gateway errors and connection failures
    /// up to the configured retry count.
    pub(crate) fn send<F>(&self, mut f: F) -> Result<Response>
    where
        F: FnMut(&HttpClient, HeaderMap) -> std::result::Result<Response, reqwest::Error>,
    {
        let mut tries = 0usize;
        let mut sleep = self.retry_pause;
        loop {
            let result = f(&self.http, self.headers());

            match result {
                Ok(resp) => {
                    if retriable_status(resp.status().as_u16()) && tries < self.max_retry {
                        tries += 1;
                        log::warn!(
                            "HTTP {} from {}, retrying ({}/{})",
                            resp.status(),
                            resp.url(),
                            tries,
                            self.max_retry
                        );
                        thread::sleep(sleep);
                        sleep = backoff(sleep, self.sleep_max);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if tries >= self.max_retry {
                        return Err(err).context("could not connect");
                    }
                    tries += 1;
                    thread::sleep(sleep);
                    sleep = backoff(sleep, self.sleep_max);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeaderMap> {
        self.headers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn secret_header(value: &str) -> Result<HeaderValue> {
    let mut v = HeaderValue::from_str(value.trim())
        .map_err(|_| StudioError::config("credential contains characters not allowed in a header"))?;
    v.set_sensitive(true);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedServer};

    #[test]
    fn api_key_goes_into_x_api_key() {
        let s = Session::new(&Credentials::ApiKey("pak-1".into()), &Settings::default()).unwrap();
        let h = s.headers();
        assert_eq!(h.get("x-api-key").unwrap(), "pak-1");
        assert_eq!(h.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(h.get("x-request-origin").unwrap(), "python-sdk/");
        assert!(h.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn token_goes_into_bearer_header() {
        let s = Session::new(&Credentials::Token("abc".into()), &Settings::default()).unwrap();
        assert_eq!(s.headers().get(AUTHORIZATION).unwrap(), "Bearer abc");
    }

    #[test]
    fn content_type_is_restored_after_upload() {
        let s = Session::new(&Credentials::ApiKey("k".into()), &Settings::default()).unwrap();
        let seen = s.without_content_type(|| s.headers().get(CONTENT_TYPE).cloned());
        assert!(seen.is_none());
        assert_eq!(s.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }

    fn quick_session(max_retry: usize) -> Session {
        let settings = Settings {
            max_retry,
            ..Settings::default()
        };
        let mut s = Session::new(&Credentials::ApiKey("pak-1".into()), &settings).unwrap();
        s.retry_pause = Duration::from_millis(5);
        s.sleep_max = Duration::from_millis(20);
        s
    }

    #[test]
    fn gateway_error_then_success_retries_once() {
        let server = ScriptedServer::start(vec![
            Reply::new("503 Service Unavailable", b"busy"),
            Reply::new("200 OK", b"{}"),
        ]);
        let s = quick_session(3);
        let resp = s.send(|http, h| http.get(server.url("/v2/models")).headers(h).send()).unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(server.hits(), 2);
        assert_eq!(server.header(1, "x-api-key").as_deref(), Some("pak-1"));
    }

    #[test]
    fn without_retries_gateway_error_is_returned() {
        let server = ScriptedServer::start(vec![Reply::new("503 Service Unavailable", b"busy")]);
        let s = quick_session(0);
        let resp = s.send(|http, h| http.get(server.url("/v2/models")).headers(h).send()).unwrap();
        assert_eq!(resp.status(), 503);
        assert_eq!(server.hits(), 1);
    }

    #[test]
    fn retries_stop_at_max_retry() {
        let server = ScriptedServer::start(vec![
            Reply::new("502 Bad Gateway", b""),
            Reply::new("504 Gateway Timeout", b""),
            Reply::new("502 Bad Gateway", b""),
            Reply::new("200 OK", b"{}"),
        ]);
        let s = quick_session(2);
        let resp = s.send(|http, h| http.get(server.url("/v2/models")).headers(h).send()).unwrap();
        assert_eq!(resp.status(), 502);
        assert_eq!(server.hits(), 3);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let server = ScriptedServer::start(vec![Reply::new("404 Not Found", b"{}")]);
        let s = quick_session(3);
        let resp = s.send(|http, h| http.get(server.url("/v2/models")).headers(h).send()).unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(server.hits(), 1);
    }

    #[test]
    fn newline_in_key_is_a_config_error() {
        let err = Session::new(&Credentials::ApiKey("bad\nkey".into()), &Settings::default())
            .unwrap_err();
        assert!(err.downcast_ref::<StudioError>().is_some());
    }
}
