use sha2::{Digest, Sha256};
use std::time::Duration;

/// Gateway statuses the transport layer retries; everything else is handed back.
pub(crate) fn retriable_status(code: u16) -> bool {
    matches!(code, 502 | 503 | 504)
}

pub(crate) fn backoff(current: Duration, max: Duration) -> Duration {
    let next = Duration::from_secs_f64((current.as_secs_f64() * 2.0).max(1.0));
    if next > max { max } else { next }
}

pub(crate) fn guess_filename_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/').next().and_then(|s| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    })
}

/// First eight hex characters of the SHA-256 of `input`.
pub(crate) fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// `https://host/studio-gateway/` -> `https://host/mlflow`
pub(crate) fn mlflow_url(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    let root = match trimmed.rfind('/') {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };
    format!("{}/mlflow", root)
}

pub(crate) fn round5(v: f64) -> f64 {
    (v * 100_000.0).round() / 100_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_gateway_errors_are_retried() {
        assert!(retriable_status(502));
        assert!(retriable_status(504));
        assert!(!retriable_status(500));
        assert!(!retriable_status(429));
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let max = Duration::from_secs(5);
        assert_eq!(backoff(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(backoff(Duration::from_secs(4), max), max);
    }

    #[test]
    fn filename_ignores_query() {
        assert_eq!(
            guess_filename_from_url("https://s3.example.com/b/out/archive.zip?X-Amz-Signature=abc"),
            Some("archive.zip".to_string())
        );
        assert_eq!(guess_filename_from_url("https://example.com/"), None);
    }

    #[test]
    fn short_hash_is_stable_and_short() {
        let a = short_hash("https://example.com/archive.zip");
        assert_eq!(a.len(), 8);
        assert_eq!(a, short_hash("https://example.com/archive.zip"));
        assert_ne!(a, short_hash("https://example.com/other.zip"));
    }

    #[test]
    fn mlflow_url_replaces_gateway_segment() {
        assert_eq!(
            mlflow_url("https://studio.example.com/studio-gateway/"),
            "https://studio.example.com/mlflow"
        );
    }
}
