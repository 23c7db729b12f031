use reqwest::StatusCode;
use serde_json::Value;

/// Failures that stop a call before (or instead of) returning a response body.
///
/// These travel inside `anyhow::Error`; use `err.downcast_ref::<StudioError>()`
/// to tell an expired token apart from any other failure.
#[derive(Debug, thiserror::Error)]
pub enum StudioError {
    /// Missing credentials or an unusable configuration file.
    #[error("{0}")]
    Config(String),
    /// A request payload failed schema validation; nothing was sent.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The gateway redirected to the identity provider's login page.
    #[error("401 Unauthorized: Access token provided has either expired or is invalid.")]
    Unauthorized,
}

impl StudioError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct ErrorBody {
    // FastAPI returns either a string or a list of {"loc","msg","type"} objects.
    #[serde(default)]
    pub(crate) detail: Option<Value>,
    #[serde(default)]
    pub(crate) message: Option<String>,
}

/// Reduces an error response body to the message worth showing a user.
///
/// `detail` wins when present; list-shaped validation details are joined by their
/// `msg` fields. Bodies that are not JSON are returned as-is.
pub(crate) fn error_detail(text: &str) -> String {
    let Ok(body) = serde_json::from_str::<ErrorBody>(text) else {
        return text.to_string();
    };

    match body.detail {
        Some(Value::String(s)) => s,
        Some(Value::Array(items)) => {
            let messages: Vec<String> = items
                .iter()
                .filter_map(|item| item.as_object())
                .map(|obj| match obj.get("msg") {
                    Some(Value::String(m)) => m.clone(),
                    _ => Value::Object(obj.clone()).to_string(),
                })
                .collect();
            if messages.is_empty() {
                Value::Array(items).to_string()
            } else {
                messages.join("; ")
            }
        }
        Some(other) => other.to_string(),
        None => body.message.unwrap_or_else(|| text.to_string()),
    }
}

pub(crate) fn format_api_error(status: StatusCode, text: &str) -> String {
    format!("API Error {}: {}", status.as_u16(), error_detail(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_detail_is_used_verbatim() {
        assert_eq!(error_detail(r#"{"detail":"Not found"}"#), "Not found");
    }

    #[test]
    fn list_detail_joins_messages() {
        let body = r#"{"detail":[{"loc":["body","bbox"],"msg":"field required"},{"msg":"bad date"}]}"#;
        assert_eq!(error_detail(body), "field required; bad date");
    }

    #[test]
    fn non_json_body_passes_through() {
        assert_eq!(error_detail("<html>gateway timeout</html>"), "<html>gateway timeout</html>");
    }

    #[test]
    fn api_error_includes_status() {
        let msg = format_api_error(StatusCode::FORBIDDEN, r#"{"detail":"no access"}"#);
        assert_eq!(msg, "API Error 403: no access");
    }

    #[test]
    fn unauthorized_message_mentions_expiry() {
        assert!(StudioError::Unauthorized.to_string().contains("expired"));
    }
}
