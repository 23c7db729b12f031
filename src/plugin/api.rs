use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;

use super::raster::TaskOutput;
use crate::builder::{InferenceRequest, InferenceRequestBuilder};
use crate::config::PluginConfig;
use crate::error::format_api_error;

const SANDBOX_MODEL: &str = "geofm-sandbox-models";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    ApiKey,
    Bearer,
}

impl AuthType {
    /// `"bearer"` in any case selects [`AuthType::Bearer`]; anything else is an API key.
    pub fn from_str_loose(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("bearer") {
            AuthType::Bearer
        } else {
            AuthType::ApiKey
        }
    }
}

/// The map plugin's own client for submitting inferences and fetching their outputs.
///
/// Failures come back as user-facing messages rather than errors to propagate.
#[derive(Debug, Clone)]
pub struct GeoInferenceApi {
    http: HttpClient,
    base_url: String,
    inference_url: String,
    api_key: String,
    auth_type: AuthType,
}

impl GeoInferenceApi {
    pub fn new(config: &PluginConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            inference_url: config.inference_url.trim_end_matches('/').to_string(),
            api_key: String::new(),
            auth_type: AuthType::ApiKey,
        })
    }

    pub fn set_auth_credentials(&mut self, api_key: impl Into<String>, auth_type: &str) {
        self.api_key = api_key.into();
        self.auth_type = AuthType::from_str_loose(auth_type);
        log::info!(target: "GeoInferenceApi", "API credentials set. Auth Type: {:?}", self.auth_type);
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn headers(&self) -> Result<HeaderMap, String> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let (name, value) = match self.auth_type {
            AuthType::ApiKey => ("x-api-key", self.api_key.clone()),
            AuthType::Bearer => ("authorization", format!("Bearer {}", self.api_key)),
        };
        let value = HeaderValue::from_str(&value).map_err(|_| "API key contains invalid characters".to_string())?;
        headers.insert(name, value);
        Ok(headers)
    }

    fn get(&self, url: &str) -> Result<RequestBuilder, String> {
        Ok(self.http.get(url).headers(self.headers()?))
    }

    /// `GET <base>?limit=100&skip=0`, returning `results`.
    pub fn list_inferences(&self) -> Result<Vec<Value>, String> {
        if !self.has_api_key() {
            return Err("API key not set. Please enter an API key first.".to_string());
        }
        let url = format!("{}?limit=100&skip=0", self.base_url);
        let resp = self.get(&url)?.send().map_err(|e| {
            log::warn!(target: "GeoInferenceApi", "API request error: {}", e);
            format!("Connection Error: {}", e)
        })?;
        let status = resp.status();
        let text = resp.text().map_err(|e| format!("Connection Error: {}", e))?;
        log::info!(target: "GeoInferenceApi", "API List Inferences Response Status: {}", status);
        log::debug!(target: "GeoInferenceApi", "API List Inferences Response Text: {:.500}", text);

        if status != StatusCode::OK {
            return Err(format_api_error(status, &text));
        }
        let data: Value = serde_json::from_str(&text).map_err(|e| {
            log::warn!(target: "GeoInferenceApi", "JSON parse error: {}", e);
            format!("Response Parsing Error:{}.Raw response:{:.200}", e, text)
        })?;
        match data.get("results").and_then(Value::as_array) {
            Some(results) => Ok(results.clone()),
            None => Err(format!("Response Parsing Error:no results.Raw response:{:.200}", text)),
        }
    }

    /// Request body for a map-drawn bounding box. The model id falls back to the
    /// builder's default.
    pub fn create_inference_request(
        &self,
        bbox: [f64; 4],
        model_id: Option<&str>,
        start_date: &str,
        end_date: &str,
        description: &str,
        location: &str,
    ) -> InferenceRequest {
        let mut builder = InferenceRequestBuilder::new()
            .with_bbox(bbox)
            .with_description(description)
            .with_location(location)
            .with_temporal_domain(start_date, end_date);
        if let Some(id) = model_id {
            builder = builder.with_model_id(id);
        }
        builder.build()
    }

    /// Posts an inference for `bbox` (`[west, south, east, north]`). Success is a 201.
    pub fn submit_inference_request(
        &self,
        bbox: &[f64],
        model_id: Option<&str>,
        start_date: &str,
        end_date: &str,
        description: &str,
        location: &str,
    ) -> Result<Value, String> {
        let bbox: [f64; 4] = bbox
            .try_into()
            .map_err(|_| "Invalid bounding box. Expected [west, south, east, north]".to_string())?;
        if !self.has_api_key() {
            return Err("API key not set. Please enter your API key first.".to_string());
        }
        let body = self.create_inference_request(bbox, model_id, start_date, end_date, description, location);
        log::info!(target: "GeoInference", "Submitting inference request to: {}", self.base_url);
        log::debug!(
            target: "GeoInference",
            "Request body: {}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );

        let resp = self
            .http
            .post(&self.base_url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .map_err(|e| log_failure(format!("Unexpected error during API request: {}", e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .map_err(|e| log_failure(format!("Unexpected error during API request: {}", e)))?;
        log::info!(target: "GeoInference", "API Response Status: {}", status);

        match status {
            StatusCode::CREATED => serde_json::from_str(&text).map_err(|_| format!("Invalid JSON response: {}", text)),
            StatusCode::UNPROCESSABLE_ENTITY => Err(log_failure(format!("Validation Error 422:{}", text))),
            other => Err(log_failure(format!(
                "API request failed with status {}: {}",
                other.as_u16(),
                text
            ))),
        }
    }

    /// `GET <inf>/v2/models` without the sandbox entry.
    pub fn list_models(&self) -> Result<Vec<Value>, String> {
        if !self.has_api_key() {
            return Err("API key not set.".to_string());
        }
        let url = format!("{}/v2/models", self.inference_url);
        let resp = self.get(&url)?.send().map_err(|e| format!("Connection Error: {}", e))?;
        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().unwrap_or_default();
            return Err(format!("API Error {}: {}", status.as_u16(), text));
        }
        let data: Value = resp.json().map_err(|e| format!("Connection Error: {}", e))?;
        Ok(data
            .get("results")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|m| m.get("display_name").and_then(Value::as_str) != Some(SANDBOX_MODEL))
            .cloned()
            .collect())
    }

    /// Output URL of every task of `inference_id`. Tasks whose output lookup fails
    /// are left out.
    pub fn get_task_outputs(&self, inference_id: &str) -> Result<Vec<TaskOutput>, String> {
        if !self.has_api_key() {
            return Err("API key not set".to_string());
        }
        let tasks_url = format!("{}/v2/inference/{}/tasks", self.inference_url, inference_id);
        let tasks: Value = self
            .get(&tasks_url)?
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| {
                log::error!(target: "GeoInferenceApi", "Error getting task outputs: {}", e);
                format!("Error getting task outputs: {}", e)
            })?;

        let task_ids = task_ids(&tasks);
        log::info!(target: "GeoInferenceApi", "Found {} task IDs: {:?}", task_ids.len(), task_ids);

        let mut outputs = Vec::new();
        for task_id in task_ids {
            let url = format!("{}/v2/tasks/{}/output", self.inference_url, task_id);
            let output: Value = match self
                .get(&url)?
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.json())
            {
                Ok(v) => v,
                Err(e) => {
                    log::warn!(target: "GeoInferenceApi", "Error getting output for task {}: {}", task_id, e);
                    continue;
                }
            };
            if let Some(presigned_url) = output.get("output_url").and_then(Value::as_str) {
                outputs.push(TaskOutput {
                    task_id,
                    presigned_url: presigned_url.to_string(),
                });
            }
        }
        Ok(outputs)
    }
}

fn log_failure(msg: String) -> String {
    log::error!(target: "GeoInference", "{}", msg);
    msg
}

/// Task ids from either `{"tasks": [...]}` or a bare list.
fn task_ids(tasks: &Value) -> Vec<String> {
    let list = match tasks {
        Value::Object(map) => map.get("tasks").and_then(Value::as_array),
        Value::Array(items) => Some(items),
        _ => None,
    };
    list.into_iter()
        .flatten()
        .filter_map(|t| t.get("task_id").and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedServer};
    use reqwest::header::AUTHORIZATION;
    use serde_json::json;

    fn api() -> GeoInferenceApi {
        let config = PluginConfig {
            base_url: "http://127.0.0.1:9/v2/inference/".into(),
            inference_url: "http://127.0.0.1:9/".into(),
            ..PluginConfig::default()
        };
        GeoInferenceApi::new(&config).unwrap()
    }

    #[test]
    fn auth_type_is_loose() {
        assert_eq!(AuthType::from_str_loose("Bearer"), AuthType::Bearer);
        assert_eq!(AuthType::from_str_loose("X-Api-Key"), AuthType::ApiKey);
    }

    #[test]
    fn bearer_header() {
        let mut a = api();
        a.set_auth_credentials("tok", "bearer");
        let h = a.headers().unwrap();
        assert_eq!(h.get(AUTHORIZATION).unwrap(), "Bearer tok");
        assert!(h.get("x-api-key").is_none());

        a.set_auth_credentials("key", "X-Api-Key");
        assert_eq!(a.headers().unwrap().get("x-api-key").unwrap(), "key");
    }

    #[test]
    fn invalid_bbox_is_rejected_first() {
        let err = api()
            .submit_inference_request(&[1.0, 2.0, 3.0], None, "2024-01-01", "2024-01-02", "", "here")
            .unwrap_err();
        assert_eq!(err, "Invalid bounding box. Expected [west, south, east, north]");
    }

    #[test]
    fn request_uses_builder_defaults() {
        let req = api().create_inference_request([1.0, 2.0, 3.0, 4.0], None, "2024-01-01", "2024-01-02", "d", "l");
        assert_eq!(req.spatial_domain.bbox, vec![vec![1.0, 2.0, 3.0, 4.0]]);
        assert_eq!(req.temporal_domain, vec!["2024-01-01_2024-01-02"]);
        assert_eq!(req.model_id, InferenceRequest::default().model_id);
    }

    #[test]
    fn task_ids_from_both_shapes() {
        let wrapped = json!({"tasks": [{"task_id": "a"}, {"task_id": ""}, {"other": 1}]});
        assert_eq!(task_ids(&wrapped), vec!["a"]);
        let bare = json!([{"task_id": "b"}, {"task_id": "c"}]);
        assert_eq!(task_ids(&bare), vec!["b", "c"]);
    }

    fn api_at(server: &ScriptedServer) -> GeoInferenceApi {
        let config = PluginConfig {
            base_url: server.url("/v2/inference/"),
            inference_url: server.base().to_string(),
            ..PluginConfig::default()
        };
        let mut api = GeoInferenceApi::new(&config).unwrap();
        api.set_auth_credentials("pak-1", "X-Api-Key");
        api
    }

    #[test]
    fn list_models_error_keeps_raw_body() {
        let server = ScriptedServer::start(vec![Reply::new(
            "500 Internal Server Error",
            br#"{"detail":"boom"}"#,
        )]);
        let err = api_at(&server).list_models().unwrap_err();
        assert_eq!(err, r#"API Error 500: {"detail":"boom"}"#);
        assert_eq!(server.header(0, "x-api-key").as_deref(), Some("pak-1"));
    }

    #[test]
    fn list_models_drops_sandbox() {
        let body = br#"{"results":[{"display_name":"geofm-sandbox-models"},{"display_name":"flood"}]}"#;
        let server = ScriptedServer::start(vec![Reply::new("200 OK", body)]);
        let models = api_at(&server).list_models().unwrap();
        assert_eq!(models, vec![json!({"display_name": "flood"})]);
    }
}
