use anyhow::{Context, Result, anyhow};
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::blocking::Response;
use reqwest::blocking::multipart::{Form, Part};
use serde_json::{Value, json};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use url::Url;

use crate::config::{ClientOptions, ResolvedConfig, Settings, load_config, normalize_api_url};
use crate::error::StudioError;
use crate::session::Session;
use crate::table::Table;

/// Marker in the final URL of a request bounced to the identity provider's login page.
const ISV_LOGIN_STRING: &str = "login.ibm.com/oidc/sps";

/// Shape in which a response body is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Output {
    /// The parsed JSON body.
    #[default]
    Json,
    /// The body (or its data field) flattened into a [`Table`].
    DataFrame,
    /// Status, URL and body bytes, unprocessed.
    Raw,
}

impl Output {
    const VALID: [&'static str; 3] = ["json", "df", "raw"];
}

impl FromStr for Output {
    type Err = StudioError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json" => Ok(Output::Json),
            "df" => Ok(Output::DataFrame),
            "raw" => Ok(Output::Raw),
            other => Err(StudioError::validation(format!(
                "Service `{}` is not supported. Valid Options: {:?}",
                other,
                Output::VALID
            ))),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Output::Json => "json",
            Output::DataFrame => "df",
            Output::Raw => "raw",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    /// Final URL after redirects.
    pub url: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body)
            .with_context(|| format!("failed to parse API JSON (url={}, status={})", self.url, self.status))
    }
}

/// A response rendered in the requested [`Output`] format.
#[derive(Debug, Clone)]
pub enum Formatted {
    Json(Value),
    Table(Table),
    Raw(RawResponse),
}

impl Formatted {
    pub fn into_json(self) -> Result<Value> {
        match self {
            Formatted::Json(v) => Ok(v),
            Formatted::Raw(r) => r.json(),
            Formatted::Table(_) => Err(anyhow!("response was formatted as a table, not JSON")),
        }
    }

    pub fn into_table(self) -> Result<Table> {
        match self {
            Formatted::Table(t) => Ok(t),
            Formatted::Json(v) => Ok(Table::from_json(&v)),
            Formatted::Raw(r) => Ok(Table::from_json(&r.json()?)),
        }
    }

    pub fn into_raw(self) -> Result<RawResponse> {
        match self {
            Formatted::Raw(r) => Ok(r),
            _ => Err(anyhow!("response was not requested raw")),
        }
    }
}

/// An in-memory file sent as one multipart field.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl FilePart {
    fn to_part(&self) -> std::result::Result<Part, reqwest::Error> {
        Part::bytes(self.bytes.clone())
            .file_name(self.file_name.clone())
            .mime_str(&self.mime)
    }
}

/// HTTP plumbing shared by every resource client: endpoint resolution, the
/// authentication-redirect check and response formatting.
#[derive(Debug)]
pub struct BaseClient {
    session: Session,
    api_url: Url,
    ui_url: Option<String>,
    settings: Settings,
}

impl BaseClient {
    pub fn new(opts: ClientOptions) -> Result<Self> {
        Self::from_resolved(load_config(opts)?)
    }

    pub(crate) fn from_resolved(cfg: ResolvedConfig) -> Result<Self> {
        let (api_url, ui_url) = normalize_api_url(
            cfg.settings.base_gateway_api_url.as_deref(),
            cfg.settings.base_studio_ui_url.as_deref(),
        );
        let api_url = api_url.ok_or_else(|| {
            StudioError::config("Missing configuration: set BASE_GATEWAY_API_URL or BASE_STUDIO_UI_URL")
        })?;
        let api_url = Url::parse(&api_url)
            .map_err(|e| StudioError::config(format!("invalid API url {}: {}", api_url, e)))?;
        let session = Session::new(&cfg.credentials, &cfg.settings)?;

        Ok(Self {
            session,
            api_url,
            ui_url,
            settings: cfg.settings,
        })
    }

    /// Normalised gateway URL, always ending in `/`.
    pub fn api_url(&self) -> &str {
        self.api_url.as_str()
    }

    pub fn api_version(&self) -> &str {
        &self.settings.api_version
    }

    /// Normalised studio UI URL, when one was configured.
    pub fn ui_url(&self) -> Option<&str> {
        self.ui_url.as_deref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Resolves `endpoint` against the API URL; absolute URLs pass through.
    pub fn endpoint(&self, endpoint: &str) -> Result<Url> {
        self.api_url
            .join(endpoint)
            .with_context(|| format!("invalid endpoint {}", endpoint))
    }

    pub fn http_get(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        output: Output,
        data_field: Option<&str>,
    ) -> Result<Formatted> {
        let mut url = self.endpoint(endpoint)?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }
        let resp = self.send_json(Method::GET, url, None)?;
        formatted_output(resp, output, data_field)
    }

    pub fn http_post(
        &self,
        endpoint: &str,
        data: &Value,
        output: Output,
        data_field: Option<&str>,
    ) -> Result<Formatted> {
        let resp = self.send_json(Method::POST, self.endpoint(endpoint)?, Some(data))?;
        formatted_output(resp, output, data_field)
    }

    /// Multipart POST of plain `fields` and `files`.
    pub fn http_post_files(
        &self,
        endpoint: &str,
        fields: &[(&str, String)],
        files: &[FilePart],
        output: Output,
        data_field: Option<&str>,
    ) -> Result<Formatted> {
        let url = self.endpoint(endpoint)?;
        let resp = self.session.without_content_type(|| {
            self.session.send(|http, headers| {
                let mut form = Form::new();
                for (k, v) in fields {
                    form = form.text(k.to_string(), v.clone());
                }
                for f in files {
                    form = form.part(f.field.clone(), f.to_part()?);
                }
                http.post(url.clone()).headers(headers).multipart(form).send()
            })
        })?;
        formatted_output(resp, output, data_field)
    }

    pub fn http_put(
        &self,
        endpoint: &str,
        data: &Value,
        output: Output,
        data_field: Option<&str>,
    ) -> Result<Formatted> {
        let resp = self.send_json(Method::PUT, self.endpoint(endpoint)?, Some(data))?;
        formatted_output(resp, output, data_field)
    }

    /// Uploads `file_path` as the multipart field `file` with a PUT.
    pub fn http_put_file(
        &self,
        endpoint: &str,
        file_path: &Path,
        output: Output,
        data_field: Option<&str>,
    ) -> Result<Formatted> {
        let url = self.endpoint(endpoint)?;
        let part = FilePart {
            field: "file".into(),
            file_name: file_path.display().to_string(),
            mime: "application/x-yaml".into(),
            bytes: std::fs::read(file_path)
                .with_context(|| format!("failed to read {}", file_path.display()))?,
        };
        let resp = self.session.without_content_type(|| {
            self.session.send(|http, headers| {
                let form = Form::new().part(part.field.clone(), part.to_part()?);
                http.put(url.clone()).headers(headers).multipart(form).send()
            })
        })?;
        formatted_output(resp, output, data_field)
    }

    pub fn http_patch(
        &self,
        endpoint: &str,
        data: &Value,
        output: Output,
        data_field: Option<&str>,
    ) -> Result<Formatted> {
        let resp = self.send_json(Method::PATCH, self.endpoint(endpoint)?, Some(data))?;
        formatted_output(resp, output, data_field)
    }

    pub fn http_delete(
        &self,
        endpoint: &str,
        output: Output,
        data_field: Option<&str>,
    ) -> Result<Formatted> {
        let resp = self.send_json(Method::DELETE, self.endpoint(endpoint)?, None)?;
        formatted_output(resp, output, data_field)
    }

    fn send_json(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Response> {
        log::debug!("{} {}", method, url);
        let body = body.map(serde_json::to_vec).transpose()?;
        self.session.send(|http, headers| {
            let mut req = http.request(method.clone(), url.clone()).headers(headers);
            if let Some(b) = &body {
                req = req.body(b.clone());
            }
            req.send()
        })
    }
}

/// Reads the response body, checks for the login redirect, then renders it.
pub(crate) fn formatted_output(
    resp: Response,
    output: Output,
    data_field: Option<&str>,
) -> Result<Formatted> {
    let status = resp.status();
    let url = resp.url().to_string();
    let body = resp.bytes().context("failed to read response body")?.to_vec();
    render(RawResponse { status, url, body }, output, data_field)
}

pub(crate) fn render(raw: RawResponse, output: Output, data_field: Option<&str>) -> Result<Formatted> {
    let parsed = serde_json::from_slice::<Value>(&raw.body).ok();
    check_auth_error(parsed.is_some(), &raw.url)?;

    if output == Output::Raw {
        return Ok(Formatted::Raw(raw));
    }

    let Some(body) = parsed else {
        return Ok(Formatted::Json(json!({ "reason": raw.text() })));
    };

    match output {
        Output::Json => Ok(Formatted::Json(body)),
        _ => {
            let data = data_field
                .and_then(|f| body.get(f))
                .filter(|v| is_truthy(v))
                .unwrap_or(&body);
            Ok(Formatted::Table(Table::from_json(data)))
        }
    }
}

fn check_auth_error(is_json: bool, url: &str) -> Result<()> {
    if !is_json && url.contains(ISV_LOGIN_STRING) {
        return Err(StudioError::Unauthorized.into());
    }
    Ok(())
}

pub(crate) fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn raw(status: u16, url: &str, body: &str) -> RawResponse {
        RawResponse {
            status: StatusCode::from_u16(status).unwrap(),
            url: url.into(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn client(gateway: &str) -> BaseClient {
        let settings = Settings {
            base_gateway_api_url: Some(gateway.into()),
            ..Settings::default()
        };
        BaseClient::from_resolved(ResolvedConfig {
            settings,
            credentials: Credentials::ApiKey("k".into()),
        })
        .unwrap()
    }

    #[test]
    fn output_parses_known_formats_only() {
        assert_eq!("df".parse::<Output>().unwrap(), Output::DataFrame);
        let err = "csv".parse::<Output>().unwrap_err();
        assert!(err.to_string().contains("Valid Options"));
    }

    #[test]
    fn login_redirect_with_html_is_unauthorized() {
        let r = raw(200, "https://login.ibm.com/oidc/sps/authorize?x=1", "<html>login</html>");
        let err = render(r, Output::Json, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<StudioError>(), Some(StudioError::Unauthorized)));
    }

    #[test]
    fn html_elsewhere_becomes_reason() {
        let r = raw(502, "https://gw.example.com/v2/models", "Bad gateway");
        let v = render(r, Output::Json, None).unwrap().into_json().unwrap();
        assert_eq!(v, json!({"reason": "Bad gateway"}));
    }

    #[test]
    fn json_output_keeps_the_envelope() {
        let r = raw(200, "https://gw/x", r#"{"results":[{"id":1}],"total_records":1}"#);
        let v = render(r, Output::Json, Some("results")).unwrap().into_json().unwrap();
        assert_eq!(v["total_records"], 1);
    }

    #[test]
    fn table_output_uses_data_field() {
        let r = raw(200, "https://gw/x", r#"{"results":[{"id":1},{"id":2}],"total_records":2}"#);
        let t = render(r, Output::DataFrame, Some("results")).unwrap().into_table().unwrap();
        assert_eq!(t.columns, vec!["id"]);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn table_output_falls_back_to_body_when_field_empty() {
        let r = raw(200, "https://gw/x", r#"{"results":[],"total_records":0}"#);
        let t = render(r, Output::DataFrame, Some("results")).unwrap().into_table().unwrap();
        assert_eq!(t.len(), 1);
        assert!(t.columns.contains(&"total_records".to_string()));
    }

    #[test]
    fn error_bodies_are_returned_not_raised() {
        let r = raw(422, "https://gw/x", r#"{"detail":"bad"}"#);
        let v = render(r, Output::Json, None).unwrap().into_json().unwrap();
        assert_eq!(v["detail"], "bad");
    }

    #[test]
    fn endpoints_join_under_the_gateway() {
        let c = client("https://studio.example.com/studio-gateway/v2");
        assert_eq!(c.api_url(), "https://studio.example.com/studio-gateway/");
        assert_eq!(
            c.endpoint("v2/models").unwrap().as_str(),
            "https://studio.example.com/studio-gateway/v2/models"
        );
        assert_eq!(
            c.endpoint("https://studio.example.com/mlflow/x").unwrap().as_str(),
            "https://studio.example.com/mlflow/x"
        );
    }

    #[test]
    fn missing_urls_are_a_config_error() {
        let err = BaseClient::from_resolved(ResolvedConfig {
            settings: Settings::default(),
            credentials: Credentials::ApiKey("k".into()),
        })
        .unwrap_err();
        assert!(matches!(err.downcast_ref::<StudioError>(), Some(StudioError::Config(_))));
    }
}
