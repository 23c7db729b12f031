use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StudioError;

const UI_REVERSE_PROXY_FOR_APIS: &str = "/studio-gateway";
const CONFIG_FILE_NAME: &str = ".geostudio_config_file";

/// OIDC endpoints of the identity provider fronting the gateway.
#[derive(Debug, Clone)]
pub struct IsvSettings {
    pub well_known_url: String,
    pub issuer: String,
    pub token_endpoint: String,
    pub revoke_endpoint: String,
    pub userinfo_endpoint: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Default for IsvSettings {
    fn default() -> Self {
        Self {
            well_known_url: "https://geostudio.verify.ibm.com/oidc/endpoint/default/.well-known/openid-configuration".into(),
            issuer: "https://geostudio.verify.ibm.com/oidc/endpoint/default".into(),
            token_endpoint: "https://geostudio.verify.ibm.com/v1.0/endpoint/default/token".into(),
            revoke_endpoint: "https://geostudio.verify.ibm.com/v1.0/endpoint/default/revoke".into(),
            userinfo_endpoint: "https://geostudio.verify.ibm.com/v1.0/endpoint/default/userinfo".into(),
            client_id: None,
            client_secret: None,
        }
    }
}

/// Defaults filled into data-advisor queries that leave them unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataAdvisorDefaults {
    pub pre_days: i64,
    pub post_days: i64,
    pub maxcc: f64,
}

impl Default for DataAdvisorDefaults {
    fn default() -> Self {
        Self {
            pre_days: 3,
            post_days: 3,
            maxcc: 90.0,
        }
    }
}

/// Everything a [`crate::Client`] needs besides credentials.
///
/// Built once and handed to the client; nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_studio_ui_url: Option<String>,
    pub base_gateway_api_url: Option<String>,
    /// Path prefix of every endpoint, `v2` unless overridden.
    pub api_version: String,
    pub api_token: Option<String>,
    pub api_key: Option<String>,
    pub isv: IsvSettings,
    pub data_advisor: DataAdvisorDefaults,
    /// Whether to verify TLS certificates.
    pub verify: bool,
    pub timeout: Duration,
    /// Transport retries on 502/503/504. Zero disables them.
    pub max_retry: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_studio_ui_url: None,
            base_gateway_api_url: None,
            api_version: "v2".into(),
            api_token: None,
            api_key: None,
            isv: IsvSettings::default(),
            data_advisor: DataAdvisorDefaults::default(),
            verify: true,
            timeout: Duration::from_secs(900),
            max_retry: 0,
        }
    }
}

impl Settings {
    /// Reads settings from the process environment after loading a `.env` file, if any.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    pub(crate) fn from_vars(vars: &HashMap<String, String>) -> Self {
        let get = |k: &str| vars.get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut s = Settings::default();

        s.base_studio_ui_url = get("BASE_STUDIO_UI_URL");
        s.base_gateway_api_url = get("BASE_GATEWAY_API_URL");
        if let Some(v) = get("GATEWAY_API_VERSION") {
            s.api_version = v;
        }
        s.api_token = get("GEOFM_API_TOKEN");
        s.api_key = get("GEOSTUDIO_API_KEY");
        s.isv.client_id = get("ISV_CLIENT_ID");
        s.isv.client_secret = get("ISV_CLIENT_SECRET");

        if let Some(days) = get("DATA_ADVISOR_PRE_DAYS").and_then(|v| v.parse().ok()) {
            // Post days follow the pre-days variable; there is no separate knob.
            s.data_advisor.pre_days = days;
            s.data_advisor.post_days = days;
        }
        if let Some(maxcc) = get("DATA_ADVISOR_MAXCC").and_then(|v| v.parse().ok()) {
            s.data_advisor.maxcc = maxcc;
        }
        if let Some(v) = get("GEOSTUDIO_VERIFY") {
            s.verify = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        s
    }
}

/// How requests authenticate against the gateway.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Sent as `X-API-Key`.
    ApiKey(String),
    /// Sent as `Authorization: Bearer`.
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("ApiKey(***)"),
            Credentials::Token(_) => f.write_str("Token(***)"),
        }
    }
}

/// Construction options for [`crate::Client`]. The first credential source set wins.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub api_token: Option<String>,
    pub api_key: Option<String>,
    /// File whose first line is an API key.
    pub api_key_file: Option<PathBuf>,
    /// Key-value file providing `GEOSTUDIO_API_KEY`, `BASE_GATEWAY_API_URL`, `BASE_STUDIO_UI_URL`.
    pub geostudio_config_file: Option<PathBuf>,
    /// Defaults to [`Settings::from_env`].
    pub settings: Option<Settings>,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub(crate) settings: Settings,
    pub(crate) credentials: Credentials,
}

/// Resolves credentials using (in order of precedence):
/// - explicit token, key, key file or config file in `opts`
/// - `GEOFM_API_TOKEN` / `GEOSTUDIO_API_KEY` from the settings
/// - a config file from `GEOSTUDIO_CONFIG_FILE`, `./.geostudio_config_file` or `~/.geostudio_config_file`
pub(crate) fn load_config(opts: ClientOptions) -> Result<ResolvedConfig> {
    resolve_config(opts, config_candidates())
}

fn resolve_config(opts: ClientOptions, candidates: Vec<PathBuf>) -> Result<ResolvedConfig> {
    let mut settings = opts.settings.unwrap_or_else(Settings::from_env);

    let credentials = if let Some(token) = opts.api_token {
        log::info!("Using api_token");
        Credentials::Token(token)
    } else if let Some(key) = opts.api_key {
        log::info!("Using api_key from sdk command");
        Credentials::ApiKey(key)
    } else if let Some(path) = opts.api_key_file {
        if !path.is_file() {
            return Err(StudioError::config(
                "Config file does not exist, Please provide a valid config file.",
            )
            .into());
        }
        log::info!("Using api_key from file");
        Credentials::ApiKey(read_key_file(&path)?)
    } else if let Some(path) = opts.geostudio_config_file {
        if !path.is_file() {
            return Err(StudioError::config(
                "Config file does not exist, Please provide a valid config file.",
            )
            .into());
        }
        log::info!("Using api key and base urls from geostudio config file");
        apply_config_file(&path, &mut settings)?
    } else if let Some(token) = settings.api_token.clone() {
        Credentials::Token(token)
    } else if let Some(key) = settings.api_key.clone() {
        Credentials::ApiKey(key)
    } else if let Some(path) = candidates.into_iter().find(|p| p.is_file()) {
        log::info!("Using api key and base urls from {}", path.display());
        apply_config_file(&path, &mut settings)?
    } else {
        return Err(
            StudioError::config("Missing APIToken. Add `GEOFM_API_TOKEN` to env variables.").into(),
        );
    };

    Ok(ResolvedConfig {
        settings,
        credentials,
    })
}

fn read_key_file(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read API key file {}", path.display()))?;
    let key = text.lines().next().unwrap_or_default().trim_end().to_string();
    if key.is_empty() {
        return Err(StudioError::config(format!("API key file {} is empty", path.display())).into());
    }
    Ok(key)
}

fn apply_config_file(path: &Path, settings: &mut Settings) -> Result<Credentials> {
    let values = read_config_file(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let get = |k: &str| values.get(k).cloned().filter(|v| !v.is_empty());

    settings.base_gateway_api_url = get("BASE_GATEWAY_API_URL");
    settings.base_studio_ui_url = get("BASE_STUDIO_UI_URL");
    let key = get("GEOSTUDIO_API_KEY").ok_or_else(|| {
        StudioError::config(format!(
            "Missing configuration: GEOSTUDIO_API_KEY in {}",
            path.display()
        ))
    })?;
    settings.api_key = Some(key.clone());
    Ok(Credentials::ApiKey(key))
}

pub(crate) fn read_config_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut values = HashMap::new();
    for item in dotenv::from_path_iter(path)? {
        let (k, v) = item?;
        values.insert(k, v);
    }
    Ok(values)
}

fn config_candidates() -> Vec<PathBuf> {
    if let Ok(p) = std::env::var("GEOSTUDIO_CONFIG_FILE") {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(CONFIG_FILE_NAME));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(CONFIG_FILE_NAME));
    }
    v
}

/// Computes the gateway base URL (always ending in `/`) and the normalised UI URL.
///
/// The gateway URL wins when set: it is clipped right after a `/studio-gateway`
/// segment, or to `scheme://host/` otherwise. A UI URL alone is clipped to
/// `scheme://host/` and the gateway is derived as `<ui>studio-gateway/`.
pub fn normalize_api_url(
    gateway: Option<&str>,
    ui: Option<&str>,
) -> (Option<String>, Option<String>) {
    let gateway = gateway.filter(|s| !s.trim().is_empty());
    let ui = ui.filter(|s| !s.trim().is_empty());
    let ui_norm = ui.map(|u| format!("{}/", host_prefix(u).trim_end_matches('/')));

    if let Some(gw) = gateway {
        let temp = format!("{}/", gw.trim_end_matches('/'));
        let api = match temp.find(UI_REVERSE_PROXY_FOR_APIS) {
            Some(idx) => format!("{}/", &temp[..idx + UI_REVERSE_PROXY_FOR_APIS.len()]),
            None => format!("{}/", host_prefix(&temp).trim_end_matches('/')),
        };
        return (Some(api), ui_norm);
    }

    match ui_norm {
        Some(u) => {
            let api = format!("{}{}/", u.trim_end_matches('/'), UI_REVERSE_PROXY_FOR_APIS);
            (Some(api), Some(u))
        }
        None => (None, None),
    }
}

// `scheme://host` when the URL has a `//`, else everything up to the first `/`.
fn host_prefix(url: &str) -> &str {
    let skip = url.chars().next().map_or(0, char::len_utf8);
    if let Some(i) = url.get(skip..).and_then(|rest| rest.find("//")) {
        let start = skip + i + 2;
        let end = url[start..].find('/').map(|j| start + j).unwrap_or(url.len());
        return &url[..end];
    }
    match url.find('/') {
        Some(0) | None => url,
        Some(idx) => &url[..idx],
    }
}

/// Endpoints used by the map plugin.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Inference collection endpoint, e.g. `https://host/studio-gateway/v2/inference/`.
    pub base_url: String,
    /// Gateway root used for models and tasks.
    pub inference_url: String,
    pub geoserver_url: String,
    pub verify_tls: bool,
    pub timeout: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gfm.res.ibm.com/studio-gateway/v2/inference/".into(),
            inference_url: "https://gfm.res.ibm.com/studio-gateway".into(),
            geoserver_url: "https://gfm.res.ibm.com/geofm-geoserver/geoserver/".into(),
            verify_tls: true,
            timeout: Duration::from_secs(30),
        }
    }
}

impl PluginConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("GEO_INFERENCE_BASE_URL") {
            cfg.base_url = v;
        }
        if let Ok(v) = std::env::var("GEO_INFERENCE_URL") {
            cfg.inference_url = v;
        }
        if let Ok(v) = std::env::var("GEOSERVER_URL") {
            cfg.geoserver_url = v;
        }
        if let Ok(v) = std::env::var("GEO_INFERENCE_VERIFY_TLS") {
            cfg.verify_tls = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        cfg
    }
}
