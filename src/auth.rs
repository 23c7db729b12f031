use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use std::io::BufRead;
use std::sync::OnceLock;
use url::Url;

use crate::config::IsvSettings;
use crate::error::StudioError;

const LOCAL_REDIRECT_URI: &str = "http://localhost:3000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrantType {
    /// Interactive: the user pastes the code from the redirect URL.
    #[default]
    AuthorizationCode,
    /// Machine-to-machine with the client id and secret.
    ClientCredentials,
}

impl GrantType {
    fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::ClientCredentials => "client_credentials",
        }
    }
}

/// Token acquisition against the identity provider fronting the gateway.
#[derive(Debug)]
pub struct IsvAuth {
    http: HttpClient,
    settings: IsvSettings,
    grant_type: GrantType,
    discovery: OnceLock<Value>,
}

impl IsvAuth {
    pub fn new(settings: IsvSettings, grant_type: GrantType) -> Result<Self> {
        let http = HttpClient::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            settings,
            grant_type,
            discovery: OnceLock::new(),
        })
    }

    /// Uses `doc` as the discovery document instead of fetching it.
    pub fn with_discovery(self, doc: Value) -> Self {
        let _ = self.discovery.set(doc);
        self
    }

    /// The provider's OpenID configuration, fetched on first use.
    pub fn discovery(&self) -> Result<&Value> {
        if let Some(doc) = self.discovery.get() {
            return Ok(doc);
        }
        let doc: Value = self
            .http
            .get(&self.settings.well_known_url)
            .send()
            .context("failed to fetch OpenID configuration")?
            .error_for_status()?
            .json()?;
        let _ = self.discovery.set(doc);
        self.discovery
            .get()
            .ok_or_else(|| anyhow!("OpenID configuration unavailable"))
    }

    fn discovered(&self, key: &str) -> Result<String> {
        self.discovery()?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("OpenID configuration has no {}", key))
    }

    fn client_id(&self) -> Result<&str> {
        self.settings
            .client_id
            .as_deref()
            .ok_or_else(|| StudioError::config("Missing configuration: ISV_CLIENT_ID").into())
    }

    pub fn authorization_url(&self, redirect_uri: &str) -> Result<String> {
        let mut url = Url::parse(&self.discovered("authorization_endpoint")?)
            .context("invalid authorization endpoint")?;
        url.query_pairs_mut()
            .append_pair("client_id", self.client_id()?)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", "openid");
        Ok(url.into())
    }

    /// Pulls the code out of a pasted redirect URL (`...?code=abc&state=x`);
    /// input without `=` is taken as the code itself.
    pub fn extract_code(input: &str) -> String {
        let input = input.trim();
        match input.split_once('=') {
            Some((_, rest)) => rest.split(['=', '&']).next().unwrap_or_default().to_string(),
            None => input.to_string(),
        }
    }

    pub fn exchange_code_for_token(&self, code: &str, redirect_uri: &str) -> Result<String> {
        let token_endpoint = self.discovered("token_endpoint")?;
        let params = [
            ("grant_type", self.grant_type.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id()?),
            ("client_secret", self.settings.client_secret.as_deref().unwrap_or_default()),
        ];
        let body: Value = self
            .http
            .post(token_endpoint)
            .form(&params)
            .send()
            .context("token request failed")?
            .error_for_status()?
            .json()?;
        token_field(&body, "access_token")
    }

    /// Client-credentials grant; returns the `id_token`.
    pub fn client_credentials_token(&self) -> Result<String> {
        let secret = self
            .settings
            .client_secret
            .as_deref()
            .ok_or_else(|| StudioError::config("Missing configuration: ISV_CLIENT_SECRET"))?;
        let params = [
            ("grant_type", GrantType::ClientCredentials.as_str()),
            ("client_id", self.client_id()?),
            ("client_secret", secret),
            ("scope", "openid"),
        ];
        let body: Value = self
            .http
            .post(&self.settings.token_endpoint)
            .form(&params)
            .send()
            .context("token request failed")?
            .error_for_status()?
            .json()?;
        token_field(&body, "id_token")
    }

    pub fn get_user_info(&self, access_token: &str) -> Result<Value> {
        let info = self
            .http
            .get(&self.settings.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .context("userinfo request failed")?
            .error_for_status()?
            .json()?;
        Ok(info)
    }

    /// Obtains a token with the configured grant. The authorization-code flow prints
    /// the login URL and reads the pasted redirect URL (or bare code) from `input`.
    pub fn authenticate<R: BufRead>(&self, mut input: R) -> Result<String> {
        match self.grant_type {
            GrantType::ClientCredentials => {
                let token = self.client_credentials_token()?;
                log::info!("Using `client_credentials` grant_type for Auth");
                Ok(token)
            }
            GrantType::AuthorizationCode => {
                let url = self.authorization_url(LOCAL_REDIRECT_URI)?;
                eprintln!("Click and obtain the code from the url -> {}", url);
                eprint!("Code > ");
                let mut line = String::new();
                input.read_line(&mut line).context("failed to read code")?;
                let code = Self::extract_code(&line);
                let token = self.exchange_code_for_token(&code, LOCAL_REDIRECT_URI)?;
                log::info!("Using `authorization_code` grant_type for Auth");
                Ok(token)
            }
        }
    }
}

fn token_field(body: &Value, key: &str) -> Result<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("token response has no {}", key))
}
