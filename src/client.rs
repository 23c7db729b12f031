use anyhow::Result;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::config::{ClientOptions, load_config};
use crate::http::{BaseClient, Formatted, Output};
use crate::inference::InferenceClient;
use crate::tune::TuneClient;

/// Entry point to the studio gateway.
///
/// Resource operations live on the two sub-clients, which share one
/// authenticated session:
///
/// ```no_run
/// use anyhow::Result;
/// use geostudio::{Client, Output};
///
/// fn main() -> Result<()> {
///     let client = Client::from_env()?;
///     let models = client.inference.list_models(Output::Json)?.into_json()?;
///     let tunes = client.tune.list_tunes(Output::DataFrame)?.into_table()?;
///     println!("{} models, {} tunes", models["results"].as_array().map_or(0, Vec::len), tunes.len());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    base: Arc<BaseClient>,
    pub inference: InferenceClient,
    pub tune: TuneClient,
}

impl Client {
    /// Creates a client from the environment and the default config file locations.
    ///
    /// This is equivalent to `Client::new(ClientOptions::default())`.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientOptions::default())
    }

    /// Creates a client using (in order of precedence):
    /// - an explicit token, API key, API key file or config file in `opts`
    /// - `GEOFM_API_TOKEN` / `GEOSTUDIO_API_KEY` from the settings
    /// - a config file from `GEOSTUDIO_CONFIG_FILE`, `./.geostudio_config_file` or
    ///   `~/.geostudio_config_file`
    pub fn new(opts: ClientOptions) -> Result<Self> {
        let base = Arc::new(BaseClient::from_resolved(load_config(opts)?)?);
        Ok(Self {
            inference: InferenceClient::new(Arc::clone(&base)),
            tune: TuneClient::new(Arc::clone(&base)),
            base,
        })
    }

    /// The shared transport, for endpoints without a typed wrapper.
    pub fn base(&self) -> &BaseClient {
        &self.base
    }

    fn path(&self, suffix: &str) -> String {
        format!("{}/{}", self.base.api_version(), suffix)
    }

    // ---- API keys

    pub fn list_apikeys(&self, output: Output) -> Result<Formatted> {
        self.base
            .http_get(&self.path("auth/api-keys"), &[], output, Some("results"))
    }

    /// Creates an API key. The gateway allows two keys per user.
    pub fn create_apikey(&self, data: Option<&Value>, output: Output) -> Result<Formatted> {
        let empty = json!({});
        self.base.http_post(
            &self.path("auth/api-keys"),
            data.unwrap_or(&empty),
            output,
            Some("results"),
        )
    }

    pub fn activate_apikey(&self, apikey_id: &str, active: bool, output: Output) -> Result<Formatted> {
        let mut url = self.base.endpoint(&self.path("auth/api-keys"))?;
        url.query_pairs_mut().append_pair("apikey_id", apikey_id);
        self.base
            .http_patch(url.as_str(), &json!({ "active": active }), output, Some("results"))
    }

    pub fn delete_apikey(&self, apikey_id: &str, output: Output) -> Result<Formatted> {
        let mut url = self.base.endpoint(&self.path("auth/api-keys"))?;
        url.query_pairs_mut().append_pair("apikey_id", apikey_id);
        self.base.http_delete(url.as_str(), output, Some("results"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::StudioError;

    fn settings() -> Settings {
        Settings {
            base_gateway_api_url: Some("https://studio.example.com/studio-gateway/v2".into()),
            base_studio_ui_url: Some("https://studio.example.com/".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn sub_clients_share_one_transport() {
        let client = Client::new(ClientOptions {
            api_key: Some("pak-1".into()),
            settings: Some(settings()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(Arc::strong_count(&client.base), 3);
        assert_eq!(client.base().api_url(), "https://studio.example.com/studio-gateway/");
        assert_eq!(
            client.inference.get_geoserver_url().unwrap(),
            "https://studio.example.com/geofm-geoserver"
        );
    }

    #[test]
    fn missing_config_file_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let err = Client::new(ClientOptions {
            geostudio_config_file: Some(dir.path().join("absent_config_file")),
            settings: Some(settings()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StudioError>(),
            Some(StudioError::Config(m)) if m.contains("Config file does not exist")
        ));
    }
}
