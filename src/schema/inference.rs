use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;
use uuid::Uuid;

use super::{Validate, check_len, validate_display_name};
use crate::config::DataAdvisorDefaults;
use crate::error::StudioError;

// ---- Models

/// Locations of the artefacts a fine-tuned model is deployed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOnboardingInput {
    #[serde(default)]
    pub fine_tuned_model_id: Option<String>,
    /// Presigned URL of the model config file.
    #[serde(default)]
    pub model_configs_url: Option<String>,
    /// Presigned URL of the model checkpoint.
    #[serde(default)]
    pub model_checkpoint_url: Option<String>,
}

impl Validate for ModelOnboardingInput {
    fn validate(self) -> Result<Self, StudioError> {
        if let Some(id) = &self.fine_tuned_model_id {
            check_len("fine_tuned_model_id", id, 0, 100)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdateInput {
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub model_url: Option<Url>,
    #[serde(default)]
    pub pipeline_steps: Option<Vec<Value>>,
    #[serde(default)]
    pub geoserver_push: Option<Vec<Value>>,
    #[serde(default)]
    pub model_input_data_spec: Option<Vec<Value>>,
    #[serde(default)]
    pub postprocessing_options: Option<Value>,
    #[serde(default = "some_false")]
    pub sharable: Option<bool>,
    #[serde(default)]
    pub model_onboarding_config: Option<ModelOnboardingInput>,
    #[serde(default)]
    pub latest: Option<bool>,
}

fn some_false() -> Option<bool> {
    Some(false)
}

impl ModelUpdateInput {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            sharable: Some(false),
            ..Default::default()
        }
    }
}

impl Validate for ModelUpdateInput {
    fn validate(mut self) -> Result<Self, StudioError> {
        validate_display_name(&self.display_name)?;
        if let Some(u) = &self.model_url {
            if !matches!(u.scheme(), "http" | "https") {
                return Err(StudioError::validation(format!(
                    "model_url must be an http(s) URL, got {}",
                    u
                )));
            }
        }
        self.model_onboarding_config = self
            .model_onboarding_config
            .map(Validate::validate)
            .transpose()?;
        Ok(self)
    }
}

/// A model registration; the update fields plus a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCreateInput {
    #[serde(flatten)]
    pub model: ModelUpdateInput,
    #[serde(default = "default_version")]
    pub version: Option<f64>,
}

fn default_version() -> Option<f64> {
    Some(1.0)
}

impl ModelCreateInput {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            model: ModelUpdateInput::new(display_name),
            version: default_version(),
        }
    }
}

impl Validate for ModelCreateInput {
    fn validate(mut self) -> Result<Self, StudioError> {
        self.model = self.model.validate()?;
        Ok(self)
    }
}

// ---- Inference

/// Where an inference runs. At least one member must be non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialDomain {
    /// `[[west, south, east, north], ...]`
    #[serde(default)]
    pub bbox: Vec<Vec<f64>>,
    #[serde(default)]
    pub polygons: Vec<Value>,
    #[serde(default)]
    pub tiles: Vec<Value>,
    #[serde(default)]
    pub urls: Vec<Value>,
}

impl SpatialDomain {
    pub fn from_bbox(bbox: [f64; 4]) -> Self {
        Self {
            bbox: vec![bbox.to_vec()],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bbox.is_empty() && self.polygons.is_empty() && self.tiles.is_empty() && self.urls.is_empty()
    }
}

impl Validate for SpatialDomain {
    fn validate(self) -> Result<Self, StudioError> {
        if self.is_empty() {
            return Err(StudioError::validation(
                "At least one of 'bbox', 'polygons', 'tiles', or 'urls' must be provided.",
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(default)]
    pub connector: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub bands: Option<Vec<Value>>,
    #[serde(default)]
    pub scaling_factor: Option<Vec<f64>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Validate for DataSource {
    /// Older payloads name the collection `collection_name`.
    fn validate(mut self) -> Result<Self, StudioError> {
        if self.collection.is_none() {
            if let Some(Value::String(name)) = self.extra.get("collection_name") {
                self.collection = Some(name.clone());
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoServerPush {
    pub workspace: String,
    pub layer_name: String,
    pub display_name: String,
    pub filepath_key: String,
    pub file_suffix: String,
    /// Style name or inline style document.
    pub geoserver_style: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Validate for GeoServerPush {
    fn validate(self) -> Result<Self, StudioError> {
        if !matches!(self.geoserver_style, Value::String(_) | Value::Object(_)) {
            return Err(StudioError::validation(
                "geoserver_style must be a style name or a style object",
            ));
        }
        Ok(self)
    }
}

/// Masking options of an inference run. Each accepts a flag, a name or an object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcessing {
    #[serde(default)]
    pub cloud_masking: Option<Value>,
    #[serde(default)]
    pub ocean_masking: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub spatial_domain: SpatialDomain,
    #[serde(default)]
    pub temporal_domain: Option<Vec<String>>,
    #[serde(default)]
    pub model_input_data_spec: Option<Vec<Value>>,
    #[serde(default)]
    pub data_connector_config: Option<Vec<DataSource>>,
    #[serde(default)]
    pub geoserver_push: Option<Vec<GeoServerPush>>,
    #[serde(default)]
    pub pipeline_steps: Option<Vec<Value>>,
    #[serde(default)]
    pub post_processing: Option<PostProcessing>,
    #[serde(default)]
    pub fine_tuning_id: Option<String>,
}

impl Validate for InferenceConfig {
    fn validate(mut self) -> Result<Self, StudioError> {
        self.spatial_domain = self.spatial_domain.validate()?;
        self.data_connector_config = validate_all(self.data_connector_config)?;
        self.geoserver_push = validate_all(self.geoserver_push)?;
        Ok(self)
    }
}

pub(crate) fn validate_all<T: Validate>(items: Option<Vec<T>>) -> Result<Option<Vec<T>>, StudioError> {
    items
        .map(|v| v.into_iter().map(Validate::validate).collect())
        .transpose()
}

/// A full inference submission. Needs `model_id` or `model_display_name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceCreateInput {
    #[serde(flatten)]
    pub config: InferenceConfig,
    #[serde(default)]
    pub model_display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub geoserver_layers: Option<Value>,
    #[serde(default)]
    pub demo: Option<Value>,
    #[serde(default)]
    pub model_id: Option<Uuid>,
    #[serde(default)]
    pub inference_output: Option<Value>,
}

impl Validate for InferenceCreateInput {
    fn validate(mut self) -> Result<Self, StudioError> {
        self.config = self.config.validate()?;
        let has_name = self.model_display_name.as_deref().is_some_and(|s| !s.is_empty());
        if self.model_id.is_none() && !has_name {
            return Err(StudioError::validation(
                "At least one of 'model_id' or 'model_display_name' must be provided.",
            ));
        }
        Ok(self)
    }
}

// ---- Data advisory

/// Data-availability query; unset tuning knobs take the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataAdvisorIn {
    #[serde(default)]
    pub collections: Option<Vec<String>>,
    #[serde(default)]
    pub dates: Option<Vec<String>>,
    #[serde(default)]
    pub bbox: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub area_polygon: Option<String>,
    #[serde(default)]
    pub maxcc: Option<f64>,
    #[serde(default)]
    pub pre_days: Option<i64>,
    #[serde(default)]
    pub post_days: Option<i64>,
}

impl DataAdvisorIn {
    pub fn with_defaults(mut self, defaults: &DataAdvisorDefaults) -> Self {
        self.maxcc.get_or_insert(defaults.maxcc);
        self.pre_days.get_or_insert(defaults.pre_days);
        self.post_days.get_or_insert(defaults.post_days);
        self
    }
}

impl Validate for DataAdvisorIn {
    fn validate(self) -> Result<Self, StudioError> {
        if let Some(boxes) = &self.bbox {
            if boxes.iter().any(|b| b.len() != 4) {
                return Err(StudioError::validation(
                    "bbox entries must be [west, south, east, north]",
                ));
            }
        }
        Ok(self)
    }
}
