use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use super::inference::validate_all;
use super::{Validate, check_len, clean_name};
use crate::error::StudioError;
use crate::schema::{DataSource, GeoServerPush, SpatialDomain};

// ---- Tunes

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuneUpdateIn {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object")]
    pub train_options: Option<Value>,
}

fn empty_object() -> Option<Value> {
    Some(json!({}))
}

impl Validate for TuneUpdateIn {
    fn validate(self) -> Result<Self, StudioError> {
        Ok(self)
    }
}

/// Fields every tune submission carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuneSubmitBase {
    /// 4 to 30 characters; spaces and underscores become hyphens.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub dataset_id: String,
}

impl Validate for TuneSubmitBase {
    fn validate(mut self) -> Result<Self, StudioError> {
        check_len("name", &self.name, 4, 30)?;
        self.name = clean_name(&self.name)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneSubmitIn {
    #[serde(flatten)]
    pub base: TuneSubmitBase,
    #[serde(default)]
    pub base_model_id: Option<Uuid>,
    pub tune_template_id: Uuid,
    #[serde(default = "empty_object")]
    pub model_parameters: Option<Value>,
    #[serde(default = "empty_object")]
    pub train_options: Option<Value>,
}

impl TuneSubmitIn {
    pub fn new(base: TuneSubmitBase, tune_template_id: Uuid) -> Self {
        Self {
            base,
            base_model_id: None,
            tune_template_id,
            model_parameters: empty_object(),
            train_options: empty_object(),
        }
    }
}

impl Validate for TuneSubmitIn {
    fn validate(mut self) -> Result<Self, StudioError> {
        self.base = self.base.validate()?;
        Ok(self)
    }
}

/// Hyperparameter-optimisation submission: tune metadata plus a YAML search config.
#[derive(Debug, Clone, PartialEq)]
pub struct HpoTuneSubmitIn {
    pub tune_metadata: TuneSubmitBase,
    pub config_file: PathBuf,
}

impl Validate for HpoTuneSubmitIn {
    fn validate(mut self) -> Result<Self, StudioError> {
        self.tune_metadata = self.tune_metadata.validate()?;
        let len = std::fs::metadata(&self.config_file).map(|m| m.len()).unwrap_or(0);
        if !self.config_file.is_file() || len == 0 {
            return Err(StudioError::validation(format!(
                "config file {} is missing or empty",
                self.config_file.display()
            )));
        }
        Ok(self)
    }
}

/// Masking options applied to try-out inferences of a tune.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunePostProcessing {
    #[serde(default)]
    pub cloud_masking: Option<Value>,
    #[serde(default)]
    pub snow_ice_masking: Option<Value>,
    #[serde(default)]
    pub permanent_water_masking: Option<Value>,
    #[serde(default)]
    pub ocean_masking: Option<Value>,
    #[serde(default)]
    pub regularization_custom: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryOutTuneInput {
    #[serde(default)]
    pub model_display_name: String,
    #[serde(default = "try_out")]
    pub description: Option<String>,
    pub location: String,
    #[serde(default)]
    pub geoserver_layers: Option<Value>,
    pub spatial_domain: SpatialDomain,
    pub temporal_domain: Vec<String>,
    #[serde(default)]
    pub model_input_data_spec: Option<Vec<Value>>,
    #[serde(default)]
    pub data_connector_config: Option<Vec<DataSource>>,
    #[serde(default)]
    pub geoserver_push: Option<Vec<GeoServerPush>>,
    #[serde(default)]
    pub post_processing: Option<TunePostProcessing>,
}

fn try_out() -> Option<String> {
    Some("try-out".into())
}

impl TryOutTuneInput {
    pub fn new(location: impl Into<String>, spatial_domain: SpatialDomain, temporal_domain: Vec<String>) -> Self {
        Self {
            model_display_name: String::new(),
            description: try_out(),
            location: location.into(),
            geoserver_layers: None,
            spatial_domain,
            temporal_domain,
            model_input_data_spec: None,
            data_connector_config: None,
            geoserver_push: None,
            post_processing: None,
        }
    }
}

impl Validate for TryOutTuneInput {
    fn validate(mut self) -> Result<Self, StudioError> {
        self.spatial_domain = self.spatial_domain.validate()?;
        self.data_connector_config = validate_all(self.data_connector_config)?;
        self.geoserver_push = validate_all(self.geoserver_push)?;
        Ok(self)
    }
}

/// Registers a tune trained outside the studio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTuneInput {
    pub name: String,
    pub description: String,
    pub tune_config_url: String,
    pub tune_checkpoint_url: String,
    #[serde(default)]
    pub model_input_data_spec: Option<Vec<Value>>,
    #[serde(default)]
    pub data_connector_config: Option<Vec<DataSource>>,
}

impl Validate for UploadTuneInput {
    fn validate(mut self) -> Result<Self, StudioError> {
        self.data_connector_config = validate_all(self.data_connector_config)?;
        Ok(self)
    }
}

// ---- Templates

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskPurpose {
    Regression,
    #[default]
    Segmentation,
    Other,
    Multimodal,
}

impl TaskPurpose {
    /// Case-insensitive parse.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "regression" => Some(Self::Regression),
            "segmentation" => Some(Self::Segmentation),
            "other" => Some(Self::Other),
            "multimodal" => Some(Self::Multimodal),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Regression => "Regression",
            Self::Segmentation => "Segmentation",
            Self::Other => "Other",
            Self::Multimodal => "Multimodal",
        };
        f.write_str(s)
    }
}

/// A fine-tuning template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskIn {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub purpose: TaskPurpose,
    /// Base64 of the YAML template.
    pub content: String,
    #[serde(default = "empty_object")]
    pub model_params: Option<Value>,
    #[serde(default = "default_extra_info")]
    pub extra_info: Option<Value>,
    #[serde(default)]
    pub dataset_id: Option<String>,
}

fn default_extra_info() -> Option<Value> {
    Some(json!({ "runtime_image": "" }))
}

impl TaskIn {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            purpose: TaskPurpose::default(),
            content: content.into(),
            model_params: empty_object(),
            extra_info: default_extra_info(),
            dataset_id: None,
        }
    }
}

impl Validate for TaskIn {
    fn validate(self) -> Result<Self, StudioError> {
        Ok(self)
    }
}

// ---- Datasets

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreScanDatasetIn {
    pub dataset_url: String,
    pub label_suffix: String,
    pub training_data_suffixes: Vec<String>,
}

impl Validate for PreScanDatasetIn {
    fn validate(self) -> Result<Self, StudioError> {
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetUpdateIn {
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub custom_bands: Option<Vec<Value>>,
    #[serde(default)]
    pub label_categories: Option<Vec<Value>>,
}

fn has_blank_id(items: &Option<Vec<Value>>) -> bool {
    items
        .iter()
        .flatten()
        .any(|item| item.get("id").and_then(Value::as_str) == Some(""))
}

impl Validate for DatasetUpdateIn {
    fn validate(self) -> Result<Self, StudioError> {
        if has_blank_id(&self.custom_bands) {
            return Err(StudioError::validation("Valid band ID is needed"));
        }
        if has_blank_id(&self.label_categories) {
            return Err(StudioError::validation("Valid label category ID is needed"));
        }
        Ok(self)
    }
}

/// Training parameters of a dataset. Class weights, when given, pair one-to-one with classes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_weights: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Validate for TrainingParams {
    fn validate(self) -> Result<Self, StudioError> {
        if !self.class_weights.is_empty() {
            if self.class_weights.len() != self.classes.len() {
                return Err(StudioError::validation(
                    "Class weights must either be defined for all classes or None",
                ));
            }
            if self.classes.is_empty() {
                return Err(StudioError::validation(
                    "classes must be provided when defining class_weights",
                ));
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetPurpose {
    Regression,
    Segmentation,
    Generate,
    #[serde(rename = "NER")]
    Ner,
    Classify,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetOnboardIn {
    pub dataset_name: String,
    pub label_suffix: String,
    pub dataset_url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub purpose: DatasetPurpose,
    #[serde(default)]
    pub data_sources: Vec<Value>,
    #[serde(default)]
    pub label_categories: Option<Vec<Value>>,
    #[serde(default = "default_dataset_version")]
    pub version: String,
    #[serde(default)]
    pub training_params: Option<TrainingParams>,
}

fn default_dataset_version() -> String {
    "v2".into()
}

impl Validate for DatasetOnboardIn {
    fn validate(mut self) -> Result<Self, StudioError> {
        self.training_params = self.training_params.map(Validate::validate).transpose()?;
        Ok(self)
    }
}

// ---- Base models

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    Terramind,
    #[default]
    Prithvi,
    Clay,
    Dofa,
    Resnet,
    Convnext,
}

impl fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Terramind => "terramind",
            Self::Prithvi => "prithvi",
            Self::Clay => "clay",
            Self::Dofa => "dofa",
            Self::Resnet => "resnet",
            Self::Convnext => "convnext",
        };
        f.write_str(s)
    }
}

/// Architecture parameters of a base model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseModelParamsIn {
    pub backbone: String,
    pub patch_size: u32,
    pub num_layers: u32,
    pub embed_dim: u32,
    pub num_heads: u32,
    pub tile_size: u32,
    pub tubelet_size: u32,
    pub model_category: ModelCategory,
}

impl Default for BaseModelParamsIn {
    fn default() -> Self {
        Self {
            backbone: String::new(),
            patch_size: 16,
            num_layers: 12,
            embed_dim: 768,
            num_heads: 12,
            tile_size: 1,
            tubelet_size: 1,
            model_category: ModelCategory::Prithvi,
        }
    }
}

impl Validate for BaseModelParamsIn {
    fn validate(self) -> Result<Self, StudioError> {
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseModelsIn {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub checkpoint_filename: String,
    #[serde(default)]
    pub model_params: BaseModelParamsIn,
}

impl Validate for BaseModelsIn {
    fn validate(self) -> Result<Self, StudioError> {
        Ok(self)
    }
}
