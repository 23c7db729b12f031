use serde::{Deserialize, Serialize};

use crate::schema::SpatialDomain;

const DEFAULT_TEMPORAL_DOMAIN: &str = "2020-01-01_2024-12-31";
const DEFAULT_MODEL_ID: &str = "d5a82d97-ffb8-4de1-bd91-ad3c12828976";

/// Body of an inference submission as posted by the map plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub spatial_domain: SpatialDomain,
    /// `["<start>_<end>"]`
    pub temporal_domain: Vec<String>,
    pub description: String,
    pub location: String,
    pub model_id: String,
}

impl Default for InferenceRequest {
    fn default() -> Self {
        Self {
            spatial_domain: SpatialDomain::default(),
            temporal_domain: vec![DEFAULT_TEMPORAL_DOMAIN.to_string()],
            description: String::new(),
            location: String::new(),
            model_id: DEFAULT_MODEL_ID.to_string(),
        }
    }
}

/// Chained construction of an [`InferenceRequest`].
///
/// The builder does not validate; an empty spatial domain is caught by schema
/// validation or by the server.
///
/// ```
/// use geostudio::InferenceRequestBuilder;
///
/// let req = InferenceRequestBuilder::new()
///     .with_bbox([-121.8, 38.4, -121.6, 38.6])
///     .with_temporal_domain("2024-08-01", "2024-08-10")
///     .with_location("Sacramento")
///     .build();
/// assert_eq!(req.spatial_domain.bbox, vec![vec![-121.8, 38.4, -121.6, 38.6]]);
/// assert_eq!(req.temporal_domain, vec!["2024-08-01_2024-08-10"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InferenceRequestBuilder {
    request: InferenceRequest,
}

impl InferenceRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores every field to its default.
    pub fn reset(&mut self) -> &mut Self {
        self.request = InferenceRequest::default();
        self
    }

    /// `[west, south, east, north]`, stored as the single box of the spatial domain.
    pub fn with_bbox(mut self, bbox: [f64; 4]) -> Self {
        self.request.spatial_domain.bbox = vec![bbox.to_vec()];
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.request.description = description.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.request.location = location.into();
        self
    }

    pub fn with_temporal_domain(mut self, start: &str, end: &str) -> Self {
        self.request.temporal_domain = vec![format!("{}_{}", start, end)];
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.request.model_id = model_id.into();
        self
    }

    pub fn build(&self) -> InferenceRequest {
        self.request.clone()
    }
}
