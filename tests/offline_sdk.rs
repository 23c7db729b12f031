use geostudio::schema::{ModelUpdateInput, Validate, validate_display_name};
use geostudio::{InferenceRequestBuilder, JobKind, Poller, StudioError, normalize_api_url};
use serde_json::json;
use std::time::Duration;

#[test]
fn builder_wraps_bbox_in_a_list() {
    for bbox in [[0.0, 0.0, 1.0, 1.0], [-180.0, -90.0, 180.0, 90.0], [12.5, 41.8, 12.6, 41.9]] {
        let req = InferenceRequestBuilder::new().with_bbox(bbox).build();
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["spatial_domain"]["bbox"], json!([bbox]));
    }
}

#[test]
fn api_url_normalization_is_idempotent() {
    for (gw, ui) in [
        (Some("https://host.example.com/studio-gateway/v2/inference"), None),
        (Some("https://host.example.com"), None),
        (None, Some("https://ui.example.com/#/home")),
    ] {
        let (api, ui_url) = normalize_api_url(gw, ui);
        let (again, _) = normalize_api_url(api.as_deref(), ui_url.as_deref());
        assert_eq!(api, again);
    }
}

#[test]
fn api_url_with_non_ascii_prefix_normalizes() {
    for gw in ["ébad//host/x", "日本/studio", "ü"] {
        let (api, _) = normalize_api_url(Some(gw), None);
        let api = api.unwrap();
        assert!(api.ends_with('/'), "{:?}", api);
        assert_eq!(normalize_api_url(Some(&api), None).0.as_deref(), Some(api.as_str()));
    }
}

#[test]
fn display_names_allow_only_word_characters() {
    assert!(validate_display_name("FloodModel2024").is_ok());
    assert!(validate_display_name("flood_model-v2").is_ok());
    for bad in ["flood model", "flood.model", "flood!", ""] {
        assert!(validate_display_name(bad).is_err(), "{:?}", bad);
    }

    let err = ModelUpdateInput::new("has space").validate().unwrap_err();
    assert!(matches!(err, StudioError::Validation(_)));
}

#[test]
fn poller_stops_at_first_terminal_status() {
    let statuses = ["RUNNING", "RUNNING", "COMPLETED"];
    let mut fetches = 0;
    let mut sleeps = Vec::new();
    let record = Poller::new(JobKind::Inference, Duration::from_secs(1))
        .with_sleep(|d| sleeps.push(d))
        .run(|| {
            let status = statuses[fetches];
            fetches += 1;
            Ok(json!({"id": "inf-1", "status": status, "created_at": "2025-01-01T00:00:00Z"}))
        })
        .unwrap();

    assert_eq!(fetches, 3);
    assert_eq!(record["status"], "COMPLETED");
    assert_eq!(sleeps, vec![Duration::from_secs(10); 2]);
}
