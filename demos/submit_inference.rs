use anyhow::Result;
use geostudio::schema::{InferenceConfig, InferenceCreateInput, SpatialDomain};
use geostudio::{Client, Output};
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::init();

    // Reads BASE_GATEWAY_API_URL and GEOSTUDIO_API_KEY, or ~/.geostudio_config_file.
    let client = Client::from_env()?;

    let input = InferenceCreateInput {
        model_display_name: Some("geofm-sandbox-models".into()),
        description: Some("Flood extent around Sacramento".into()),
        location: Some("Sacramento, CA".into()),
        config: InferenceConfig {
            spatial_domain: SpatialDomain::from_bbox([-121.83, 38.46, -121.56, 38.66]),
            temporal_domain: Some(vec!["2024-08-01_2024-08-10".into()]),
            ..InferenceConfig::default()
        },
        ..InferenceCreateInput::default()
    };

    let created = client.inference.submit_inference(input, Output::Json)?.into_json()?;
    let Some(id) = created.get("id").and_then(|v| v.as_str()) else {
        anyhow::bail!("submission returned no id: {}", created);
    };
    println!("submitted inference {}", id);

    let done = client.inference.poll_inference_until_finished(id, Duration::from_secs(15))?;
    println!("finished with status {}", done["status"]);

    let tasks = client.inference.inference_task_status(id)?;
    println!("{} task(s)", tasks.len());
    Ok(())
}
