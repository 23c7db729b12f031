use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::blocking::multipart::{Form, Part};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::download::{Download, HttpDownloader};
use crate::error::StudioError;
use crate::http::{BaseClient, Formatted, Output, RawResponse, formatted_output};
use crate::poll::{JobKind, Poller};
use crate::schema::{
    DataAdvisorIn, InferenceCreateInput, ModelCreateInput, ModelOnboardingInput, ModelUpdateInput,
    Validate,
};
use crate::table::{Table, cell_text};

/// Models, inference runs, tasks, data sources, file sharing and geoserver lookups.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    base: Arc<BaseClient>,
}

impl InferenceClient {
    pub(crate) fn new(base: Arc<BaseClient>) -> Self {
        Self { base }
    }

    fn path(&self, suffix: &str) -> String {
        format!("{}/{}", self.base.api_version(), suffix)
    }

    // ---- Models

    pub fn create_model(&self, data: ModelCreateInput, output: Output) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base.http_post(&self.path("models"), &payload, output, Some("results"))
    }

    pub fn list_models(&self, output: Output) -> Result<Formatted> {
        self.base.http_get(
            &self.path("models"),
            &[("limit", "1000"), ("skip", "0")],
            output,
            Some("results"),
        )
    }

    pub fn update_model(&self, model_id: &str, data: ModelUpdateInput, output: Output) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base
            .http_patch(&self.path(&format!("models/{}", model_id)), &payload, output, Some("results"))
    }

    /// Deploys a fine-tuned model from its config and checkpoint URLs.
    pub fn deploy_model(
        &self,
        model_id: &str,
        data: ModelOnboardingInput,
        output: Output,
    ) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base.http_post(
            &self.path(&format!("models/{}/deploy", model_id)),
            &payload,
            output,
            Some("results"),
        )
    }

    pub fn get_model(&self, model_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_get(&self.path(&format!("models/{}", model_id)), &[], output, Some("results"))
    }

    pub fn delete_model(&self, model_id: &str, output: Output) -> Result<Formatted> {
        self.base.http_delete(&self.path(&format!("models/{}", model_id)), output, None)
    }

    // ---- Inference

    pub fn submit_inference(&self, data: InferenceCreateInput, output: Output) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        log::info!(target: "GEOFM", "submitting inference");
        self.base.http_post(&self.path("inference"), &payload, output, Some("results"))
    }

    pub fn list_inferences(&self, output: Output) -> Result<Formatted> {
        self.base.http_get(
            &self.path("inference"),
            &[("limit", "10"), ("skip", "0")],
            output,
            Some("results"),
        )
    }

    pub fn get_inference(&self, inference_id: &str, output: Output) -> Result<Formatted> {
        self.base.http_get(
            &self.path(&format!("inference/{}", inference_id)),
            &[],
            output,
            Some("results"),
        )
    }

    pub fn delete_inference(&self, inference_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_delete(&self.path(&format!("inference/{}", inference_id)), output, None)
    }

    pub fn get_inference_tasks(&self, inference_id: &str, output: Output) -> Result<Formatted> {
        self.base.http_get(
            &self.path(&format!("inference/{}/tasks", inference_id)),
            &[],
            output,
            Some("results"),
        )
    }

    pub fn get_task_output_url(&self, task_id: &str, output: Output) -> Result<Formatted> {
        self.base.http_get(
            &self.path(&format!("tasks/{}/output", task_id)),
            &[],
            output,
            Some("results"),
        )
    }

    pub fn get_task_step_logs(&self, task_id: &str, step_id: &str, output: Output) -> Result<Formatted> {
        self.base.http_get(
            &self.path(&format!("tasks/{}/logs/{}", task_id, step_id)),
            &[],
            output,
            Some("results"),
        )
    }

    /// One row per task with the status of each pipeline step; see [`task_status_table`].
    pub fn inference_task_status(&self, inference_id: &str) -> Result<Table> {
        let body = self.get_inference_tasks(inference_id, Output::Json)?.into_json()?;
        let tasks = body
            .get("tasks")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(task_status_table(tasks))
    }

    /// Blocks until the inference reaches a terminal status and returns its record.
    pub fn poll_inference_until_finished(&self, inference_id: &str, poll_frequency: Duration) -> Result<Value> {
        Poller::new(JobKind::Inference, poll_frequency)
            .run(|| self.get_inference(inference_id, Output::Json)?.into_json())
    }

    // ---- Data advisory

    /// Checks data availability. `maxcc`, `pre_days` and `post_days` default from the settings.
    pub fn check_data_availability(
        &self,
        datasource: &str,
        data: DataAdvisorIn,
        output: Output,
    ) -> Result<Formatted> {
        let data = data.with_defaults(&self.base.settings().data_advisor).validate()?;
        let payload = serde_json::to_value(data)?;
        self.base.http_post(
            &self.path(&format!("data-advice/{}", datasource)),
            &payload,
            output,
            Some("results"),
        )
    }

    pub fn list_datasource_collections(&self, datasource: &str, output: Output) -> Result<Formatted> {
        self.base.http_get(
            &self.path(&format!("data-advice/{}", datasource)),
            &[],
            output,
            Some("results"),
        )
    }

    // ---- Data sources

    pub fn list_datasource(
        &self,
        connector: Option<&str>,
        collection: Option<&str>,
        limit: usize,
        skip: usize,
        output: Output,
    ) -> Result<Formatted> {
        let limit = limit.to_string();
        let skip = skip.to_string();
        let mut params = vec![("limit", limit.as_str()), ("skip", skip.as_str())];
        if let Some(c) = connector.filter(|c| !c.is_empty()) {
            params.push(("connector", c));
        }
        if let Some(c) = collection.filter(|c| !c.is_empty()) {
            params.push(("collection", c));
        }
        self.base
            .http_get(&self.path("data-sources"), &params, output, Some("results"))
    }

    /// Data sources whose `id` matches, looked up in the first page of the listing.
    pub fn get_datasource(&self, datasource_id: &str) -> Result<Vec<Value>> {
        let body = self
            .list_datasource(None, None, 25, 0, Output::Json)?
            .into_json()?;
        Ok(body
            .get("results")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|d| d.get("id").and_then(Value::as_str) == Some(datasource_id))
            .cloned()
            .collect())
    }

    // ---- Files

    /// Presigned upload and download links for `object_name`.
    pub fn get_fileshare_links(&self, object_name: &str) -> Result<Value> {
        log::info!(target: "GEOFM", "Going to generate the upload link");
        self.base
            .http_get(
                &self.path("file-share"),
                &[("object_name", object_name)],
                Output::Json,
                Some("results"),
            )?
            .into_json()
    }

    /// Uploads `file_path` to a presigned URL as a multipart PUT with a progress bar.
    /// Session credentials are not sent to the presigned URL.
    pub fn upload_file_to_url(&self, upload_url: &str, file_path: &Path) -> Result<RawResponse> {
        log::info!(target: "GEOFM", "Going to upload the file to the url.");
        let file = std::fs::File::open(file_path)
            .with_context(|| format!("failed to open {}", file_path.display()))?;
        let total = file.metadata()?.len();
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "filename".to_string());

        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template(
                "{msg} {wide_bar} {bytes}/{total_bytes} ({bytes_per_sec}) {eta}",
            )?
            .progress_chars("=>-"),
        );
        pb.set_message(file_name.clone());

        let part = Part::reader_with_length(pb.wrap_read(file), total).file_name(file_name);
        let form = Form::new().part("file", part);
        let resp = self
            .base
            .session()
            .http()
            .put(upload_url)
            .multipart(form)
            .send()
            .context("upload request failed")?;
        pb.finish_and_clear();
        formatted_output(resp, Output::Raw, None)?.into_raw()
    }

    /// Requests share links for the file's base name and uploads it when an
    /// `upload_url` comes back. Returns the links.
    pub fn upload_file(&self, file_path: &Path) -> Result<Value> {
        let object_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StudioError::validation(format!("{} has no file name", file_path.display())))?;
        let links = self.get_fileshare_links(&object_name)?;
        if let Some(url) = links.get("upload_url").and_then(Value::as_str) {
            self.upload_file_to_url(url, file_path)?;
        }
        Ok(links)
    }

    /// Downloads a (presigned) URL to `target`, returning the written path.
    pub fn download_file(&self, url: &str, target: &Path) -> Result<PathBuf> {
        let settings = self.base.settings();
        HttpDownloader::new(settings.verify, settings.timeout)?.download(url, target)?;
        Ok(target.to_path_buf())
    }

    // ---- Geoserver

    /// `<studio-ui>geofm-geoserver`
    pub fn get_geoserver_url(&self) -> Result<String> {
        let ui = self
            .base
            .ui_url()
            .ok_or_else(|| StudioError::config("Missing configuration: set BASE_STUDIO_UI_URL"))?;
        Ok(format!("{}geofm-geoserver", ui))
    }

    /// Time dimension values published for `layer_name`, or `None` when the
    /// capabilities document has no domain.
    pub fn get_layer_timestamps(&self, layer_name: &str) -> Result<Option<Vec<String>>> {
        let mut url = url::Url::parse(&format!(
            "{}/geoserver/gwc/service/wmts",
            self.get_geoserver_url()?
        ))?;
        url.query_pairs_mut()
            .append_pair("Version", "1.0.0")
            .append_pair("REQUEST", "GetDomainValues")
            .append_pair("Layer", layer_name)
            .append_pair("domain", "time");
        let text = self
            .base
            .session()
            .http()
            .get(url)
            .send()
            .context("geoserver request failed")?
            .text()?;
        parse_domain_values(&text)
    }
}

/// Builds the per-task step status table.
///
/// Planning tasks (ids ending in `_planning`) are skipped. Columns are `task_id`
/// followed by every pipeline `process_id` in first-seen order. The numeric suffix of
/// each task id is zero-padded to the width of the row count so rows sort naturally.
pub fn task_status_table(tasks: &[Value]) -> Table {
    let runnable: Vec<&Value> = tasks
        .iter()
        .filter(|t| {
            let id = t.get("task_id").and_then(Value::as_str).unwrap_or_default();
            id.rsplit('_').next() != Some("planning")
        })
        .collect();

    let mut table = Table {
        columns: vec!["task_id".to_string()],
        rows: Vec::new(),
    };
    let steps = |t: &Value| -> Vec<Value> {
        t.get("pipeline_steps")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    for t in &runnable {
        for step in steps(t) {
            let pid = step.get("process_id").map(cell_text).unwrap_or_default();
            if !table.columns.contains(&pid) {
                table.columns.push(pid);
            }
        }
    }

    let width = runnable.len().to_string().len();
    for t in &runnable {
        let id = t.get("task_id").and_then(Value::as_str).unwrap_or_default();
        let mut row = vec![Value::Null; table.columns.len()];
        row[0] = json!(pad_task_suffix(id, width));
        for step in steps(t) {
            let pid = step.get("process_id").map(cell_text).unwrap_or_default();
            if let Some(idx) = table.columns.iter().position(|c| *c == pid) {
                row[idx] = step.get("status").cloned().unwrap_or(Value::Null);
            }
        }
        table.rows.push(row);
    }
    table.sort_by_column("task_id");
    table
}

fn pad_task_suffix(task_id: &str, width: usize) -> String {
    match task_id.rsplit_once('_') {
        Some((head, tail)) => format!("{}_{:0>width$}", head, tail, width = width),
        None => format!("_{:0>width$}", task_id, width = width),
    }
}

pub(crate) fn parse_domain_values(xml: &str) -> Result<Option<Vec<String>>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_domain = false;
    loop {
        match reader.read_event().context("invalid WMTS domain document")? {
            Event::Start(e) if e.local_name().as_ref() == b"Domain" => in_domain = true,
            Event::Text(t) if in_domain => {
                let text = t.unescape()?;
                return Ok(Some(text.split(',').map(|s| s.trim().to_string()).collect()));
            }
            Event::End(e) if e.local_name().as_ref() == b"Domain" => return Ok(Some(Vec::new())),
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}
