use anyhow::{Context, Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StudioError;
use crate::http::{BaseClient, FilePart, Formatted, Output};
use crate::poll::{JobKind, Poller};
use crate::schema::{
    BaseModelParamsIn, BaseModelsIn, DatasetOnboardIn, DatasetUpdateIn, HpoTuneSubmitIn,
    PreScanDatasetIn, TaskIn, TryOutTuneInput, TuneSubmitIn, TuneUpdateIn, UploadTuneInput,
    Validate,
};
use crate::table::Table;
use crate::util::mlflow_url;

const ARTEFACT_WORKERS: usize = 10;

/// MLflow UI links of a tune's training and test runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MlflowUrls {
    pub train_mlflow_url: Option<String>,
    pub test_mlflow_url: Option<String>,
}

/// One training artefact image, named `<prefix>_<epoch>_<image>.<ext>`.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningArtefact {
    pub filename: String,
    pub image: Vec<u8>,
    pub epoch: u32,
    pub image_number: u32,
}

/// Where a rendered or fetched template ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateTarget {
    /// Returned as a string.
    Text,
    /// Written to `<dir>/<task_id>.yaml`.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateOutput {
    Text(String),
    File(PathBuf),
}

/// Tunes, tune templates, datasets and base models.
#[derive(Debug, Clone)]
pub struct TuneClient {
    base: Arc<BaseClient>,
}

impl TuneClient {
    pub(crate) fn new(base: Arc<BaseClient>) -> Self {
        Self { base }
    }

    fn path(&self, suffix: &str) -> String {
        format!("{}/{}", self.base.api_version(), suffix)
    }

    // ---- Tunes

    pub fn list_tunes(&self, output: Output) -> Result<Formatted> {
        self.base.http_get(&self.path("tunes"), &[], output, Some("results"))
    }

    pub fn get_tune(&self, tune_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_get(&self.path(&format!("tunes/{}", tune_id)), &[], output, None)
    }

    pub fn update_tune(&self, tune_id: &str, data: TuneUpdateIn, output: Output) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base
            .http_patch(&self.path(&format!("tunes/{}", tune_id)), &payload, output, None)
    }

    pub fn delete_tune(&self, tune_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_delete(&self.path(&format!("tunes/{}", tune_id)), output, None)
    }

    /// Submits a fine-tuning job. The name is lowercased before validation.
    pub fn submit_tune(&self, mut data: TuneSubmitIn, output: Output) -> Result<Formatted> {
        data.base.name = data.base.name.to_lowercase();
        let payload = serde_json::to_value(data.validate()?)?;
        self.base.http_post(&self.path("submit-tune"), &payload, output, None)
    }

    /// Submits a hyperparameter-optimisation job: the tune metadata as a JSON form
    /// field plus the YAML search config as a file part.
    pub fn submit_hpo_tune(&self, data: HpoTuneSubmitIn, output: Output) -> Result<Formatted> {
        let data = data.validate()?;
        let file_name = data
            .config_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config.yaml".to_string());
        let bytes = std::fs::read(&data.config_file)
            .with_context(|| format!("failed to read {}", data.config_file.display()))?;
        let metadata = serde_json::to_string(&data.tune_metadata)?;
        let part = FilePart {
            field: "config_file".into(),
            file_name,
            mime: "application/x-yaml".into(),
            bytes,
        };
        self.base.http_post_files(
            &self.path("submit-hpo-tune"),
            &[("tune_metadata", metadata)],
            &[part],
            output,
            None,
        )
    }

    pub fn upload_completed_tunes(&self, data: UploadTuneInput) -> Result<Value> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base
            .http_post(&self.path("upload-completed-tunes"), &payload, Output::Json, None)?
            .into_json()
    }

    /// Runs an inference on a tune without deploying it.
    pub fn try_out_tune(&self, tune_id: &str, data: TryOutTuneInput) -> Result<Value> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base
            .http_post(
                &self.path(&format!("tunes/{}/try-out", tune_id)),
                &payload,
                Output::Json,
                None,
            )?
            .into_json()
    }

    /// Tune details including presigned URLs of its artefacts.
    pub fn download_tune(&self, tune_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_get(&self.path(&format!("tunes/{}/download", tune_id)), &[], output, None)
    }

    pub fn get_tune_metrics(&self, tune_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_get(&self.path(&format!("tunes/{}/metrics", tune_id)), &[], output, None)
    }

    /// Per-epoch metrics of the run called `run_name` (usually `Train` or `Test`).
    pub fn get_tune_metrics_table(&self, tune_id: &str, run_name: &str) -> Result<Table> {
        let metrics = self.get_tune_metrics(tune_id, Output::Json)?.into_json()?;
        Ok(tune_metrics_table(&metrics, run_name))
    }

    /// MLflow UI links for the tune's runs, or `None` when it recorded none.
    pub fn get_mlflow_metrics(&self, tune_id: &str) -> Result<Option<MlflowUrls>> {
        let ui = self
            .base
            .ui_url()
            .ok_or_else(|| StudioError::config("Missing configuration: set BASE_STUDIO_UI_URL"))?;
        let tune = self.get_tune(tune_id, Output::Json)?.into_json()?;
        let runs = merged_runs(&tune);
        if runs.is_empty() {
            log::info!(target: "GEOFM", "No mlflow url found for {}", tune_id);
            return Ok(None);
        }
        let link = |key: &str| {
            runs.get(key)
                .and_then(Value::as_str)
                .map(|p| format!("{}mlflow/#{}", ui, p))
        };
        Ok(Some(MlflowUrls {
            train_mlflow_url: link("Train"),
            test_mlflow_url: link("Test"),
        }))
    }

    pub fn get_training_image(&self, filename: &str, train_run_id: &str) -> Result<Vec<u8>> {
        let endpoint = format!("{}/get-artifact", mlflow_url(self.base.api_url()));
        let raw = self
            .base
            .http_get(
                &endpoint,
                &[("path", filename), ("run_uuid", train_run_id)],
                Output::Raw,
                None,
            )?
            .into_raw()?;
        if !raw.status.is_success() {
            return Err(anyhow!("artefact {} returned HTTP {}", filename, raw.status));
        }
        Ok(raw.body)
    }

    /// Artefact paths of the tune's training run, and that run's id.
    pub fn list_tuning_artefacts(&self, tune_id: &str) -> Result<(Vec<String>, String)> {
        let tune = self.get_tune(tune_id, Output::Json)?.into_json()?;
        let train_run_id = merged_runs(&tune)
            .get("Train")
            .and_then(Value::as_str)
            .and_then(|p| p.rsplit('/').next())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("tune {} has no Train run", tune_id))?;

        let endpoint = format!("{}/api/2.0/mlflow/artifacts/list", mlflow_url(self.base.api_url()));
        log::debug!(target: "GEOFM", "{}?run_id={}", endpoint, train_run_id);
        let listing = self
            .base
            .http_get(&endpoint, &[("run_id", train_run_id.as_str())], Output::Json, None)?
            .into_json()?;
        let files: Vec<String> = listing
            .get("files")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|f| f.get("path").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        log::info!(target: "GEOFM", "Found {} artefacts", files.len());
        Ok((files, train_run_id))
    }

    /// Downloads the training artefacts, optionally restricted to some epochs and
    /// image numbers, on a pool of ten workers. Results keep the listing order; any
    /// failed download fails the batch.
    pub fn get_tuning_artefacts(
        &self,
        tune_id: &str,
        epochs: Option<&[u32]>,
        image_numbers: Option<&[u32]>,
    ) -> Result<Vec<TuningArtefact>> {
        let (files, run_id) = self.list_tuning_artefacts(tune_id)?;
        let selected = select_artefacts(&files, epochs, image_numbers);

        let pb = ProgressBar::new(selected.len() as u64);
        pb.set_style(ProgressStyle::with_template("{msg} {wide_bar} {pos}/{len} {eta}")?);
        pb.set_message("Downloading artefacts");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ARTEFACT_WORKERS)
            .build()
            .context("failed to start artefact download pool")?;
        let artefacts = pool.install(|| {
            selected
                .par_iter()
                .map(|(name, epoch, image_number)| -> Result<TuningArtefact> {
                    let image = self.get_training_image(name, &run_id)?;
                    pb.inc(1);
                    Ok(TuningArtefact {
                        filename: name.clone(),
                        image,
                        epoch: *epoch,
                        image_number: *image_number,
                    })
                })
                .collect::<Result<Vec<_>>>()
        });
        pb.finish_and_clear();
        let artefacts = artefacts?;
        log::info!(target: "GEOFM", "Downloaded {} artefacts", artefacts.len());
        Ok(artefacts)
    }

    /// Blocks until the tune finishes or fails, reporting the latest epoch.
    /// Prints the logs link when it failed.
    pub fn poll_finetuning_until_finished(&self, tune_id: &str, poll_frequency: Duration) -> Result<Value> {
        let record = Poller::new(JobKind::Tune, poll_frequency).run_with_detail(
            || self.get_tune(tune_id, Output::Json)?.into_json(),
            |_| {
                let epochs = self
                    .get_tune_metrics(tune_id, Output::Json)
                    .and_then(Formatted::into_json)
                    .ok()
                    .and_then(|m| m.get("epochs").cloned())
                    .map(|e| crate::table::cell_text(&e))
                    .unwrap_or_else(|| "Unknown".to_string());
                Some(format!("Epoch: {}", epochs))
            },
        )?;
        if record.get("status").and_then(Value::as_str) == Some("Failed") {
            eprintln!("Download the logs from the link below:");
            eprintln!(
                "{}",
                record
                    .get("logs_presigned_url")
                    .map(crate::table::cell_text)
                    .unwrap_or_default()
            );
        }
        Ok(record)
    }

    // ---- Tune templates

    pub fn list_tune_templates(&self, output: Output) -> Result<Formatted> {
        self.base
            .http_get(&self.path("tune-templates"), &[], output, Some("results"))
    }

    pub fn create_task(&self, data: TaskIn, output: Output) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base.http_post(&self.path("tune-templates"), &payload, output, None)
    }

    pub fn get_task(&self, task_id: &str, output: Output) -> Result<Formatted> {
        self.base.http_get(
            &self.path(&format!("tune-templates/{}", task_id)),
            &[],
            output,
            Some("results"),
        )
    }

    pub fn delete_task(&self, task_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_delete(&self.path(&format!("tune-templates/{}", task_id)), output, None)
    }

    /// The template YAML of a task.
    pub fn get_task_template(&self, task_id: &str, target: TemplateTarget) -> Result<TemplateOutput> {
        let body = self
            .base
            .http_get(
                &self.path(&format!("tune-templates/{}/template", task_id)),
                &[],
                Output::Json,
                Some("results"),
            )?
            .into_json()?;
        deliver_template(task_id, &body, target)
    }

    /// Replaces a task's template with the YAML file at `file_path`.
    pub fn update_task(&self, task_id: &str, file_path: &Path, output: Output) -> Result<Formatted> {
        self.base.http_put_file(
            &self.path(&format!("tune-templates/{}/template", task_id)),
            file_path,
            output,
            None,
        )
    }

    /// Replaces the JSON schema of a task's parameters.
    pub fn update_task_schema(&self, task_id: &str, task_schema: &Value, output: Output) -> Result<Formatted> {
        self.base.http_put(
            &self.path(&format!("tune-templates/{}/schema", task_id)),
            task_schema,
            output,
            None,
        )
    }

    /// Default values of the task's grouped model parameters.
    pub fn get_task_param_defaults(&self, task_id: &str) -> Result<Map<String, Value>> {
        let meta = self.get_task(task_id, Output::Json)?.into_json()?;
        Ok(param_defaults(&meta))
    }

    /// Renders the task against a dataset and base model.
    pub fn check_task_content(
        &self,
        task_id: &str,
        dataset_id: &str,
        base_model_id: &str,
        target: TemplateTarget,
    ) -> Result<TemplateOutput> {
        let body = self
            .base
            .http_get(
                &self.path(&format!("tune-templates/{}/test-render", task_id)),
                &[("dataset_id", dataset_id), ("base_model", base_model_id)],
                Output::Json,
                None,
            )?
            .into_json()?;
        deliver_template(task_id, &body, target)
    }

    /// Renders a user-defined task against a dataset.
    pub fn render_template(&self, task_id: &str, dataset_id: &str, target: TemplateTarget) -> Result<TemplateOutput> {
        let body = self
            .base
            .http_get(
                &self.path(&format!("tune-templates/{}/test-render-user-defined-task", task_id)),
                &[("dataset_id", dataset_id)],
                Output::Json,
                None,
            )?
            .into_json()?;
        deliver_template(task_id, &body, target)
    }

    // ---- Datasets

    pub fn list_datasets(&self, output: Output) -> Result<Formatted> {
        self.base.http_get(&self.path("datasets"), &[], output, Some("results"))
    }

    pub fn pre_scan_dataset(&self, data: PreScanDatasetIn, output: Output) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base.http_post(&self.path("datasets/pre-scan"), &payload, output, None)
    }

    pub fn get_sample_images(&self, dataset_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_get(&self.path(&format!("datasets/{}/sample", dataset_id)), &[], output, None)
    }

    pub fn update_dataset(&self, dataset_id: &str, data: DatasetUpdateIn, output: Output) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base
            .http_patch(&self.path(&format!("datasets/{}", dataset_id)), &payload, output, None)
    }

    pub fn get_dataset(&self, dataset_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_get(&self.path(&format!("datasets/{}", dataset_id)), &[], output, None)
    }

    pub fn delete_dataset(&self, dataset_id: &str, output: Output) -> Result<Formatted> {
        self.base
            .http_delete(&self.path(&format!("datasets/{}", dataset_id)), output, None)
    }

    pub fn onboard_dataset(&self, data: DatasetOnboardIn, output: Output) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base.http_post(&self.path("datasets/onboard"), &payload, output, None)
    }

    /// Blocks until onboarding succeeds or fails.
    pub fn poll_onboard_dataset_until_finished(&self, dataset_id: &str, poll_frequency: Duration) -> Result<Value> {
        Poller::new(JobKind::DatasetOnboarding, poll_frequency)
            .run(|| self.get_dataset(dataset_id, Output::Json)?.into_json())
    }

    // ---- Base models

    pub fn list_base_models(&self, output: Output) -> Result<Formatted> {
        self.base
            .http_get(&self.path("base-models"), &[], output, Some("results"))
    }

    pub fn create_base_model(&self, data: BaseModelsIn, output: Output) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base
            .http_post(&self.path("base-models"), &payload, output, Some("results"))
    }

    pub fn get_base_model(&self, base_id: &str, output: Output) -> Result<Formatted> {
        self.base.http_get(
            &self.path(&format!("base-models/{}", base_id)),
            &[],
            output,
            Some("results"),
        )
    }

    pub fn update_base_model_params(
        &self,
        base_id: &str,
        data: BaseModelParamsIn,
        output: Output,
    ) -> Result<Formatted> {
        let payload = serde_json::to_value(data.validate()?)?;
        self.base.http_patch(
            &self.path(&format!("base-models/{}/model-params", base_id)),
            &payload,
            output,
            Some("results"),
        )
    }
}

// `metrics` is a list of single-entry maps, e.g. [{"Train": "/experiments/1/runs/ab"}].
fn merged_runs(tune: &Value) -> Map<String, Value> {
    let mut merged = Map::new();
    for entry in tune.get("metrics").and_then(Value::as_array).into_iter().flatten() {
        if let Some(obj) = entry.as_object() {
            merged.extend(obj.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    merged
}

/// `epoch_4_5.png` -> `(4, 5)`
pub(crate) fn parse_artefact_name(name: &str) -> Option<(u32, u32)> {
    let mut parts = name.split('_');
    let epoch = parts.nth(1)?.parse().ok()?;
    let image = parts.next()?.split('.').next()?.parse().ok()?;
    Some((epoch, image))
}

fn select_artefacts(
    files: &[String],
    epochs: Option<&[u32]>,
    image_numbers: Option<&[u32]>,
) -> Vec<(String, u32, u32)> {
    files
        .iter()
        .filter_map(|f| match parse_artefact_name(f) {
            Some((e, i)) => Some((f.clone(), e, i)),
            None => {
                log::debug!(target: "GEOFM", "skipping artefact {}", f);
                None
            }
        })
        .filter(|(_, e, _)| epochs.is_none_or(|want| want.contains(e)))
        .filter(|(_, _, i)| image_numbers.is_none_or(|want| want.contains(i)))
        .collect()
}

/// Keys of `model_params.properties` that are parameter groups, mapped to their `default`.
pub(crate) fn param_defaults(task: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    let props = task
        .pointer("/model_params/properties")
        .and_then(Value::as_object);
    for (k, v) in props.into_iter().flatten() {
        if v.get("properties").is_some() {
            out.insert(k.clone(), v.get("default").cloned().unwrap_or(Value::Null));
        }
    }
    out
}

fn deliver_template(task_id: &str, body: &Value, target: TemplateTarget) -> Result<TemplateOutput> {
    let text = body
        .get("reason")
        .map(crate::table::cell_text)
        .unwrap_or_else(|| body.to_string());
    match target {
        TemplateTarget::Text => Ok(TemplateOutput::Text(text)),
        TemplateTarget::File(dir) => {
            let path = dir.join(format!("{}.yaml", task_id));
            std::fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
            Ok(TemplateOutput::File(path))
        }
    }
}

/// Joins the metric series of one run into a row per epoch, sorted by epoch.
pub fn tune_metrics_table(metrics: &Value, run_name: &str) -> Table {
    let run = metrics
        .get("runs")
        .and_then(Value::as_array)
        .and_then(|runs| {
            runs.iter()
                .find(|r| r.get("name").and_then(Value::as_str) == Some(run_name))
        });
    let Some(run) = run else {
        return Table::default();
    };

    let mut rows: Vec<(f64, Map<String, Value>)> = Vec::new();
    for series in run.get("metrics").and_then(Value::as_array).into_iter().flatten() {
        for record in series.as_array().into_iter().flatten() {
            let Some(obj) = record.as_object() else { continue };
            let Some(epoch) = obj.get("epoch").and_then(Value::as_f64) else { continue };
            match rows.iter_mut().find(|(e, _)| *e == epoch) {
                Some((_, row)) => row.extend(obj.iter().map(|(k, v)| (k.clone(), v.clone()))),
                None => rows.push((epoch, obj.clone())),
            }
        }
    }
    rows.sort_by(|a, b| a.0.total_cmp(&b.0));
    let records: Vec<Value> = rows.into_iter().map(|(_, r)| Value::Object(r)).collect();
    Table::from_json(&Value::Array(records))
}
