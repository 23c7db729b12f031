//! Request payload schemas shared by the inference and tuning clients.
//!
//! Every payload implements [`Validate`]; clients call it before serialising, so a
//! malformed request never leaves the process.

mod inference;
mod tune;

pub use inference::{
    DataAdvisorIn, DataSource, GeoServerPush, InferenceConfig, InferenceCreateInput,
    ModelCreateInput, ModelOnboardingInput, ModelUpdateInput, PostProcessing, SpatialDomain,
};
pub use tune::{
    BaseModelParamsIn, BaseModelsIn, DatasetOnboardIn, DatasetPurpose, DatasetUpdateIn,
    HpoTuneSubmitIn, ModelCategory, PreScanDatasetIn, TaskIn, TaskPurpose, TrainingParams,
    TryOutTuneInput, TunePostProcessing, TuneSubmitBase, TuneSubmitIn, TuneUpdateIn,
    UploadTuneInput,
};

use crate::error::StudioError;

/// Checks a payload and returns it, possibly cleaned up (e.g. normalised names).
pub trait Validate: Sized {
    fn validate(self) -> Result<Self, StudioError>;
}

/// Accepts `[A-Za-z0-9_-]+`.
pub fn validate_display_name(v: &str) -> Result<(), StudioError> {
    let ok = !v.is_empty()
        && v
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(StudioError::validation(
            "model display_name can only contain letters, underscores, and hyphens",
        ));
    }
    Ok(())
}

/// Replaces spaces and underscores with hyphens, trims, and requires alphanumeric
/// runs joined by single `.` or `-` separators.
pub fn clean_name(name: &str) -> Result<String, StudioError> {
    let name = name.replace([' ', '_'], "-").trim().to_string();
    if !is_separated_alnum(&name) {
        return Err(StudioError::validation(
            "must not contain special characters or white spaces. Replace underscores with hyphens.",
        ));
    }
    Ok(name)
}

fn is_separated_alnum(s: &str) -> bool {
    let is_sep = |c: char| c == '.' || c == '-';
    let (Some(first), Some(last)) = (s.chars().next(), s.chars().last()) else {
        return false;
    };
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return false;
    }
    let mut prev_sep = false;
    for c in s.chars() {
        if is_sep(c) {
            if prev_sep {
                return false;
            }
            prev_sep = true;
        } else if c.is_ascii_alphanumeric() {
            prev_sep = false;
        } else {
            return false;
        }
    }
    true
}

pub(crate) fn check_len(field: &str, v: &str, min: usize, max: usize) -> Result<(), StudioError> {
    let n = v.chars().count();
    if n < min || n > max {
        return Err(StudioError::validation(format!(
            "{} must be between {} and {} characters, got {}",
            field, min, max, n
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_rejects_spaces_and_punctuation() {
        assert!(validate_display_name("flood model").is_err());
        assert!(validate_display_name("flood.model").is_err());
        assert!(validate_display_name("flood!").is_err());
        assert!(validate_display_name("").is_err());
    }

    #[test]
    fn display_name_accepts_alphanumeric() {
        assert!(validate_display_name("Prithvi2").is_ok());
        assert!(validate_display_name("burn_scars-v2").is_ok());
    }

    #[test]
    fn clean_name_normalises_separators() {
        assert_eq!(clean_name("my tune_name").unwrap(), "my-tune-name");
        assert_eq!(clean_name("v1.2-burn").unwrap(), "v1.2-burn");
    }

    #[test]
    fn clean_name_rejects_doubled_or_dangling_separators() {
        assert!(clean_name("a--b").is_err());
        assert!(clean_name("a__b").is_err());
        assert!(clean_name("-ab").is_err());
        assert!(clean_name("ab.").is_err());
        assert!(clean_name("a/b").is_err());
    }
}
