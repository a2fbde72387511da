use crate::types::ImageId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of one build, returned to the invoking layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub success: bool,
    /// Progress and warning messages, in the order they were produced.
    pub messages: Vec<String>,
    pub working_dir: PathBuf,
    pub image_id: Option<ImageId>,
}

impl BuildResult {
    pub fn succeeded(image_id: ImageId, working_dir: PathBuf, messages: Vec<String>) -> Self {
        Self {
            success: true,
            messages,
            working_dir,
            image_id: Some(image_id),
        }
    }

    pub fn failed(
        error: impl std::fmt::Display,
        working_dir: PathBuf,
        mut messages: Vec<String>,
    ) -> Self {
        messages.push(error.to_string());
        Self {
            success: false,
            messages,
            working_dir,
            image_id: None,
        }
    }
}
