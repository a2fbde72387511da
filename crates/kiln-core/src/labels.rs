use kiln_schema::{BuildRequest, SourceInfo};
use std::collections::BTreeMap;

pub const DISPLAY_NAME_LABEL: &str = "io.k8s.display-name";
pub const DESCRIPTION_LABEL: &str = "io.k8s.description";

/// Labels for the committed output image, stamped with the current time.
pub fn output_labels(request: &BuildRequest, info: &SourceInfo) -> BTreeMap<String, String> {
    labels_at(request, info, &chrono::Utc::now().to_rfc3339())
}

/// Provenance labels under the request's namespace, the display labels,
/// then the request's own labels, which take precedence. Empty values are
/// left out.
pub fn labels_at(
    request: &BuildRequest,
    info: &SourceInfo,
    date: &str,
) -> BTreeMap<String, String> {
    let ns = &request.label_namespace;
    let author = info.author();
    let generated = [
        ("commit.ref", info.git_ref.as_str()),
        ("commit.id", info.commit_id.as_str()),
        ("commit.date", info.date.as_str()),
        ("commit.author", author.as_str()),
        ("commit.message", info.message.as_str()),
        ("source-location", info.location.as_str()),
        ("source-context-dir", info.context_dir.as_str()),
        ("image", request.builder_image.as_str()),
        (
            "builder-version",
            request.builder_image_version.as_deref().unwrap_or_default(),
        ),
        (
            "builder-base-version",
            request
                .builder_base_image_version
                .as_deref()
                .unwrap_or_default(),
        ),
        ("date", date),
    ];

    let mut labels = BTreeMap::new();
    for (key, value) in generated {
        if !value.is_empty() {
            labels.insert(format!("{ns}{key}"), value.to_owned());
        }
    }

    let display = request.display_name.as_deref().unwrap_or(&request.tag);
    if !display.is_empty() {
        labels.insert(DISPLAY_NAME_LABEL.to_owned(), display.to_owned());
    }
    if let Some(description) = request.description.as_deref().filter(|d| !d.is_empty()) {
        labels.insert(DESCRIPTION_LABEL.to_owned(), description.to_owned());
    }

    for (key, value) in &request.labels {
        if value.is_empty() {
            labels.remove(key);
        } else {
            labels.insert(key.clone(), value.clone());
        }
    }
    labels
}
