/// Tag suffix marking builder images that only accept instruction-time
/// injection of sources and scripts.
pub const LAYERED_MARKER: &str = "-onbuild";

/// Builder image label naming where the image keeps its lifecycle scripts.
pub const SCRIPTS_URL_LABEL: &str = "io.kiln.scripts-url";

/// Conventional in-image script location, as a scripts URL.
pub const DEFAULT_SCRIPTS_URL: &str = "image:///usr/libexec/kiln";

/// Return the tag component of an image reference, if it has one.
///
/// The tag follows the last `:` after the last `/`, so registry ports
/// (`host:5000/app`) are not mistaken for tags. A trailing `@digest` is
/// ignored.
pub fn image_tag(reference: &str) -> Option<&str> {
    let without_digest = reference.split_once('@').map_or(reference, |(name, _)| name);
    let last_segment = without_digest
        .rsplit_once('/')
        .map_or(without_digest, |(_, seg)| seg);
    last_segment
        .rsplit_once(':')
        .map(|(_, tag)| tag)
        .filter(|tag| !tag.is_empty())
}

/// Whether the image's tag carries [`LAYERED_MARKER`].
pub fn has_layered_marker(reference: &str) -> bool {
    image_tag(reference).is_some_and(|tag| tag.contains(LAYERED_MARKER))
}
