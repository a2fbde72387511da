//! Standard vs. layered strategy selection.
//!
//! The decision is a heuristic on the builder image reference, not an inspection
//! of the image's capabilities: a tag carrying the layered marker selects
//! the layered strategy. A misclassified image surfaces later as a missing
//! script or permission failure from the executor.

use kiln_schema::{has_layered_marker, BuildRequest};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Copy scripts and source into a builder container, run assemble, commit.
    Standard,
    /// Bake scripts and source into an intermediate image first.
    Layered,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Standard => "standard",
            Self::Layered => "layered",
        })
    }
}

pub fn select_strategy(builder_image: &str) -> Strategy {
    if has_layered_marker(builder_image) {
        Strategy::Layered
    } else {
        Strategy::Standard
    }
}

/// Strategy for a request; `layered = true` forces the layered strategy.
pub fn strategy_for(request: &BuildRequest) -> Strategy {
    if request.layered {
        Strategy::Layered
    } else {
        select_strategy(&request.builder_image)
    }
}
