//! Fatal pipeline failures.

use std::path::PathBuf;

use thiserror::Error;

use super::BatchState;
use crate::{FrameRange, Phase};

/// Why an analysis run stopped. Nothing is written once one of these is raised.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("encoding failed in the {phase} for frames {range}")]
    Encode {
        phase: Phase,
        range: FrameRange,
        #[source]
        source: anyhow::Error,
    },

    #[error("detection failed in the {phase} for frames {range}")]
    Detect {
        phase: Phase,
        range: FrameRange,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to read frames {range}")]
    Frames {
        range: FrameRange,
        #[source]
        source: anyhow::Error,
    },

    #[error("roi cache rejected frames {range}")]
    Cache {
        range: FrameRange,
        #[source]
        source: anyhow::Error,
    },

    #[error("analysis cancelled before {state} of frames {range}")]
    Cancelled { state: BatchState, range: FrameRange },

    #[error("failed to write results to {}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Frame range the failure belongs to, if any.
    pub fn range(&self) -> Option<FrameRange> {
        match self {
            Self::Encode { range, .. }
            | Self::Detect { range, .. }
            | Self::Frames { range, .. }
            | Self::Cache { range, .. }
            | Self::Cancelled { range, .. } => Some(*range),
            Self::Output { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
