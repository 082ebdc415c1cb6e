//! Detector collaborator.
//!
//! The analytics core never runs a model itself. A [`DetectorBackend`] receives
//! the regions requested for one phase of one batch and answers with detections
//! in unit-frame coordinates; the [`DetectorRegistry`] picks the backend serving
//! each phase.

mod backend;
mod backends;
mod registry;

pub use backend::{DetectRequest, DetectorBackend};
pub use backends::ReplayBackend;
pub use registry::{DetectError, DetectorRegistry};
