//! Integration for scsketch: canonical-correlation alignment of the
//! per-sample sketches ([`IntegrationEngine`]) and streaming projection of the
//! shared embedding onto every merged cell ([`ProjectionEngine`]).

pub mod cca;
pub mod integrate;
pub mod project;

pub use integrate::{IntegrationEngine, SampleTransform, SharedEmbedding, SharedSample};
pub use project::{FullEmbedding, ProjectionEngine, ProjectionMethod, SampleSpan};
