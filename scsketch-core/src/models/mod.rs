pub mod sample;

// re-export for cleaner imports
pub use self::sample::{CellMetadata, Sample};
