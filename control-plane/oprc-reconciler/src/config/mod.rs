pub mod types;

pub use types::{FeaturesConfig, ReconcilerConfig};
