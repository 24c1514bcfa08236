pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod gc;
pub mod ownership;
pub mod pass;
pub mod predicates;
pub mod status;
pub mod store;
pub mod versioner;

pub use error::ReconcileError;
pub use ownership::{OwnerIdentity, TouchedSet, TrackingClient};
pub use pass::{PassOutcome, ReconcilePass};
pub use store::{KindScope, ManagedKind, ObjectKey, ObjectStore, StoreError};

use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

pub fn init_tracing(default_env: &str) {
    let filter = EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .from_env_lossy()
        .add_directive(
            default_env
                .parse()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        );

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}
