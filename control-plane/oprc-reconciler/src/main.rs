use envconfig::Envconfig;
use kube::Client;
use oprc_reconciler::{config::ReconcilerConfig, controller, init_tracing};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        tracing::debug!(
            ?e,
            "CryptoProvider already installed or incompatible; proceeding"
        );
    }

    let cfg = ReconcilerConfig::init_from_env()?.apply_profile_defaults();
    info!(?cfg, "Starting reconciler");

    let client = Client::try_default().await?;
    controller::run_controller(client, cfg).await
}
