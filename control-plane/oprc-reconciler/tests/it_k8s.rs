// Integration tests require a running Kubernetes cluster with the AppStack
// CRD applied (`crdgen | kubectl apply -f -`). They are ignored by default.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use oprc_reconciler::config::ReconcilerConfig;
use oprc_reconciler::crd::AppStack;
use oprc_reconciler::ownership::OWNER_LABEL;
use serde_json::json;

mod common;
use common::{stack_spec, uniq};

/// Deletes the stack and its namespace and stops the controller on drop.
struct StackGuard {
    client: Client,
    name: String,
    ctrl: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        if let Some(h) = self.ctrl.take() {
            h.abort();
        }
        let client = self.client.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let stacks: Api<AppStack> = Api::all(client.clone());
            let _ = stacks.delete(&name, &DeleteParams::default()).await;
            let namespaces: Api<Namespace> = Api::all(client);
            let _ = namespaces.delete(&name, &DeleteParams::default()).await;
        });
    }
}

async fn start(name: &str) -> (Client, StackGuard) {
    let client = Client::try_default().await.expect("kube client");
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns: Namespace = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name },
    }))
    .unwrap();
    let _ = namespaces.create(&PostParams::default(), &ns).await;

    let stacks: Api<AppStack> = Api::all(client.clone());
    stacks
        .create(&PostParams::default(), &AppStack::new(name, stack_spec(name)))
        .await
        .expect("create AppStack");

    let cfg = ReconcilerConfig::default();
    let ctrl_client = client.clone();
    let ctrl = tokio::spawn(async move {
        let _ = oprc_reconciler::controller::run_controller(ctrl_client, cfg).await;
    });
    let guard = StackGuard {
        client: client.clone(),
        name: name.to_string(),
        ctrl: Some(ctrl),
    };
    (client, guard)
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..30 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
    false
}

#[test_log::test(tokio::test)]
#[ignore]
async fn controller_creates_labelled_children() {
    let name = uniq("ast-it");
    let (client, _guard) = start(&name).await;

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &name);
    let lp = ListParams::default().labels(&format!("{OWNER_LABEL}={name}"));
    let found = wait_for(|| {
        let deployments = deployments.clone();
        let lp = lp.clone();
        async move {
            deployments
                .list(&lp)
                .await
                .map(|l| !l.items.is_empty())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(found, "Deployment not created for {name}");

    let stacks: Api<AppStack> = Api::all(client.clone());
    let has_status = wait_for(|| {
        let stacks = stacks.clone();
        let name = name.clone();
        async move {
            stacks
                .get(&name)
                .await
                .map(|s| s.status.and_then(|st| st.config_name).is_some())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(has_status, "status.configName never written");
}

#[test_log::test(tokio::test)]
#[ignore]
async fn config_edit_leaves_one_config_version() {
    let name = uniq("ast-it");
    let (client, _guard) = start(&name).await;
    let stacks: Api<AppStack> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &name);
    let lp = ListParams::default().labels(&format!("{OWNER_LABEL}={name}"));

    let first = wait_for(|| {
        let config_maps = config_maps.clone();
        let lp = lp.clone();
        async move {
            config_maps
                .list(&lp)
                .await
                .map(|l| l.items.len() == 1)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(first, "initial config version missing");
    let old_name = config_maps.list(&lp).await.unwrap().items[0].name_any();

    let mut stack = stacks.get(&name).await.expect("get AppStack");
    stack.spec.config.insert("MODE".into(), "v2".into());
    stacks
        .replace(&name, &PostParams::default(), &stack)
        .await
        .expect("update AppStack");

    let rotated = wait_for(|| {
        let config_maps = config_maps.clone();
        let lp = lp.clone();
        let old_name = old_name.clone();
        async move {
            config_maps
                .list(&lp)
                .await
                .map(|l| l.items.len() == 1 && l.items[0].name_any() != old_name)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(rotated, "old config version {old_name} was not pruned");
}
