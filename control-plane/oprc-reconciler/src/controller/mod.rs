pub mod events;
pub mod reconcile;
pub mod render;

pub use reconcile::{error_policy, reconcile, reconcile_app_stack};

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{Controller, reflector, watcher};
use kube::{Api, Client, ResourceExt};
use tracing::{error, info};

use crate::config::ReconcilerConfig;
use crate::crd::AppStack;
use crate::ownership::OWNER_LABEL;
use crate::predicates::{
    filter_events, generation_changed, labels_or_annotations_changed,
    workload_readiness_changed,
};
use crate::store::{KubeStore, ObjectStore};

#[derive(Clone)]
pub struct ControllerContext {
    pub store: Arc<dyn ObjectStore>,
    pub cfg: ReconcilerConfig,
    pub recorder: Option<Recorder>,
}

/// Maps a labelled child back to the stack that owns it.
fn owning_stack<K: ResourceExt>(obj: K) -> Option<ObjectRef<AppStack>> {
    obj.labels().get(OWNER_LABEL).map(|name| ObjectRef::new(name))
}

/// Stack events worth a pass: spec edits and deletions. Status writes leave
/// the generation alone and are dropped.
fn stack_triggers<S>(
    events: S,
) -> impl Stream<Item = Result<AppStack, watcher::Error>> + Send
where
    S: Stream<Item = Result<watcher::Event<AppStack>, watcher::Error>> + Send,
{
    filter_events(events, generation_changed::<AppStack>)
}

pub async fn run_controller(
    client: Client,
    cfg: ReconcilerConfig,
) -> anyhow::Result<()> {
    let api: Api<AppStack> = Api::all(client.clone());
    let recorder = cfg
        .events_enabled()
        .then(|| events::recorder(client.clone(), &cfg.field_manager));
    let watch_owned = cfg.watch_owned();
    let ctx = Arc::new(ControllerContext {
        store: Arc::new(KubeStore::new(client.clone())),
        cfg,
        recorder,
    });

    let (reader, writer) = reflector::store();
    let stacks = stack_triggers(reflector(
        writer,
        watcher(api, watcher::Config::default()),
    ));
    let mut controller = Controller::for_stream(stacks, reader);
    if watch_owned {
        let owned = watcher::Config::default().labels(OWNER_LABEL);
        let deployments: Api<Deployment> = Api::all(client.clone());
        let config_maps: Api<ConfigMap> = Api::all(client);
        controller = controller
            .watches_stream(
                filter_events(
                    watcher(deployments, owned.clone()),
                    workload_readiness_changed::<Deployment>,
                ),
                owning_stack,
            )
            .watches_stream(
                filter_events(
                    watcher(config_maps, owned),
                    labels_or_annotations_changed::<ConfigMap>,
                ),
                owning_stack,
            );
    }

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    info!(stack = %obj_ref.name, "reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    Ok(())
}
