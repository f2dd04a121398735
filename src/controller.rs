//! The event-driven runner: watches the cluster objects the engine cares
//! about and keeps one reconcile loop alive, waking on relevant events or on
//! the engine's own requeue deadline, whichever comes first.

use std::fmt::Debug;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;

use crate::manager::Manager;
use crate::store::{KubeStore, MANAGED_ANNOTATION};
use crate::{WebhookKind, WebhookReference};

/// Delay before retrying after a failed reconcile.
const ERROR_RETRY: Duration = Duration::from_secs(5);

/// Whether a secret is managed by this engine, recognized by the engine
/// annotation.
pub fn is_managed_secret(secret: &Secret) -> bool {
    secret
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(MANAGED_ANNOTATION))
}

/// Whether a webhook configuration of the given kind and name is in the
/// managed set.
pub fn is_managed_webhook(
    webhooks: &[WebhookReference],
    kind: WebhookKind,
    name: Option<&str>,
) -> bool {
    let Some(name) = name else {
        return false;
    };
    webhooks
        .iter()
        .any(|webhook| webhook.kind == kind && webhook.name == name)
}

/// Runs the reconcile loop until the watch streams end. Deletions of
/// engine-annotated secrets wake the loop (to recreate them); applied
/// changes to managed webhook configurations wake it as well (to repair the
/// installed bundle). Everything else waits for the requeue deadline the
/// engine predicted.
pub async fn run(manager: &Manager<KubeStore>, client: Client) {
    let secrets: Api<Secret> = Api::all(client.clone());
    let secret_events = watcher(secrets, watcher::Config::default())
        .default_backoff()
        .filter_map(|event| {
            futures::future::ready(match event {
                Ok(watcher::Event::Delete(secret)) if is_managed_secret(&secret) => Some(()),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(error = %err, "secret watch error");
                    None
                }
            })
        });

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let validating: Api<ValidatingWebhookConfiguration> = Api::all(client);
    let mutating_events = webhook_events(mutating, WebhookKind::Mutating, manager.webhooks().to_vec());
    let validating_events =
        webhook_events(validating, WebhookKind::Validating, manager.webhooks().to_vec());

    let mut events = stream::select_all(vec![
        secret_events.boxed(),
        mutating_events.boxed(),
        validating_events.boxed(),
    ]);

    loop {
        let delay = match manager.reconcile().await {
            Ok(delay) => delay,
            Err(err) => {
                tracing::warn!(error = %err, "reconcile failed, requeuing with a short delay");
                ERROR_RETRY
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                tracing::debug!("requeue deadline reached");
            }
            event = events.next() => {
                if event.is_none() {
                    tracing::warn!("watch streams terminated, stopping reconcile loop");
                    return;
                }
                tracing::debug!("relevant cluster event observed");
            }
        }
    }
}

/// Applied events for webhook configurations in the managed set.
fn webhook_events<K>(
    api: Api<K>,
    kind: WebhookKind,
    webhooks: Vec<WebhookReference>,
) -> impl Stream<Item = ()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |event| {
            futures::future::ready(match event {
                Ok(watcher::Event::Apply(webhook) | watcher::Event::InitApply(webhook))
                    if is_managed_webhook(&webhooks, kind, webhook.meta().name.as_deref()) =>
                {
                    Some(())
                }
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(error = %err, "webhook configuration watch error");
                    None
                }
            })
        })
}
