//! Reads stored objects into a certificate chain and writes the chain back.
//!
//! The read side loops over an object map keyed by [`ObjectKey`] until no
//! unread reference remains: webhook configurations add references to the
//! TLS secret and the backing service of every service-backed client config.
//! The write side is a compare-and-swap per object: skip when mapping the
//! chain back changed nothing, conflict when the store moved on since the
//! read phase.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use snafu::ensure;

use super::{
    ConflictSnafu, NotFoundSnafu, ObjectKey, ObjectKind, ObjectStore, Result, StoredObject,
    MANAGED_ANNOTATION,
};
use crate::chain::{CertificateIssue, ChainData};
use crate::WebhookReference;

const CA_CERT_KEY: &str = "ca.crt";
const CA_PRIVATE_KEY_KEY: &str = "ca.key";
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

const SERVICE_SUBDOMAIN: &str = ".svc";
const CLUSTER_DOMAIN: &str = ".cluster.local";

/// Identity of the engine driving a read or write pass.
pub(crate) struct ReadContext<'a> {
    pub(crate) name: &'a str,
    pub(crate) namespace: &'a str,
    pub(crate) webhooks: &'a [WebhookReference],
    /// When set, a missing object is an error instead of bootstrap state.
    pub(crate) verifying: bool,
}

impl ReadContext<'_> {
    pub(crate) fn ca_secret_name(&self) -> String {
        format!("{}-ca", self.name)
    }

    pub(crate) fn ca_secret_key(&self) -> ObjectKey {
        ObjectKey::new(ObjectKind::Secret, self.namespace, self.ca_secret_name())
    }
}

/// The object map threaded alongside the chain: every store object the
/// current pass touches, plus the owner reference resolved for each TLS
/// secret.
#[derive(Debug, Default)]
pub(crate) struct ObjectMap {
    entries: BTreeMap<ObjectKey, Entry>,
}

#[derive(Debug, Default)]
struct Entry {
    object: Option<StoredObject>,
    owner: Option<OwnerReference>,
}

impl ObjectMap {
    fn insert_pending(&mut self, key: ObjectKey) {
        self.entries.entry(key).or_default();
    }

    fn set_object(&mut self, key: &ObjectKey, object: StoredObject) {
        self.entries.entry(key.clone()).or_default().object = Some(object);
    }

    fn set_owner(&mut self, key: &ObjectKey, owner: OwnerReference) {
        self.entries.entry(key.clone()).or_default().owner = Some(owner);
    }

    fn pending_keys(&self) -> Vec<ObjectKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.object.is_none())
            .map(|(key, _)| key.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }
}

/// Reads all objects related to the managed webhooks and maps them into a
/// fresh chain. Seeds the map with the webhook configurations and the CA
/// secret; service-backed client configs pull in their TLS secret and
/// backing service.
pub(crate) async fn read_chain(
    store: &dyn ObjectStore,
    ctx: &ReadContext<'_>,
) -> Result<(ObjectMap, ChainData)> {
    let mut objects = ObjectMap::default();
    for webhook in ctx.webhooks {
        objects.insert_pending(ObjectKey::new(webhook.kind.into(), "", webhook.name.clone()));
    }
    objects.insert_pending(ctx.ca_secret_key());

    let mut chain = ChainData::default();
    chain.ca.name = ctx.ca_secret_name();

    loop {
        let pending = objects.pending_keys();
        if pending.is_empty() {
            break;
        }
        for key in pending {
            read_object(store, &key, &mut objects, &mut chain, ctx).await?;
        }
    }
    Ok((objects, chain))
}

async fn read_object(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    objects: &mut ObjectMap,
    chain: &mut ChainData,
    ctx: &ReadContext<'_>,
) -> Result<()> {
    tracing::debug!(key = %key, "reading object");
    let fetched = store.get(key).await?;
    // Services are informational (owner references only); their absence is
    // tolerated even while verifying.
    if fetched.is_none() && ctx.verifying && key.kind != ObjectKind::Service {
        return NotFoundSnafu { key: key.clone() }.fail();
    }
    let object = fetched.unwrap_or_else(|| init_object(key));
    match key.kind {
        ObjectKind::MutatingWebhook | ObjectKind::ValidatingWebhook => {
            map_webhook_to_chain(key, object, objects, chain);
        }
        ObjectKind::Secret => map_secret_to_chain(key, object, objects, chain, ctx),
        ObjectKind::Service => map_service_to_chain(key, object, objects),
    }
    Ok(())
}

/// Writes every mapped object back, one compare-and-swap at a time.
pub(crate) async fn write_chain(
    store: &dyn ObjectStore,
    objects: &ObjectMap,
    chain: &ChainData,
    ctx: &ReadContext<'_>,
) -> Result<()> {
    for (key, entry) in &objects.entries {
        let Some(snapshot) = &entry.object else {
            continue;
        };
        write_object(store, key, snapshot, entry.owner.as_ref(), chain, ctx).await?;
    }
    Ok(())
}

async fn write_object(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    snapshot: &StoredObject,
    owner: Option<&OwnerReference>,
    chain: &ChainData,
    ctx: &ReadContext<'_>,
) -> Result<()> {
    let (current, is_new) = match store.get(key).await? {
        Some(existing) => (existing, false),
        None => (snapshot.clone(), true),
    };
    let mut updated = current.clone();
    map_from_chain(key, &mut updated, owner, chain, ctx);

    if updated == *snapshot {
        tracing::debug!(key = %key, "object unchanged, skipping write");
        return Ok(());
    }
    ensure!(*snapshot == current, ConflictSnafu { key: key.clone() });

    if is_new {
        tracing::info!(key = %key, "creating object");
        store.create(&updated).await
    } else {
        tracing::info!(key = %key, "updating object");
        store.update(&updated).await
    }
}

/// A fresh object carrying only its identity, standing in for a store
/// object that does not exist yet.
fn init_object(key: &ObjectKey) -> StoredObject {
    let metadata = ObjectMeta {
        name: Some(key.name.clone()),
        namespace: (!key.namespace.is_empty()).then(|| key.namespace.clone()),
        ..ObjectMeta::default()
    };
    match key.kind {
        ObjectKind::MutatingWebhook => StoredObject::Mutating(MutatingWebhookConfiguration {
            metadata,
            ..MutatingWebhookConfiguration::default()
        }),
        ObjectKind::ValidatingWebhook => StoredObject::Validating(ValidatingWebhookConfiguration {
            metadata,
            ..ValidatingWebhookConfiguration::default()
        }),
        ObjectKind::Secret => StoredObject::Secret(Secret {
            metadata: ObjectMeta {
                annotations: Some(
                    [(MANAGED_ANNOTATION.to_string(), String::new())].into(),
                ),
                ..metadata
            },
            ..Secret::default()
        }),
        ObjectKind::Service => StoredObject::Service(Service {
            metadata,
            ..Service::default()
        }),
    }
}

/// A service-backed client config entry of a webhook configuration.
struct ClientConfigView<'a> {
    entry: &'a str,
    service_name: &'a str,
    service_namespace: &'a str,
    ca_bundle: Option<&'a ByteString>,
}

fn service_client_configs(object: &StoredObject) -> Vec<ClientConfigView<'_>> {
    fn view<'a>(entry: &'a str, config: &'a WebhookClientConfig) -> Option<ClientConfigView<'a>> {
        let service = config.service.as_ref()?;
        Some(ClientConfigView {
            entry,
            service_name: &service.name,
            service_namespace: &service.namespace,
            ca_bundle: config.ca_bundle.as_ref(),
        })
    }
    match object {
        StoredObject::Mutating(webhook) => webhook
            .webhooks
            .iter()
            .flatten()
            .filter_map(|hook| view(&hook.name, &hook.client_config))
            .collect(),
        StoredObject::Validating(webhook) => webhook
            .webhooks
            .iter()
            .flatten()
            .filter_map(|hook| view(&hook.name, &hook.client_config))
            .collect(),
        StoredObject::Secret(_) | StoredObject::Service(_) => Vec::new(),
    }
}

/// Registers the webhook's client configs on the chain. A configuration
/// with no service-backed entry has nothing to bundle into and is dropped
/// from the map for this pass. Every backing service pulls its TLS secret
/// and the service itself into the map.
fn map_webhook_to_chain(
    key: &ObjectKey,
    object: StoredObject,
    objects: &mut ObjectMap,
    chain: &mut ChainData,
) {
    let configs = service_client_configs(&object);
    if configs.is_empty() {
        tracing::debug!(
            key = %key,
            "webhook configuration has no service-backed client configs, dropping"
        );
        objects.entries.remove(key);
        return;
    }

    let mut references = Vec::new();
    for config in configs {
        let hostname = service_hostname(config.service_name, config.service_namespace);
        let issue = chain
            .issues
            .entry(hostname)
            .or_insert_with(|| new_certificate_issue(config.service_name, config.service_namespace));
        let bundle_name = ca_bundle_name(key, config.entry);
        issue.ca_bundles.insert(
            bundle_name,
            config.ca_bundle.map(|bundle| bundle.0.clone()).unwrap_or_default(),
        );
        references.push((
            ObjectKey::new(ObjectKind::Secret, config.service_namespace, config.service_name),
            ObjectKey::new(ObjectKind::Service, config.service_namespace, config.service_name),
        ));
    }
    for (secret_key, service_key) in references {
        objects.insert_pending(secret_key);
        objects.insert_pending(service_key);
    }
    objects.set_object(key, object);
}

fn map_secret_to_chain(
    key: &ObjectKey,
    object: StoredObject,
    objects: &mut ObjectMap,
    chain: &mut ChainData,
    ctx: &ReadContext<'_>,
) {
    if let StoredObject::Secret(secret) = &object {
        if let Some(data) = &secret.data {
            if *key == ctx.ca_secret_key() {
                if let (Some(key_pem), Some(cert_pem)) =
                    (data.get(CA_PRIVATE_KEY_KEY), data.get(CA_CERT_KEY))
                {
                    chain.ca.key_pem = key_pem.0.clone();
                    chain.ca.cert_pem = cert_pem.0.clone();
                }
            } else if let Some(issue) = chain
                .issues
                .get_mut(&service_hostname(&key.name, &key.namespace))
            {
                if let (Some(key_pem), Some(cert_pem)) =
                    (data.get(TLS_PRIVATE_KEY_KEY), data.get(TLS_CERT_KEY))
                {
                    issue.key_pem = key_pem.0.clone();
                    issue.cert_pem = cert_pem.0.clone();
                }
            }
        }
    }
    objects.set_object(key, object);
}

/// Resolves the owner reference the backing service lends to its TLS
/// secret. A service that does not exist yet leaves the secret without an
/// owner until a later pass.
fn map_service_to_chain(key: &ObjectKey, object: StoredObject, objects: &mut ObjectMap) {
    if let StoredObject::Service(service) = &object {
        if let (Some(name), Some(uid)) = (&service.metadata.name, &service.metadata.uid) {
            let owner = OwnerReference {
                api_version: "v1".to_string(),
                kind: "Service".to_string(),
                name: name.clone(),
                uid: uid.clone(),
                ..OwnerReference::default()
            };
            let secret_key = ObjectKey::new(ObjectKind::Secret, &*key.namespace, &*key.name);
            objects.set_owner(&secret_key, owner);
        }
    }
    objects.set_object(key, object);
}

fn map_from_chain(
    key: &ObjectKey,
    object: &mut StoredObject,
    owner: Option<&OwnerReference>,
    chain: &ChainData,
    ctx: &ReadContext<'_>,
) {
    match object {
        StoredObject::Mutating(webhook) => {
            for hook in webhook.webhooks.iter_mut().flatten() {
                apply_ca_bundle(key, &hook.name, &mut hook.client_config, chain);
            }
        }
        StoredObject::Validating(webhook) => {
            for hook in webhook.webhooks.iter_mut().flatten() {
                apply_ca_bundle(key, &hook.name, &mut hook.client_config, chain);
            }
        }
        StoredObject::Secret(secret) => {
            if *key == ctx.ca_secret_key() {
                populate_ca_secret(secret, chain);
            } else {
                populate_tls_secret(secret, key, owner, chain);
            }
        }
        // Services are only read, never written.
        StoredObject::Service(_) => {}
    }
}

fn apply_ca_bundle(
    key: &ObjectKey,
    entry: &str,
    config: &mut WebhookClientConfig,
    chain: &ChainData,
) {
    let Some(service) = &config.service else {
        return;
    };
    let hostname = service_hostname(&service.name, &service.namespace);
    let Some(issue) = chain.issues.get(&hostname) else {
        return;
    };
    let Some(pem) = issue.ca_bundles.get(&ca_bundle_name(key, entry)) else {
        return;
    };
    config.ca_bundle = Some(ByteString(pem.clone()));
}

fn populate_ca_secret(secret: &mut Secret, chain: &ChainData) {
    secret.type_ = Some("Opaque".to_string());
    secret
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(MANAGED_ANNOTATION.to_string(), String::new());
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.insert(
        CA_PRIVATE_KEY_KEY.to_string(),
        ByteString(chain.ca.key_pem.clone()),
    );
    data.insert(CA_CERT_KEY.to_string(), ByteString(chain.ca.cert_pem.clone()));
}

fn populate_tls_secret(
    secret: &mut Secret,
    key: &ObjectKey,
    owner: Option<&OwnerReference>,
    chain: &ChainData,
) {
    let Some(issue) = chain.issues.get(&service_hostname(&key.name, &key.namespace)) else {
        return;
    };
    secret.type_ = Some("kubernetes.io/tls".to_string());
    secret
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(MANAGED_ANNOTATION.to_string(), String::new());
    if let Some(owner) = owner {
        secret.metadata.owner_references = Some(vec![owner.clone()]);
    }
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.insert(
        TLS_PRIVATE_KEY_KEY.to_string(),
        ByteString(issue.key_pem.clone()),
    );
    data.insert(TLS_CERT_KEY.to_string(), ByteString(issue.cert_pem.clone()));
}

fn ca_bundle_name(webhook_key: &ObjectKey, entry: &str) -> String {
    format!("{webhook_key}-{entry}")
}

fn namespaced_hostname(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}")
}

pub(crate) fn service_hostname(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}{SERVICE_SUBDOMAIN}")
}

fn service_fqdn(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}{SERVICE_SUBDOMAIN}{CLUSTER_DOMAIN}")
}

fn new_certificate_issue(name: &str, namespace: &str) -> CertificateIssue {
    let common_name = service_hostname(name, namespace);
    let hostnames = vec![
        name.to_string(),
        namespaced_hostname(name, namespace),
        common_name.clone(),
        service_fqdn(name, namespace),
    ];
    CertificateIssue::new(common_name, Vec::new(), hostnames)
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use k8s_openapi::api::admissionregistration::v1::{
        MutatingWebhook, MutatingWebhookConfiguration, ServiceReference, WebhookClientConfig,
    };
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::StoredObject;

    /// A mutating webhook configuration with one client config per entry;
    /// `Some((service, namespace))` makes the entry service-backed, `None`
    /// makes it URL-backed.
    pub(crate) fn mutating_webhook(
        name: &str,
        entries: &[(&str, Option<(&str, &str)>)],
    ) -> StoredObject {
        StoredObject::Mutating(MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            webhooks: Some(
                entries
                    .iter()
                    .map(|(entry, service)| MutatingWebhook {
                        name: entry.to_string(),
                        client_config: WebhookClientConfig {
                            service: service.map(|(svc, ns)| ServiceReference {
                                name: svc.to_string(),
                                namespace: ns.to_string(),
                                ..ServiceReference::default()
                            }),
                            url: service.is_none().then(|| "https://example".to_string()),
                            ..WebhookClientConfig::default()
                        },
                        ..MutatingWebhook::default()
                    })
                    .collect(),
            ),
        })
    }

    pub(crate) fn service(name: &str, namespace: &str, uid: &str) -> StoredObject {
        StoredObject::Service(Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(uid.to_string()),
                ..ObjectMeta::default()
            },
            ..Service::default()
        })
    }
}
