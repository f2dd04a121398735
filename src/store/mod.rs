//! The object-store abstraction and the mapping between stored objects and
//! the in-memory certificate chain.

pub(crate) mod mapping;
mod memory;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Client, Resource};
use snafu::Snafu;

pub use memory::MemoryStore;

use crate::WebhookKind;

/// Annotation marking secrets as managed by this engine. Event filters use
/// it to recognize them.
pub const MANAGED_ANNOTATION: &str = "kubevirt.io/kube-admission-webhook";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object {key} changed since it was read"))]
    Conflict { key: ObjectKey },

    #[snafu(display("object {key} was not found"))]
    NotFound { key: ObjectKey },

    #[snafu(display("object store request for {key} failed"))]
    Store { key: ObjectKey, source: kube::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// The kinds of objects the engine reads and writes. `Service` objects are
/// only ever read, to resolve owner references for the TLS secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    MutatingWebhook,
    ValidatingWebhook,
    Secret,
    Service,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::MutatingWebhook => "Mutating",
            ObjectKind::ValidatingWebhook => "Validating",
            ObjectKind::Secret => "Secret",
            ObjectKind::Service => "Service",
        })
    }
}

impl From<WebhookKind> for ObjectKind {
    fn from(kind: WebhookKind) -> Self {
        match kind {
            WebhookKind::Mutating => ObjectKind::MutatingWebhook,
            WebhookKind::Validating => ObjectKind::ValidatingWebhook,
        }
    }
}

/// Uniquely identifies a stored object. Webhook configurations are
/// cluster-scoped; their namespace is empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectKey {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A stored object, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredObject {
    Mutating(MutatingWebhookConfiguration),
    Validating(ValidatingWebhookConfiguration),
    Secret(Secret),
    Service(Service),
}

impl StoredObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            StoredObject::Mutating(_) => ObjectKind::MutatingWebhook,
            StoredObject::Validating(_) => ObjectKind::ValidatingWebhook,
            StoredObject::Secret(_) => ObjectKind::Secret,
            StoredObject::Service(_) => ObjectKind::Service,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            StoredObject::Mutating(object) => &object.metadata,
            StoredObject::Validating(object) => &object.metadata,
            StoredObject::Secret(object) => &object.metadata,
            StoredObject::Service(object) => &object.metadata,
        }
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            StoredObject::Mutating(object) => &mut object.metadata,
            StoredObject::Validating(object) => &mut object.metadata,
            StoredObject::Secret(object) => &mut object.metadata,
            StoredObject::Service(object) => &mut object.metadata,
        }
    }

    pub fn key(&self) -> ObjectKey {
        let metadata = self.metadata();
        ObjectKey {
            kind: self.kind(),
            namespace: metadata.namespace.clone().unwrap_or_default(),
            name: metadata.name.clone().unwrap_or_default(),
        }
    }
}

/// The object store the persistence adapter runs against. Backed by the
/// Kubernetes API in production ([`KubeStore`]) and by [`MemoryStore`] in
/// tests. Watching for changes is the event-driven runner's concern and is
/// wired directly against the Kubernetes watch API.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches an object; a missing object is `Ok(None)`, not an error.
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>>;

    async fn create(&self, object: &StoredObject) -> Result<()>;

    async fn update(&self, object: &StoredObject) -> Result<()>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

#[async_trait]
impl<S: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<S> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>> {
        (**self).get(key).await
    }

    async fn create(&self, object: &StoredObject) -> Result<()> {
        (**self).create(object).await
    }

    async fn update(&self, object: &StoredObject) -> Result<()> {
        (**self).update(object).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        (**self).delete(key).await
    }
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn clustered<K>(&self) -> Api<K>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }
}

fn store_error(key: &ObjectKey, source: kube::Error) -> Error {
    match &source {
        kube::Error::Api(response) if response.code == 409 => Error::Conflict { key: key.clone() },
        kube::Error::Api(response) if response.code == 404 => Error::NotFound { key: key.clone() },
        _ => Error::Store {
            key: key.clone(),
            source,
        },
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>> {
        let fetched = match key.kind {
            ObjectKind::MutatingWebhook => self
                .clustered::<MutatingWebhookConfiguration>()
                .get_opt(&key.name)
                .await
                .map(|object| object.map(StoredObject::Mutating)),
            ObjectKind::ValidatingWebhook => self
                .clustered::<ValidatingWebhookConfiguration>()
                .get_opt(&key.name)
                .await
                .map(|object| object.map(StoredObject::Validating)),
            ObjectKind::Secret => self
                .namespaced::<Secret>(&key.namespace)
                .get_opt(&key.name)
                .await
                .map(|object| object.map(StoredObject::Secret)),
            ObjectKind::Service => self
                .namespaced::<Service>(&key.namespace)
                .get_opt(&key.name)
                .await
                .map(|object| object.map(StoredObject::Service)),
        };
        fetched.map_err(|err| store_error(key, err))
    }

    async fn create(&self, object: &StoredObject) -> Result<()> {
        let key = object.key();
        let params = PostParams::default();
        let created = match object {
            StoredObject::Mutating(webhook) => self
                .clustered::<MutatingWebhookConfiguration>()
                .create(&params, webhook)
                .await
                .map(|_| ()),
            StoredObject::Validating(webhook) => self
                .clustered::<ValidatingWebhookConfiguration>()
                .create(&params, webhook)
                .await
                .map(|_| ()),
            StoredObject::Secret(secret) => self
                .namespaced::<Secret>(&key.namespace)
                .create(&params, secret)
                .await
                .map(|_| ()),
            StoredObject::Service(service) => self
                .namespaced::<Service>(&key.namespace)
                .create(&params, service)
                .await
                .map(|_| ()),
        };
        created.map_err(|err| store_error(&key, err))
    }

    async fn update(&self, object: &StoredObject) -> Result<()> {
        let key = object.key();
        let params = PostParams::default();
        let updated = match object {
            StoredObject::Mutating(webhook) => self
                .clustered::<MutatingWebhookConfiguration>()
                .replace(&key.name, &params, webhook)
                .await
                .map(|_| ()),
            StoredObject::Validating(webhook) => self
                .clustered::<ValidatingWebhookConfiguration>()
                .replace(&key.name, &params, webhook)
                .await
                .map(|_| ()),
            StoredObject::Secret(secret) => self
                .namespaced::<Secret>(&key.namespace)
                .replace(&key.name, &params, secret)
                .await
                .map(|_| ()),
            StoredObject::Service(service) => self
                .namespaced::<Service>(&key.namespace)
                .replace(&key.name, &params, service)
                .await
                .map(|_| ()),
        };
        updated.map_err(|err| store_error(&key, err))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let params = DeleteParams::default();
        let deleted = match key.kind {
            ObjectKind::MutatingWebhook => self
                .clustered::<MutatingWebhookConfiguration>()
                .delete(&key.name, &params)
                .await
                .map(|_| ()),
            ObjectKind::ValidatingWebhook => self
                .clustered::<ValidatingWebhookConfiguration>()
                .delete(&key.name, &params)
                .await
                .map(|_| ()),
            ObjectKind::Secret => self
                .namespaced::<Secret>(&key.namespace)
                .delete(&key.name, &params)
                .await
                .map(|_| ()),
            ObjectKind::Service => self
                .namespaced::<Service>(&key.namespace)
                .delete(&key.name, &params)
                .await
                .map(|_| ()),
        };
        deleted.map_err(|err| store_error(key, err))
    }
}
