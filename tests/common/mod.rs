//! Shared helpers for the lifecycle tests: a frozen engine clock and
//! builders for the cluster objects the engine operates on.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, ServiceReference, WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use time::OffsetDateTime;
use webhook_cert_manager::crypto::clock;
use webhook_cert_manager::store::{MemoryStore, ObjectKey, ObjectKind, ObjectStore, StoredObject};

static FROZEN_UNIX: AtomicI64 = AtomicI64::new(0);
static EXCLUSIVE: Mutex<()> = Mutex::new(());

/// Freezes the engine clock for the lifetime of the returned guard. Tests
/// manipulating the clock are serialized on the guard; the wall clock is
/// restored on drop.
pub fn freeze() -> FrozenClock {
    let exclusive = EXCLUSIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    FROZEN_UNIX.store(OffsetDateTime::now_utc().unix_timestamp(), Ordering::SeqCst);
    clock::replace(frozen_time);
    FrozenClock {
        _exclusive: exclusive,
    }
}

fn frozen_time() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(FROZEN_UNIX.load(Ordering::SeqCst))
        .expect("frozen timestamp out of range")
}

pub struct FrozenClock {
    _exclusive: MutexGuard<'static, ()>,
}

impl FrozenClock {
    pub fn now(&self) -> OffsetDateTime {
        frozen_time()
    }

    pub fn advance(&self, by: Duration) {
        FROZEN_UNIX.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }
}

impl Drop for FrozenClock {
    fn drop(&mut self) {
        clock::reset();
    }
}

pub fn minutes(count: u64) -> Duration {
    Duration::from_secs(count * 60)
}

/// A mutating webhook configuration whose entries all point at the given
/// backing service.
pub fn mutating_webhook(name: &str, entries: &[&str], service: (&str, &str)) -> StoredObject {
    StoredObject::Mutating(MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        webhooks: Some(
            entries
                .iter()
                .map(|entry| MutatingWebhook {
                    name: entry.to_string(),
                    client_config: WebhookClientConfig {
                        service: Some(ServiceReference {
                            name: service.0.to_string(),
                            namespace: service.1.to_string(),
                            ..ServiceReference::default()
                        }),
                        ..WebhookClientConfig::default()
                    },
                    ..MutatingWebhook::default()
                })
                .collect(),
        ),
    })
}

pub fn backing_service(name: &str, namespace: &str, uid: &str) -> StoredObject {
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

pub async fn get_secret(store: &MemoryStore, namespace: &str, name: &str) -> Option<Secret> {
    let key = ObjectKey::new(ObjectKind::Secret, namespace, name);
    match store.get(&key).await.expect("memory store get") {
        Some(StoredObject::Secret(secret)) => Some(secret),
        Some(_) => panic!("object {key} is not a secret"),
        None => None,
    }
}

pub async fn get_webhook(store: &MemoryStore, name: &str) -> MutatingWebhookConfiguration {
    let key = ObjectKey::new(ObjectKind::MutatingWebhook, "", name);
    match store.get(&key).await.expect("memory store get") {
        Some(StoredObject::Mutating(webhook)) => webhook,
        _ => panic!("webhook configuration {name} not found"),
    }
}
