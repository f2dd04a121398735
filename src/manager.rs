//! The reconciler: one advisory lock, one read-update-write tick, and the
//! requeue delay telling the caller when the next tick is due.

use std::time::Duration;

use snafu::{ensure, ResultExt, Snafu};
use tokio::sync::Mutex;

use crate::chain;
use crate::crypto::clock;
use crate::options::{self, Options};
use crate::store::{mapping, ObjectStore};
use crate::WebhookReference;

/// Attempts per tick when writes hit optimistic-concurrency conflicts.
const CONFLICT_RETRIES: u32 = 5;
/// Base backoff between conflict retries; doubles per attempt.
const CONFLICT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed validating certificate options"))]
    InvalidOptions { source: options::Error },

    #[snafu(display("at least one webhook configuration must be managed"))]
    NoWebhooks,

    #[snafu(display("failed reading certificate chain from the object store"))]
    Read { source: crate::store::Error },

    #[snafu(display("failed updating certificate chain"))]
    Update { source: chain::Error },

    #[snafu(display("failed writing certificate chain to the object store"))]
    Write { source: crate::store::Error },

    #[snafu(display("failed verifying certificate chain"))]
    Verify { source: chain::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn is_conflict(&self) -> bool {
        match self {
            Error::Read { source } | Error::Write { source } => source.is_conflict(),
            _ => false,
        }
    }
}

/// Drives the certificate chain of a set of managed webhook configurations:
/// a CA secret owned by the engine, a TLS secret per backing service and the
/// CA bundle of every client-config entry.
///
/// Exactly one instance per managed webhook set may be active at a time
/// across the cluster; leader election is the caller's responsibility.
/// Within the process, a single advisory lock serializes [`reconcile`] and
/// [`verify`] ticks.
///
/// [`reconcile`]: Manager::reconcile
/// [`verify`]: Manager::verify
pub struct Manager<S> {
    name: String,
    namespace: String,
    store: S,
    options: Options,
    webhooks: Vec<WebhookReference>,
    active: Mutex<()>,
}

impl<S: ObjectStore> Manager<S> {
    /// Validates the options and builds the engine. Invalid options are a
    /// construction-time error and are never retried.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        store: S,
        options: Options,
        webhooks: Vec<WebhookReference>,
    ) -> Result<Self> {
        let options = options.normalized().context(InvalidOptionsSnafu)?;
        ensure!(!webhooks.is_empty(), NoWebhooksSnafu);
        Ok(Manager {
            name: name.into(),
            namespace: namespace.into(),
            store,
            options,
            webhooks,
            active: Mutex::new(()),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn webhooks(&self) -> &[WebhookReference] {
        &self.webhooks
    }

    /// One reconcile tick: read the chain from the store, bring it current,
    /// write it back. Returns how long the caller can sleep before the next
    /// tick is due. Write conflicts are retried a few times within the tick,
    /// re-reading the chain each attempt.
    ///
    /// Dropping the returned future between store operations aborts the tick
    /// cleanly: per-object writes are atomic at the store, no state is
    /// cached across ticks, and the next tick re-reads everything.
    pub async fn reconcile(&self) -> Result<Duration> {
        let _active = self.active.lock().await;
        let mut attempt = 0;
        loop {
            match self.reconcile_once().await {
                Err(err) if err.is_conflict() && attempt + 1 < CONFLICT_RETRIES => {
                    attempt += 1;
                    let backoff = CONFLICT_BACKOFF * 2u32.pow(attempt - 1);
                    tracing::info!(
                        attempt,
                        backoff = ?backoff,
                        "write conflict, retrying reconcile"
                    );
                    tokio::time::sleep(backoff).await;
                }
                outcome => return outcome,
            }
        }
    }

    async fn reconcile_once(&self) -> Result<Duration> {
        let ctx = self.read_context(false);
        let (objects, mut chain) =
            mapping::read_chain(&self.store, &ctx).await.context(ReadSnafu)?;
        let update_at = chain::update(&self.options, &mut chain).context(UpdateSnafu)?;
        mapping::write_chain(&self.store, &objects, &chain, &ctx)
            .await
            .context(WriteSnafu)?;

        let now = clock::now();
        let requeue = if update_at > now {
            (update_at - now).try_into().unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };
        tracing::info!(requeue = ?requeue, "certificate chain reconciled");
        Ok(requeue)
    }

    /// Verifies that the persisted chain is complete and consistent. Unlike
    /// [`reconcile`](Manager::reconcile), a missing object is an error here;
    /// TLS servers poll this until it succeeds before they start serving.
    pub async fn verify(&self) -> Result<()> {
        let _active = self.active.lock().await;
        let ctx = self.read_context(true);
        let (_objects, mut chain) =
            mapping::read_chain(&self.store, &ctx).await.context(ReadSnafu)?;
        chain::verify(&self.options, &mut chain).context(VerifySnafu)
    }

    fn read_context(&self, verifying: bool) -> mapping::ReadContext<'_> {
        mapping::ReadContext {
            name: &self.name,
            namespace: &self.namespace,
            webhooks: &self.webhooks,
            verifying,
        }
    }
}
