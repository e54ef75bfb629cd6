use crate::api::v1::racdatabase::{RacDatabase, RAC_DATABASE_FINALIZER};
use crate::api::v1::LifecycleState;
use crate::client::{ClusterClient, KubeClusterClient};
use crate::rac::builders::LABEL_DATABASE;
use crate::rac::cleanup::cleanup_owned;
use crate::rac::reconcile::reconcile_database;
use crate::util::config::OperatorConfig;
use crate::util::errors::{Error, ErrorClass, Result, StdError};
use crate::util::metrics::Metrics;
use crate::util::rac_status::StatusManager;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, StatefulSet},
    core::v1::{ConfigMap, PersistentVolumeClaim, Service},
};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{self, finalizer, Event as Finalizer},
        watcher,
    },
    Resource,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context<C: ClusterClient>(
        &self,
        client: C,
        config: OperatorConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Context<C>>> {
        Ok(Arc::new(Context {
            client,
            config,
            metrics: Metrics::new()?.register(&self.registry)?,
            diagnostics: self.diagnostics.clone(),
            cancel,
        }))
    }
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context<C: ClusterClient> {
    /// Cluster access used by the engine
    pub client: C,
    pub config: OperatorConfig,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Fired on shutdown; every poll loop of a pass watches it
    pub cancel: CancellationToken,
}

async fn publish(recorder: Option<&Recorder>, db: &RacDatabase, event: Event) {
    let Some(recorder) = recorder else {
        return;
    };
    if let Err(e) = recorder.publish(&event, &db.object_ref(&())).await {
        warn!("failed to publish event {}: {e}", event.reason);
    }
}

/// Normal reconciliation, with a Warning event when the pass marked the database Failed.
async fn apply<C: ClusterClient>(db: &RacDatabase, ctx: &Context<C>, recorder: Option<&Recorder>) -> Result<Action> {
    let res = reconcile_database(&ctx.client, &ctx.config, &ctx.metrics, &ctx.cancel, db).await;
    if let Err(e) = &res {
        if e.class() == ErrorClass::Fatal {
            publish(
                recorder,
                db,
                Event {
                    type_: EventType::Warning,
                    reason: "ReconcileFailed".into(),
                    note: Some(e.to_string()),
                    action: "Failing".into(),
                    secondary: None,
                },
            )
            .await;
        }
    }
    res
}

// Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
async fn cleanup<C: ClusterClient>(db: &RacDatabase, ctx: &Context<C>, recorder: Option<&Recorder>) -> Result<Action> {
    let ns = db.namespace().unwrap_or_default();
    StatusManager::new(&ctx.client, &ctx.config, &ctx.cancel, &ns, &db.name_any())
        .set_state(LifecycleState::Deleting)
        .await?;
    cleanup_owned(&ctx.client, db, &ctx.config, &ctx.cancel).await?;

    publish(
        recorder,
        db,
        Event {
            type_: EventType::Normal,
            reason: "DeleteRequested".into(),
            note: Some(format!("Delete `{}`", db.name_any())),
            action: "Deleting".into(),
            secondary: None,
        },
    )
    .await;
    Ok(Action::await_change())
}

pub async fn reconcile(db: Arc<RacDatabase>, ctx: Arc<Context<KubeClusterClient>>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("racdatabase");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = db
        .namespace()
        .ok_or_else(|| StdError::MetadataMissing("RacDatabase has no namespace".to_string()))?;
    let client = ctx.client.kube_client();
    let databases: Api<RacDatabase> = Api::namespaced(client.clone(), &ns);
    let recorder = ctx.diagnostics.read().await.recorder(client);

    info!("Reconciling RacDatabase \"{}\" in {}", db.name_any(), ns);
    finalizer(&databases, RAC_DATABASE_FINALIZER, db, |event| async {
        match event {
            Finalizer::Apply(db) => apply(&db, &ctx, Some(&recorder)).await,
            Finalizer::Cleanup(db) => cleanup(&db, &ctx, Some(&recorder)).await,
        }
    })
    .await
    .map_err(|e| Error::StdError(StdError::FinalizerError(Box::new(e))))
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "racdatabase-controller".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// Requeue delay for a failed pass, looking through finalizer wrapping.
fn requeue_after(error: &Error, config: &OperatorConfig) -> Duration {
    match error {
        Error::ErrorWithRequeue(e) => e.duration,
        Error::StdError(StdError::FinalizerError(boxed)) => match boxed.as_ref() {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => requeue_after(e, config),
            _ => config.busy_requeue,
        },
        e => match e.class() {
            ErrorClass::Transient => config.busy_requeue,
            ErrorClass::Blocking | ErrorClass::Fatal => config.error_requeue,
        },
    }
}

fn error_policy<C: ClusterClient>(db: Arc<RacDatabase>, error: &Error, ctx: Arc<Context<C>>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&db, error);
    Action::requeue(requeue_after(error, &ctx.config))
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State, config: OperatorConfig, cancel: CancellationToken) -> Result<()> {
    let client = Client::try_default().await?;

    let databases = Api::<RacDatabase>::all(client.clone());
    if let Err(e) = databases.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(e.into());
    }

    let owned = || watcher::Config::default().labels(LABEL_DATABASE);
    let concurrency = config.max_concurrent_reconciles;
    let ctx = state.to_context(KubeClusterClient::new(client.clone()), config, cancel.clone())?;
    let shutdown = cancel.clone();

    Controller::new(databases, watcher::Config::default().any_semantic())
        .owns(Api::<StatefulSet>::all(client.clone()), owned())
        .owns(Api::<DaemonSet>::all(client.clone()), owned())
        .owns(Api::<ConfigMap>::all(client.clone()), owned())
        .owns(Api::<Service>::all(client.clone()), owned())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), owned())
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("reconciled {}", obj.name),
                Err(e) => debug!("reconcile loop error: {e}"),
            }
        })
        .await;
    info!("RacDatabase controller stopped");
    Ok(())
}
