use std::sync::Arc;

use anyhow::Context;
use podcap_api::{BackendApiAdapter, HttpApi, axum::Router};
use podcap_core::{
    AnnotationReconciler, CaptureBackend, ClusterCache, ClusterEvent, CoreError, EventHandler,
    MetricsHandle, Reconciler, StatusClient, dispatch_events,
};
use podcap_exec::{CaptureSupervisor, CriResolver};
use podcap_prometheus::PrometheusMetrics;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AgentConfig;

/// A fully wired node agent.
///
/// Start-up order in [`Agent::run`]: HTTP server, event dispatch, reconcilers (which wait for
/// the cache to sync). On shutdown every task is joined and then live captures are stopped
/// with their files kept.
pub struct Agent {
    cfg: AgentConfig,
    supervisor: CaptureSupervisor,
    metrics: PrometheusMetrics,
    reconciler: Reconciler,
    annotations: Option<AnnotationReconciler>,
}

impl Agent {
    /// Wire an agent that resolves container pids through `crictl` and captures with
    /// `nsenter` + `tcpdump`.
    pub fn new(
        cfg: AgentConfig,
        cache: Arc<dyn ClusterCache>,
        status: Arc<dyn StatusClient>,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        let supervisor = CaptureSupervisor::new(cfg.supervisor_config())
            .context("capture supervisor")?
            .with_resolver(Arc::new(CriResolver::new(cfg.cri_socket.clone())));
        Self::with_supervisor(cfg, cache, status, supervisor)
    }

    /// Wire an agent around an already configured supervisor.
    pub fn with_supervisor(
        cfg: AgentConfig,
        cache: Arc<dyn ClusterCache>,
        status: Arc<dyn StatusClient>,
        supervisor: CaptureSupervisor,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        let metrics = PrometheusMetrics::new().context("metrics registry")?;
        let handle: MetricsHandle = Arc::new(metrics.clone());

        let supervisor = supervisor.with_metrics(handle.clone());
        let backend: Arc<dyn CaptureBackend> = Arc::new(supervisor.clone());

        let reconciler = Reconciler::builder(
            cfg.reconciler_config(),
            cache.clone(),
            status,
            backend.clone(),
        )
        .metrics(handle.clone())
        .build();

        let annotations = cfg.annotations.then(|| {
            AnnotationReconciler::new(cfg.reconciler_config(), cache, backend)
                .with_metrics(handle)
        });

        info!(
            target: "podcap.agent",
            node = %cfg.node_name,
            dir = %cfg.capture_dir.display(),
            max_concurrent = cfg.max_concurrent,
            annotations = cfg.annotations,
            "agent wired"
        );
        Ok(Self {
            cfg,
            supervisor,
            metrics,
            reconciler,
            annotations,
        })
    }

    pub fn supervisor(&self) -> &CaptureSupervisor {
        &self.supervisor
    }

    pub fn metrics(&self) -> &PrometheusMetrics {
        &self.metrics
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// HTTP routes served by [`Agent::run`].
    pub fn router(&self) -> Router {
        let adapter = BackendApiAdapter::new(
            Arc::new(self.supervisor.clone()),
            self.cfg.capture_dir.clone(),
        )
        .with_metrics(self.metrics.clone());
        HttpApi::new(Arc::new(adapter)).router()
    }

    /// Run until `cancel` fires or a component fails, then shut everything down.
    ///
    /// A failing component cancels the others; its error is returned after shutdown.
    pub async fn run(
        self,
        events: mpsc::UnboundedReceiver<ClusterEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

        if let Some(addr) = self.cfg.http_addr {
            let router = self.router();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                podcap_api::serve(addr, router, cancel)
                    .await
                    .with_context(|| format!("http server on {addr}"))
            });
        }

        let mut handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(self.reconciler.clone())];
        if let Some(annotations) = &self.annotations {
            handlers.push(Arc::new(annotations.clone()));
        }
        {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                dispatch_events(events, handlers, cancel).await;
                Ok(())
            });
        }

        {
            let reconciler = self.reconciler.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let res = reconciler.run(cancel.clone()).await;
                stopped_by(res, &cancel).context("job reconciler")
            });
        }
        if let Some(annotations) = self.annotations.clone() {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let res = annotations.run(cancel.clone()).await;
                stopped_by(res, &cancel).context("annotation reconciler")
            });
        }

        info!(target: "podcap.agent", node = %self.cfg.node_name, "agent running");

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let res = match joined {
                Ok(res) => res,
                Err(e) => Err(anyhow::Error::new(e).context("agent task panicked")),
            };
            if let Err(e) = res {
                error!(target: "podcap.agent", error = %format_args!("{e:#}"), "agent component failed");
                cancel.cancel();
                first_err.get_or_insert(e);
            }
        }

        self.supervisor.shutdown().await;
        info!(target: "podcap.agent", "agent stopped");
        first_err.map_or(Ok(()), Err)
    }
}

/// A reconciler that gave up waiting for the cache because of shutdown did not fail.
fn stopped_by(res: Result<(), CoreError>, cancel: &CancellationToken) -> Result<(), CoreError> {
    match res {
        Err(CoreError::CacheSync) if cancel.is_cancelled() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests;
