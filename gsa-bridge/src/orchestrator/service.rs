//! The orchestrator owns the service lifecycle.
//!
//! `start()` brings up the document listener, the dashboard, the connector,
//! the incremental poller and the full-listing schedule. `stop()` tears them
//! down in reverse. Configuration changes arrive through a listener on the
//! [`ConfigStore`] and are applied by a supervisor task: a schedule change is
//! a reschedule in place, anything else a full restart.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::BridgeContext;
use super::lifecycle::LifecycleState;
use super::reload::{ReloadListener, ReloadPlan, ServiceConfigValidator, check_service_config};
use crate::config::keys::{SERVER_DASHBOARD_PORT, SERVER_PORT};
use crate::config::{ConfigStore, ListenerId};
use crate::connector::{Connector, ConnectorContext};
use crate::logging::LoggingConfig;
use crate::push::{
    DocIdCodec, DocIdPusher, DocIdSender, FeedSink, Journal, LoggingFeedSink, PercentDocIdCodec,
};
use crate::scheduler::{
    BackoffConfig, CronScheduler, ExclusiveTask, GuardedTask, IncrementalPoller, InitBackoff,
    JobId, ScheduledJob,
};
use crate::server::{
    AdmissionPool, DashboardState, DocumentState, HttpServer, PushTrigger, SessionManager, bind,
    dashboard_router, document_router,
};
use crate::status::{LastPushStatusSource, StatusRegistry};
use crate::transform::{TransformPipeline, TransformRegistry};
use crate::{Error, Result};

/// Time in-flight work gets when a configuration change forces a restart.
pub const RESTART_STOP_DELAY: Duration = Duration::from_secs(3);

/// Full push of every document id, run under the exclusive guard.
struct FullPush {
    connector: Arc<dyn Connector>,
    sender: Arc<DocIdSender>,
}

#[async_trait]
impl GuardedTask for FullPush {
    async fn run(&self, cancel: CancellationToken) {
        self.sender
            .push_doc_ids_from_connector(self.connector.as_ref(), &cancel)
            .await;
    }
}

impl PushTrigger for ExclusiveTask {
    fn push_now(&self) -> bool {
        self.run_in_new_task().is_some()
    }
}

/// Everything that exists only while the service runs. Fields are filled in
/// start order so a failed start can tear down exactly what it brought up.
#[derive(Default)]
struct Services {
    document: Option<HttpServer>,
    dashboard: Option<HttpServer>,
    aux_cancel: Option<CancellationToken>,
    connector_initialized: bool,
    poller: Option<IncrementalPoller>,
    job: Option<JobId>,
}

/// Addresses and ids readable without waiting on the lifecycle lock.
#[derive(Default)]
struct Published {
    document_addr: Option<SocketAddr>,
    dashboard_addr: Option<SocketAddr>,
    job: Option<JobId>,
}

struct Inner {
    config: Arc<ConfigStore>,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn DocIdCodec>,
    sender: Arc<DocIdSender>,
    journal: Arc<Journal>,
    status: Arc<StatusRegistry>,
    sessions: Arc<SessionManager>,
    transforms: Arc<TransformRegistry>,
    logging: Option<Arc<LoggingConfig>>,
    backoff: BackoffConfig,
    scheduler: CronScheduler,
    full_push: Arc<ExclusiveTask>,

    /// Serializes start, stop and restart.
    lifecycle: tokio::sync::Mutex<Option<Services>>,
    state: RwLock<LifecycleState>,
    published: RwLock<Published>,

    shutdown: CancellationToken,
    fatal: watch::Sender<Option<Arc<Error>>>,
    listener_id: ListenerId,
    validator_id: ListenerId,
    plans: Mutex<Option<mpsc::UnboundedReceiver<ReloadPlan>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: Arc<ConfigStore>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn FeedSink>,
    transforms: TransformRegistry,
    logging: Option<Arc<LoggingConfig>>,
    backoff: BackoffConfig,
    codec: Option<Arc<dyn DocIdCodec>>,
}

impl OrchestratorBuilder {
    /// Destination of pushed feed batches. Defaults to [`LoggingFeedSink`].
    pub fn feed_sink(mut self, sink: Arc<dyn FeedSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn transform_registry(mut self, registry: TransformRegistry) -> Self {
        self.transforms = registry;
        self
    }

    /// Enables the dashboard log filter endpoints.
    pub fn logging(mut self, logging: Arc<LoggingConfig>) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn init_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn doc_id_codec(mut self, codec: Arc<dyn DocIdCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> Orchestrator {
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(PercentDocIdCodec::new(self.config.clone())));
        let journal = Arc::new(Journal::new());
        let sender = Arc::new(DocIdSender::new(
            self.config.clone(),
            codec.clone(),
            self.sink,
            journal.clone(),
        ));

        let full_push = Arc::new(ExclusiveTask::new(
            "full-push",
            Arc::new(FullPush {
                connector: self.connector.clone(),
                sender: sender.clone(),
            }),
            || warn!("Full push already in progress, skipping scheduled run"),
        ));

        let (plans_tx, plans_rx) = mpsc::unbounded_channel();
        let transforms = Arc::new(self.transforms);
        let validator_id = self
            .config
            .add_validator(Arc::new(ServiceConfigValidator::new(transforms.clone())));
        let listener_id = self
            .config
            .add_listener(Arc::new(ReloadListener::new(plans_tx)));
        let (fatal, _) = watch::channel(None);

        Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                connector: self.connector,
                codec,
                sender,
                journal,
                status: Arc::new(StatusRegistry::new()),
                sessions: Arc::new(SessionManager::default()),
                transforms,
                logging: self.logging,
                backoff: self.backoff,
                scheduler: CronScheduler::new(),
                full_push,
                lifecycle: tokio::sync::Mutex::new(None),
                state: RwLock::new(LifecycleState::Stopped),
                published: RwLock::new(Published::default()),
                shutdown: CancellationToken::new(),
                fatal,
                listener_id,
                validator_id,
                plans: Mutex::new(Some(plans_rx)),
                supervisor: Mutex::new(None),
            }),
        }
    }
}

/// Runs the bridge for one connector.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(config: Arc<ConfigStore>, connector: Arc<dyn Connector>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            connector,
            sink: Arc::new(LoggingFeedSink),
            transforms: TransformRegistry::with_builtins(),
            logging: None,
            backoff: BackoffConfig::default(),
            codec: None,
        }
    }

    /// Start the service. Fails with [`Error::AlreadyStarted`] unless stopped.
    ///
    /// Connector initialization is retried until it succeeds or
    /// [`begin_shutdown`](Self::begin_shutdown) is called.
    pub async fn start(&self) -> Result<()> {
        self.ensure_supervisor();

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() || self.state() != LifecycleState::Stopped {
            return Err(Error::AlreadyStarted);
        }

        self.inner.set_state(LifecycleState::Starting);
        match self.inner.start_services().await {
            Ok(services) => {
                *lifecycle = Some(services);
                self.inner.set_state(LifecycleState::Running);
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(LifecycleState::Stopped);
                Err(e)
            }
        }
    }

    /// Stop the service, giving in-flight requests up to `max_delay`.
    /// Stopping a stopped service does nothing.
    pub async fn stop(&self, max_delay: Duration) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(services) = lifecycle.take() else {
            debug!("Stop requested but the service is not running");
            return;
        };

        self.inner.set_state(LifecycleState::Stopping);
        self.inner.teardown(services, max_delay).await;
        self.inner.set_state(LifecycleState::Stopped);
    }

    /// Abort connector initialization retries and stop applying
    /// configuration changes. Call before the final [`stop`](Self::stop).
    pub fn begin_shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Start a full push on a new task unless one is already running.
    /// Returns whether a push was started.
    pub fn check_and_schedule_immediate_push_of_doc_ids(&self) -> bool {
        if self.state() != LifecycleState::Running {
            warn!(state = %self.state(), "Not pushing document ids, service is not running");
            return false;
        }
        if self.inner.full_push.run_in_new_task().is_some() {
            info!("Full push of document ids scheduled");
            true
        } else {
            warn!("Full push already in progress");
            false
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.read()
    }

    /// Expression currently driving the full-listing job.
    pub fn full_listing_schedule(&self) -> Option<String> {
        let job = self.inner.published.read().job?;
        self.inner.scheduler.expression(job)
    }

    pub fn document_addr(&self) -> Option<SocketAddr> {
        self.inner.published.read().document_addr
    }

    pub fn dashboard_addr(&self) -> Option<SocketAddr> {
        self.inner.published.read().dashboard_addr
    }

    /// Receives the error that made an automatic restart fail.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<Arc<Error>>> {
        self.inner.fatal.subscribe()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.inner.config
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.inner.journal
    }

    pub fn status(&self) -> &Arc<StatusRegistry> {
        &self.inner.status
    }

    pub fn doc_id_pusher(&self) -> Arc<dyn DocIdPusher> {
        self.inner.sender.clone()
    }

    fn ensure_supervisor(&self) {
        let Some(plans) = self.inner.plans.lock().take() else {
            return;
        };
        let handle = tokio::spawn(reload_supervisor(
            Arc::downgrade(&self.inner),
            plans,
            self.inner.shutdown.clone(),
        ));
        *self.inner.supervisor.lock() = Some(handle);
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.inner.config.remove_listener(self.inner.listener_id);
        self.inner.config.remove_validator(self.inner.validator_id);
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            warn!(from = %*state, to = %next, "Unexpected lifecycle transition");
        }
        debug!(from = %*state, to = %next, "Lifecycle transition");
        *state = next;
    }

    async fn start_services(&self) -> Result<Services> {
        let mut services = Services::default();
        match self.bring_up(&mut services).await {
            Ok(()) => {
                info!("Service started");
                Ok(services)
            }
            Err(e) => {
                error!(error = %e, "Start failed, tearing down");
                self.teardown(services, Duration::ZERO).await;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, services: &mut Services) -> Result<()> {
        let config = self.config.snapshot();
        check_service_config(&config, &self.transforms)?;

        // Document listener first; a bind failure is not retried.
        let listener = bind(config.server_port()?).await?;
        let document_addr = listener.local_addr()?;
        if config.server_port()? == 0 {
            self.config
                .set_value(SERVER_PORT, document_addr.port().to_string());
        }
        let config = self.config.snapshot();

        let pool = Arc::new(AdmissionPool::new(
            config.max_worker_threads()?,
            config.queue_capacity()?,
        ));
        let transform = TransformPipeline::from_config(&config, &self.transforms)?.map(Arc::new);
        let router = document_router(
            DocumentState {
                config: self.config.clone(),
                connector: self.connector.clone(),
                codec: self.codec.clone(),
                journal: self.journal.clone(),
                transform,
            },
            pool.clone(),
            &config.doc_id_path()?,
            config.use_compression()?,
        );
        services.document = Some(HttpServer::serve("document", listener, router)?);
        self.published.write().document_addr = Some(document_addr);
        info!(
            gsa = %config.gsa_hostname()?,
            "Serving documents at {}{}",
            document_addr,
            config.doc_id_path()?
        );

        // Auxiliary subsystems: sessions, status and the dashboard.
        let aux_cancel = CancellationToken::new();
        self.sessions.start_cleanup_task(aux_cancel.clone());
        services.aux_cancel = Some(aux_cancel);
        self.status
            .add(Arc::new(LastPushStatusSource::new(self.journal.clone())));

        let dashboard_listener = bind(config.dashboard_port()?).await?;
        let dashboard_addr = dashboard_listener.local_addr()?;
        if config.dashboard_port()? == 0 {
            self.config
                .set_value(SERVER_DASHBOARD_PORT, dashboard_addr.port().to_string());
        }
        let dashboard = dashboard_router(DashboardState {
            config: self.config.clone(),
            journal: self.journal.clone(),
            status: self.status.clone(),
            sessions: self.sessions.clone(),
            admission: pool,
            push: self.full_push.clone(),
            logging: self.logging.clone(),
            port: dashboard_addr.port(),
        });
        services.dashboard = Some(HttpServer::serve("dashboard", dashboard_listener, dashboard)?);
        self.published.write().dashboard_addr = Some(dashboard_addr);

        self.init_connector().await?;
        services.connector_initialized = true;

        let config = self.config.snapshot();
        if self.connector.supports_incremental() {
            services.poller = Some(IncrementalPoller::start(
                self.connector.clone(),
                self.sender.clone(),
                config.incremental_poll_period()?,
            ));
        }

        self.scheduler.start();
        let schedule = config.full_listing_schedule()?;
        let job = self
            .scheduler
            .schedule(&schedule, self.full_push.clone() as Arc<dyn ScheduledJob>)?;
        services.job = Some(job);
        self.published.write().job = Some(job);
        Ok(())
    }

    /// Retry connector initialization with exponential backoff, re-checking
    /// the configuration file after every failure.
    async fn init_connector(&self) -> Result<()> {
        let context: Arc<dyn ConnectorContext> = Arc::new(BridgeContext::new(
            self.config.clone(),
            self.sender.clone(),
            self.codec.clone(),
            self.status.clone(),
        ));
        let mut backoff = InitBackoff::new(self.backoff);

        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::ShuttingDown);
            }

            let error = match self.connector.init(context.clone()).await {
                Ok(()) => {
                    info!(attempts = backoff.attempts() + 1, "Connector initialized");
                    return Ok(());
                }
                Err(e) => e,
            };

            let delay = backoff.next_delay();
            warn!(
                error = %error,
                attempt = backoff.attempts(),
                retry_in_secs = delay.as_secs_f64(),
                "Connector initialization failed"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::ShuttingDown),
                _ = tokio::time::sleep(delay) => {}
            }
            self.config.ensure_latest_config_loaded().await;
        }
    }

    /// Stop whatever `services` holds, in reverse start order.
    async fn teardown(&self, services: Services, max_delay: Duration) {
        if let Some(job) = services.job {
            self.scheduler.deschedule(job);
        }
        self.published.write().job = None;

        if !self.full_push.stop(max_delay).await {
            warn!("Full push did not stop in time");
        }
        self.scheduler.stop().await;

        if let Some(poller) = services.poller {
            poller.cancel();
        }

        if let Some(document) = services.document {
            document.stop(max_delay).await;
        }
        self.published.write().document_addr = None;

        if let Some(dashboard) = services.dashboard {
            dashboard.stop(max_delay).await;
        }
        if let Some(aux_cancel) = services.aux_cancel {
            aux_cancel.cancel();
        }
        self.status.remove(LastPushStatusSource::NAME);
        self.published.write().dashboard_addr = None;

        if services.connector_initialized {
            self.connector.destroy().await;
        }
        info!("Service stopped");
    }

    async fn apply(&self, plan: ReloadPlan) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(services) = lifecycle.as_mut() else {
            debug!(?plan, "Service not running, ignoring configuration change");
            return;
        };

        match plan {
            ReloadPlan::Reschedule(schedule) => {
                let Some(job) = services.job else {
                    return;
                };
                if let Err(e) = self.scheduler.reschedule(job, &schedule) {
                    warn!(error = %e, "Keeping previous full listing schedule");
                }
            }
            ReloadPlan::Restart(keys) => {
                info!(?keys, "Restarting to apply configuration changes");
                let Some(services) = lifecycle.take() else {
                    return;
                };
                self.set_state(LifecycleState::Stopping);
                self.teardown(services, RESTART_STOP_DELAY).await;

                self.set_state(LifecycleState::Starting);
                match self.start_services().await {
                    Ok(services) => {
                        *lifecycle = Some(services);
                        self.set_state(LifecycleState::Running);
                    }
                    Err(e) => {
                        self.set_state(LifecycleState::Stopped);
                        error!(error = %e, "Automatic restart failed");
                        self.fatal
                            .send_replace(Some(Arc::new(Error::RestartFailed(e.to_string()))));
                    }
                }
            }
        }
    }
}

/// Applies configuration plans one at a time, merging plans that queued up
/// while the previous one ran.
async fn reload_supervisor(
    inner: Weak<Inner>,
    mut plans: mpsc::UnboundedReceiver<ReloadPlan>,
    shutdown: CancellationToken,
) {
    loop {
        let mut plan = tokio::select! {
            _ = shutdown.cancelled() => break,
            plan = plans.recv() => match plan {
                Some(plan) => plan,
                None => break,
            },
        };
        while let Ok(later) = plans.try_recv() {
            plan = plan.merge(later);
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply(plan).await;
    }
    debug!("Reload supervisor stopped");
}
