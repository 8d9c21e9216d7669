//! Client/server scenario orchestration
//!
//! [`TestSetup::run`] allocates ports, publishes the initial snapshots,
//! launches the server proxy and then the client proxy (waiting for each to
//! become ready), starts the configured backends, runs the test body and
//! always tears everything down again.

use crate::backend::{HttpBackend, TcpBackend, TlsIdentity};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::poller::StatsPoller;
use crate::ports::{PortAllocator, PortBlock};
use crate::process::{LiveRegistry, ProxyInstance, ProxyLauncher, Role, StopOutcome};
use crate::snapshot::{Snapshot, SnapshotCache, Update};
use dashmap::DashMap;
use futures::FutureExt;
use hyper::HeaderMap;
use rustls::pki_types::CertificateDer;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Renders the bootstrap a proxy of `role` is launched with
pub trait BootstrapRenderer: Send + Sync {
    fn render(&self, role: Role, ports: &PortBlock) -> anyhow::Result<String>;
}

impl<F> BootstrapRenderer for F
where
    F: Fn(Role, &PortBlock) -> anyhow::Result<String> + Send + Sync,
{
    fn render(&self, role: Role, ports: &PortBlock) -> anyhow::Result<String> {
        self(role, ports)
    }
}

/// Renders [`default_bootstrap`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBootstrap;

impl BootstrapRenderer for DefaultBootstrap {
    fn render(&self, role: Role, ports: &PortBlock) -> anyhow::Result<String> {
        Ok(default_bootstrap(role, ports))
    }
}

/// Bootstrap with the role's admin port and an aggregated discovery
/// subscription to the block's discovery port
pub fn default_bootstrap(role: Role, ports: &PortBlock) -> String {
    let admin_port = match role {
        Role::Client => ports.client_admin(),
        Role::Server => ports.server_admin(),
    };
    format!(
        r#"node:
  id: {role}
  cluster: test-cluster
admin:
  access_log_path: /dev/null
  address:
    socket_address:
      address: 127.0.0.1
      port_value: {admin_port}
dynamic_resources:
  ads_config:
    api_type: GRPC
    grpc_services:
    - envoy_grpc:
        cluster_name: xds_cluster
  cds_config:
    ads: {{}}
  lds_config:
    ads: {{}}
static_resources:
  clusters:
  - name: xds_cluster
    connect_timeout: 1s
    http2_protocol_options: {{}}
    load_assignment:
      cluster_name: xds_cluster
      endpoints:
      - lb_endpoints:
        - endpoint:
            address:
              socket_address:
                address: 127.0.0.1
                port_value: {xds_port}
"#,
        role = role,
        admin_port = admin_port,
        xds_port = ports.discovery(),
    )
}

type SharedHttpBackend = Arc<tokio::sync::Mutex<Option<HttpBackend>>>;

/// What a test body gets to work with
#[derive(Clone)]
pub struct ScenarioContext {
    id: Uuid,
    ports: PortBlock,
    client: StatsPoller,
    server: StatsPoller,
    cache: Arc<SnapshotCache>,
    http: SharedHttpBackend,
    tls_certificate: Option<CertificateDer<'static>>,
}

impl ScenarioContext {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ports(&self) -> &PortBlock {
        &self.ports
    }

    /// Poller bound to the client proxy's admin port
    pub fn client(&self) -> &StatsPoller {
        &self.client
    }

    /// Poller bound to the server proxy's admin port
    pub fn server(&self) -> &StatsPoller {
        &self.server
    }

    /// Snapshot cache of this scenario, never seen by other scenarios
    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Push a snapshot update, substituting defaults as [`Update::apply`] does
    pub fn push(&self, update: &Update) -> Result<Arc<Snapshot>> {
        update.apply(&self.cache, &self.ports)
    }

    /// Certificate the TLS backends serve, when TLS is enabled
    pub fn tls_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.tls_certificate.as_ref()
    }

    /// Headers of the last request the HTTP backend saw
    pub async fn last_request_headers(&self) -> Option<HeaderMap> {
        self.http
            .lock()
            .await
            .as_ref()
            .and_then(|backend| backend.last_request_headers())
    }

    pub async fn http_request_count(&self) -> u64 {
        self.http
            .lock()
            .await
            .as_ref()
            .map_or(0, |backend| backend.request_count())
    }

    /// Stop the HTTP backend before the scenario ends
    pub async fn stop_http_backend(&self) {
        let backend = self.http.lock().await.take();
        if let Some(mut backend) = backend {
            backend.stop().await;
        }
    }
}

/// Result of a scenario whose body succeeded
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub id: Uuid,
    pub ports: PortBlock,
    /// How each proxy went away, in stop order
    pub stops: Vec<(Role, StopOutcome)>,
    /// Problems during teardown. These never fail the scenario.
    pub teardown_errors: Vec<HarnessError>,
}

impl ScenarioOutcome {
    /// Roles that ignored the shutdown request and had to be killed
    pub fn killed(&self) -> Vec<Role> {
        self.stops
            .iter()
            .filter(|(_, outcome)| *outcome == StopOutcome::Killed)
            .map(|(role, _)| *role)
            .collect()
    }

    /// Both proxies exited on request and cleanup raised nothing
    pub fn is_clean(&self) -> bool {
        self.teardown_errors.is_empty() && self.killed().is_empty()
    }
}

#[derive(Default)]
struct TeardownReport {
    stops: Vec<(Role, StopOutcome)>,
    errors: Vec<HarnessError>,
}

/// Everything a scenario started so far
#[derive(Default)]
struct Stack {
    client: Option<ProxyInstance>,
    server: Option<ProxyInstance>,
    http: SharedHttpBackend,
    tcp: Option<TcpBackend>,
}

impl Stack {
    /// Stop and clean up every started resource, client before server before
    /// backends. A failing step never skips the ones after it.
    async fn tear_down(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        for slot in [&mut self.client, &mut self.server] {
            let Some(mut instance) = slot.take() else {
                continue;
            };
            let role = instance.role();
            match instance.stop().await {
                Ok(StopOutcome::Killed) => {
                    warn!(%role, "Proxy had to be killed");
                    report.stops.push((role, StopOutcome::Killed));
                }
                Ok(outcome) => report.stops.push((role, outcome)),
                Err(e) => {
                    warn!(%role, error = %e, "Error stopping proxy");
                    report.errors.push(e);
                }
            }
            report.errors.extend(instance.tear_down().await);
        }

        let http = self.http.lock().await.take();
        if let Some(mut backend) = http {
            backend.stop().await;
        }
        if let Some(mut backend) = self.tcp.take() {
            backend.stop().await;
        }

        report
    }
}

/// Runs client/server proxy scenarios.
///
/// Cheap to share: every scenario gets its own port block, scratch directory,
/// snapshot cache and proxy pair, while the allocator and live-instance
/// registry are shared.
pub struct TestSetup {
    config: HarnessConfig,
    allocator: Arc<PortAllocator>,
    live: LiveRegistry,
    renderer: Arc<dyn BootstrapRenderer>,
    initial_updates: Option<Vec<Update>>,
}

impl TestSetup {
    pub fn new(config: HarnessConfig) -> Self {
        let allocator = Arc::new(PortAllocator::new(&config.ports));
        Self {
            config,
            allocator,
            live: Arc::new(DashMap::new()),
            renderer: Arc::new(DefaultBootstrap),
            initial_updates: None,
        }
    }

    /// Share a port allocator with other setups (builder pattern)
    pub fn with_allocator(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_renderer(mut self, renderer: impl BootstrapRenderer + 'static) -> Self {
        self.renderer = Arc::new(renderer);
        self
    }

    /// Replace the initial pushes (default: empty `client` and `server`
    /// updates at version "0", which publish the default resources)
    pub fn with_initial_updates(mut self, updates: Vec<Update>) -> Self {
        self.initial_updates = Some(updates);
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Bring up a proxy pair, run `body`, and tear everything down.
    ///
    /// Setup failures skip the body and are returned. A body error is
    /// returned as [`HarnessError::Body`]; a body panic resumes after
    /// teardown. Teardown problems are logged and reported in the outcome.
    pub async fn run<F, Fut>(&self, body: F) -> Result<ScenarioOutcome>
    where
        F: FnOnce(ScenarioContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let id = Uuid::new_v4();
        self.run_scenario(id, body)
            .instrument(info_span!("scenario", %id))
            .await
    }

    async fn run_scenario<F, Fut>(&self, id: Uuid, body: F) -> Result<ScenarioOutcome>
    where
        F: FnOnce(ScenarioContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let ports = self.allocator.allocate()?;
        let work_dir = tempfile::Builder::new()
            .prefix("sidecar-harness-")
            .tempdir()?;
        let launcher = ProxyLauncher::new(
            self.config.proxy.clone(),
            self.config.timing.clone(),
            work_dir.path(),
        )
        .with_registry(Arc::clone(&self.live));

        // Snapshots belong to this scenario alone
        let cache = Arc::new(SnapshotCache::new());
        let mut stack = Stack::default();
        let context = match self.bring_up(&mut stack, id, &ports, &launcher, cache).await {
            Ok(context) => context,
            Err(e) => {
                error!(error = %e, class = %e.class(), "Scenario setup failed, skipping body");
                let report = stack.tear_down().await;
                log_teardown(&report);
                return Err(e);
            }
        };

        info!(%ports, "Scenario ready, running body");
        let result = AssertUnwindSafe(async move { body(context).await })
            .catch_unwind()
            .await;

        let report = stack.tear_down().await;
        log_teardown(&report);
        drop(work_dir);

        match result {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(Err(e)) => {
                error!(error = %e, "Scenario body failed");
                Err(HarnessError::Body(e))
            }
            Ok(Ok(())) => {
                info!("Scenario passed");
                Ok(ScenarioOutcome {
                    id,
                    ports,
                    stops: report.stops,
                    teardown_errors: report.errors,
                })
            }
        }
    }

    async fn bring_up(
        &self,
        stack: &mut Stack,
        id: Uuid,
        ports: &PortBlock,
        launcher: &ProxyLauncher,
        cache: Arc<SnapshotCache>,
    ) -> Result<ScenarioContext> {
        let defaults = [
            Update::new(Role::Client.as_str(), "0"),
            Update::new(Role::Server.as_str(), "0"),
        ];
        let updates = self.initial_updates.as_deref().unwrap_or(&defaults);
        for update in updates {
            update.apply(&cache, ports)?;
        }

        let server = self.launch(launcher, Role::Server, ports).await?;
        let server_poller = StatsPoller::from_timing(server.admin().clone(), &self.config.timing);
        stack.server = Some(server);
        server_poller.wait_ready().await?;

        let client = self.launch(launcher, Role::Client, ports).await?;
        let client_poller = StatsPoller::from_timing(client.admin().clone(), &self.config.timing);
        stack.client = Some(client);
        client_poller.wait_ready().await?;

        let scenario = &self.config.scenario;
        let tls = if scenario.tls {
            Some(TlsIdentity::self_signed()?)
        } else {
            None
        };
        if scenario.start_http_backend {
            let backend = HttpBackend::start(ports.backend(), tls.as_ref()).await?;
            *stack.http.lock().await = Some(backend);
        }
        if scenario.start_tcp_backend {
            stack.tcp =
                Some(TcpBackend::start(ports.backend(), &scenario.tcp_prefix, tls.as_ref()).await?);
        }

        Ok(ScenarioContext {
            id,
            ports: *ports,
            client: client_poller,
            server: server_poller,
            cache,
            http: Arc::clone(&stack.http),
            tls_certificate: tls.map(|identity| identity.certificate_der().clone()),
        })
    }

    async fn launch(
        &self,
        launcher: &ProxyLauncher,
        role: Role,
        ports: &PortBlock,
    ) -> Result<ProxyInstance> {
        let bootstrap = self
            .renderer
            .render(role, ports)
            .map_err(|e| HarnessError::Config(format!("rendering {} bootstrap: {:#}", role, e)))?;
        let admin_port = match role {
            Role::Client => ports.client_admin(),
            Role::Server => ports.server_admin(),
        };
        launcher
            .launch(role, &bootstrap, admin_port, role.base_id(ports.index()))
            .await
    }
}

fn log_teardown(report: &TeardownReport) {
    for e in &report.errors {
        warn!(error = %e, class = %e.class(), "Teardown problem");
    }
}
