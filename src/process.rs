//! Proxy process supervision
//!
//! A [`ProxyLauncher`] turns a rendered bootstrap into a running, live
//! [`ProxyInstance`]. Instances are stopped with a graceful shutdown request
//! that races process exit against a grace period, falling back to a kill.

use crate::admin::AdminClient;
use crate::config::{ProxySettings, TimingConfig};
use crate::error::{HarnessError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Which side of the proxy pair an instance plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }

    /// File name used when copying the rendered bootstrap out of the scratch directory
    pub fn bootstrap_file_name(&self) -> &'static str {
        match self {
            Role::Client => "client.yaml",
            Role::Server => "server.yaml",
        }
    }

    /// Base identifier for this role in the port block with the given index.
    ///
    /// Client and server ids interleave so no two instances of any scenario
    /// share one.
    pub fn base_id(&self, block_index: u32) -> u32 {
        match self {
            Role::Client => block_index * 2 + 1,
            Role::Server => (block_index + 1) * 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stopped instance went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited cleanly within the grace period
    Exited,
    /// Ignored the shutdown request and was killed
    Killed,
}

/// Admin ports of instances that are started and not yet reaped
pub type LiveRegistry = Arc<DashMap<u16, Role>>;

/// Launches proxy processes for one scenario
#[derive(Debug, Clone)]
pub struct ProxyLauncher {
    settings: ProxySettings,
    timing: TimingConfig,
    work_dir: PathBuf,
    live: LiveRegistry,
}

impl ProxyLauncher {
    pub fn new(settings: ProxySettings, timing: TimingConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            timing,
            work_dir: work_dir.into(),
            live: Arc::new(DashMap::new()),
        }
    }

    /// Share a live-instance registry with other launchers (builder pattern)
    pub fn with_registry(mut self, live: LiveRegistry) -> Self {
        self.live = live;
        self
    }

    pub fn registry(&self) -> &LiveRegistry {
        &self.live
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Path the bootstrap of the instance on `admin_port` is written to
    pub fn config_path(&self, admin_port: u16) -> PathBuf {
        self.work_dir
            .join(format!("config.conf.{}.yaml", admin_port))
    }

    /// Command-line flags, in the order the proxy expects them
    pub fn command_args(&self, config_path: &Path, base_id: u32) -> Vec<OsString> {
        let s = &self.settings;
        let mut args: Vec<OsString> = vec![
            "-c".into(),
            config_path.as_os_str().to_owned(),
            "--drain-time-s".into(),
            s.drain_time_secs.to_string().into(),
        ];

        if s.allow_unknown_fields {
            args.push("--allow-unknown-fields".into());
        }

        if s.stress {
            args.push("--concurrency".into());
            args.push(s.stress_concurrency.to_string().into());
        } else {
            args.push("-l".into());
            args.push(s.log_level.clone().into());
            args.push("--concurrency".into());
            args.push(s.concurrency.to_string().into());
        }

        if s.disable_hot_restart {
            args.push("--disable-hot-restart".into());
        } else {
            args.push("--base-id".into());
            args.push(base_id.to_string().into());
            args.push("--parent-shutdown-time-s".into());
            args.push(s.parent_shutdown_time_secs.to_string().into());
            args.push("--restart-epoch".into());
            args.push(s.restart_epoch.to_string().into());
        }

        args.extend(s.extra_args.iter().map(OsString::from));
        args
    }

    /// Start a proxy with `bootstrap` and block until its administrative endpoint answers.
    ///
    /// Fails if another live instance owns `admin_port`, if the process can not
    /// be spawned, if it exits before becoming live, or if the launch budget
    /// runs out. A process that never became live is killed before returning.
    pub async fn launch(
        &self,
        role: Role,
        bootstrap: &str,
        admin_port: u16,
        base_id: u32,
    ) -> Result<ProxyInstance> {
        match self.live.entry(admin_port) {
            Entry::Occupied(_) => return Err(HarnessError::AdminPortBusy(admin_port)),
            Entry::Vacant(slot) => {
                slot.insert(role);
            }
        }

        let result = self.launch_registered(role, bootstrap, admin_port, base_id).await;
        if result.is_err() {
            self.live.remove(&admin_port);
        }
        result
    }

    async fn launch_registered(
        &self,
        role: Role,
        bootstrap: &str,
        admin_port: u16,
        base_id: u32,
    ) -> Result<ProxyInstance> {
        let admin = AdminClient::new(admin_port, self.timing.admin_request_timeout())?;
        let config_path = self.config_path(admin_port);
        tokio::fs::create_dir_all(&self.work_dir).await?;
        tokio::fs::write(&config_path, bootstrap).await?;

        if let Some(ref dir) = self.settings.copy_bootstrap_dir {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(dir.join(role.bootstrap_file_name()), bootstrap).await?;
        }

        let binary = self.settings.binary_path();
        let args = self.command_args(&config_path, base_id);
        info!(%role, binary = %binary.display(), admin_port, base_id, "Starting proxy");
        debug!(%role, ?args, "Proxy command line");

        let mut cmd = Command::new(&binary);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.current_dir(&self.work_dir);
        cmd.kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                remove_quietly(&config_path).await;
                return Err(HarnessError::Spawn {
                    role,
                    binary,
                    source,
                });
            }
        };
        let pid = child.id().unwrap_or(0);
        info!(%role, pid, admin_port, "Proxy process spawned");

        let mut instance = ProxyInstance {
            child,
            role,
            admin,
            base_id,
            config_path,
            shm_path: self.settings.shm_path(base_id),
            bootstrap: bootstrap.to_string(),
            stop_grace: self.timing.stop_grace(),
            live: Arc::clone(&self.live),
        };

        if let Err(e) = self.wait_live(&mut instance).await {
            error!(%role, admin_port, error = %e, "Proxy failed to start");
            instance.abort().await;
            return Err(e);
        }

        info!(%role, pid, admin_port, "Proxy live");
        Ok(instance)
    }

    /// Poll the liveness path until it answers 200 or the launch budget runs out
    async fn wait_live(&self, instance: &mut ProxyInstance) -> Result<()> {
        let path = &self.settings.liveness_path;
        let budget = self.timing.launch_timeout();
        let interval = self.timing.launch_poll_interval();
        let start = Instant::now();
        let mut last = String::from("no probe made");

        loop {
            if let Some(status) = instance.child.try_wait()? {
                return Err(HarnessError::ExitedDuringStartup {
                    role: instance.role,
                    status,
                });
            }

            match instance.admin.get(path).await {
                Ok(response) if response.is_success() => return Ok(()),
                Ok(response) => last = format!("{} returned status {}", path, response.status),
                Err(e) => last = e.to_string(),
            }

            if start.elapsed() >= budget {
                return Err(HarnessError::LaunchTimeout {
                    role: instance.role,
                    admin_port: instance.admin_port(),
                    waited: start.elapsed(),
                    last,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// One running proxy process
#[derive(Debug)]
pub struct ProxyInstance {
    child: Child,
    role: Role,
    admin: AdminClient,
    base_id: u32,
    config_path: PathBuf,
    shm_path: PathBuf,
    bootstrap: String,
    stop_grace: Duration,
    live: LiveRegistry,
}

impl ProxyInstance {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn admin(&self) -> &AdminClient {
        &self.admin
    }

    pub fn admin_port(&self) -> u16 {
        self.admin.port()
    }

    pub fn base_id(&self) -> u32 {
        self.base_id
    }

    /// OS process id, or `None` once the process has been reaped
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn shm_path(&self) -> &Path {
        &self.shm_path
    }

    /// The rendered bootstrap this instance was launched with
    pub fn bootstrap(&self) -> &str {
        &self.bootstrap
    }

    /// Request graceful shutdown and wait for exit, killing the process if the
    /// grace period runs out first.
    ///
    /// A clean exit yields [`StopOutcome::Exited`], a non-zero exit within the
    /// grace period is an error, and a kill yields [`StopOutcome::Killed`].
    pub async fn stop(&mut self) -> Result<StopOutcome> {
        let role = self.role;
        let admin_port = self.admin_port();
        let grace = self.stop_grace;

        let admin = &self.admin;
        let child = &mut self.child;
        let exited = tokio::time::timeout(grace, async move {
            admin.quit().await;
            child.wait().await
        })
        .await;

        let outcome = match exited {
            Ok(Ok(status)) if status.success() => {
                info!(%role, admin_port, "Proxy exited");
                Ok(StopOutcome::Exited)
            }
            Ok(Ok(status)) => {
                warn!(%role, admin_port, %status, "Proxy exited uncleanly");
                Err(HarnessError::UncleanExit { role, status })
            }
            Ok(Err(e)) => {
                warn!(%role, admin_port, error = %e, "Error waiting for proxy to exit");
                Err(HarnessError::Stop { role, source: e })
            }
            Err(_) => {
                warn!(
                    %role,
                    admin_port,
                    grace_ms = grace.as_millis(),
                    "Grace period exceeded, killing proxy"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(%role, admin_port, error = %e, "Failed to kill proxy");
                }
                Ok(StopOutcome::Killed)
            }
        };

        self.live.remove(&admin_port);
        outcome
    }

    /// Best-effort removal of the shared-memory artifact and the rendered config.
    ///
    /// Failures are logged and returned for annotation, never raised.
    pub async fn tear_down(&self) -> Vec<HarnessError> {
        let mut errors = Vec::new();
        for path in [&self.shm_path, &self.config_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(role = %self.role, path = %path.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    warn!(role = %self.role, path = %path.display(), error = %source, "Cleanup failed");
                    errors.push(HarnessError::Cleanup {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        errors
    }

    /// Kill a process that never became live and drop its rendered config
    async fn abort(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(role = %self.role, error = %e, "Kill after failed launch");
        }
        remove_quietly(&self.config_path).await;
        self.live.remove(&self.admin_port());
    }

    #[cfg(test)]
    pub(crate) fn from_child(child: Child, role: Role, admin_port: u16, stop_grace: Duration) -> Self {
        let live: LiveRegistry = Arc::new(DashMap::new());
        live.insert(admin_port, role);
        Self {
            child,
            role,
            admin: AdminClient::new(admin_port, Duration::from_millis(500)).unwrap(),
            base_id: 0,
            config_path: PathBuf::from(format!("config.conf.{}.yaml", admin_port)),
            shm_path: PathBuf::new(),
            bootstrap: String::new(),
            stop_grace,
            live,
        }
    }
}

impl Drop for ProxyInstance {
    fn drop(&mut self) {
        self.live.remove(&self.admin.port());
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "Could not remove file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn spawn(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn launcher(binary: &str, dir: &Path) -> ProxyLauncher {
        let settings = ProxySettings {
            binary: Some(PathBuf::from(binary)),
            ..Default::default()
        };
        let timing = TimingConfig {
            launch_timeout_ms: 500,
            launch_poll_interval_ms: 20,
            ..Default::default()
        };
        ProxyLauncher::new(settings, timing, dir)
    }

    fn to_strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_base_ids_interleave() {
        assert_eq!(Role::Client.base_id(0), 1);
        assert_eq!(Role::Server.base_id(0), 2);
        assert_eq!(Role::Client.base_id(3), 7);
        assert_eq!(Role::Server.base_id(3), 8);
        assert_eq!(Role::Server.to_string(), "server");
    }

    #[test]
    fn test_command_args_hot_restart() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher("proxy", dir.path());
        let args = to_strings(launcher.command_args(Path::new("/tmp/c.yaml"), 5));

        assert_eq!(
            args,
            vec![
                "-c",
                "/tmp/c.yaml",
                "--drain-time-s",
                "1",
                "--allow-unknown-fields",
                "-l",
                "info",
                "--concurrency",
                "1",
                "--base-id",
                "5",
                "--parent-shutdown-time-s",
                "1",
                "--restart-epoch",
                "0",
            ]
        );
    }

    #[test]
    fn test_command_args_stress_without_hot_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = launcher("proxy", dir.path());
        launcher.settings.stress = true;
        launcher.settings.disable_hot_restart = true;
        launcher.settings.allow_unknown_fields = false;
        launcher.settings.extra_args = vec!["--use-dynamic-base-id".to_string()];

        let args = to_strings(launcher.command_args(Path::new("c.yaml"), 5));
        assert_eq!(
            args,
            vec![
                "-c",
                "c.yaml",
                "--drain-time-s",
                "1",
                "--concurrency",
                "10",
                "--disable-hot-restart",
                "--use-dynamic-base-id",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_clean_exit() {
        let mut instance =
            ProxyInstance::from_child(spawn("true", &[]), Role::Server, closed_port(), Duration::from_secs(3));
        assert_eq!(instance.stop().await.unwrap(), StopOutcome::Exited);
    }

    #[tokio::test]
    async fn test_stop_unclean_exit() {
        let mut instance =
            ProxyInstance::from_child(spawn("false", &[]), Role::Client, closed_port(), Duration::from_secs(3));
        let err = instance.stop().await.unwrap_err();
        assert!(matches!(err, HarnessError::UncleanExit { role: Role::Client, .. }));
    }

    #[tokio::test]
    async fn test_stop_kills_process_ignoring_shutdown() {
        let port = closed_port();
        let grace = Duration::from_millis(300);
        let mut instance = ProxyInstance::from_child(spawn("sleep", &["60"]), Role::Client, port, grace);
        assert!(instance.live.contains_key(&port));

        let start = Instant::now();
        assert_eq!(instance.stop().await.unwrap(), StopOutcome::Killed);
        assert!(start.elapsed() < grace + Duration::from_secs(2));
        assert!(instance.pid().is_none());
        assert!(!instance.live.contains_key(&port));
    }

    #[tokio::test]
    async fn test_tear_down_removes_artifacts_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut instance =
            ProxyInstance::from_child(spawn("true", &[]), Role::Server, closed_port(), Duration::from_secs(1));
        instance.shm_path = dir.path().join("envoy_shared_memory_20");
        instance.config_path = dir.path().join("config.conf.1.yaml");
        std::fs::write(&instance.shm_path, b"").unwrap();

        instance.stop().await.unwrap();
        assert!(instance.tear_down().await.is_empty());
        assert!(!instance.shm_path.exists());
    }

    #[tokio::test]
    async fn test_tear_down_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut instance =
            ProxyInstance::from_child(spawn("true", &[]), Role::Server, closed_port(), Duration::from_secs(1));
        // A directory can not be removed with remove_file
        instance.shm_path = dir.path().to_path_buf();

        instance.stop().await.unwrap();
        let errors = instance.tear_down().await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], HarnessError::Cleanup { .. }));
    }

    #[tokio::test]
    async fn test_launch_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher("/nonexistent/proxy-binary", dir.path());
        let port = closed_port();

        let err = launcher
            .launch(Role::Server, "admin: {}", port, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Spawn { role: Role::Server, .. }));
        assert!(launcher.registry().is_empty());
        assert!(!launcher.config_path(port).exists());
    }

    #[tokio::test]
    async fn test_launch_process_exiting_during_startup() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher("false", dir.path());

        let err = launcher
            .launch(Role::Client, "admin: {}", closed_port(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::ExitedDuringStartup { .. }));
        assert!(launcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_launch_rejects_busy_admin_port() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher("true", dir.path());
        let port = closed_port();
        launcher.registry().insert(port, Role::Server);

        let err = launcher
            .launch(Role::Client, "admin: {}", port, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::AdminPortBusy(p) if p == port));
        // The existing owner stays registered
        assert_eq!(launcher.registry().get(&port).map(|r| *r), Some(Role::Server));
    }
}
