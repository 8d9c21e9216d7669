//! Stand-in proxy exposing the administrative surface the harness drives.
//!
//! Accepts the real proxy's launch flags (and ignores most of them) plus a few
//! fixture flags that shape its behaviour:
//!
//! * `--admin-port <port>`: admin port; defaults to the bootstrap's `admin:` port
//! * `--warming-ms <ms>`: report warming listeners/clusters for this long
//! * `--stat <name>=<value>`: extra stat in both stats formats (repeatable)
//! * `--prometheus-file <path>`: serve this file as `/stats/prometheus`
//! * `--shm-dir <dir>` / `--shm-prefix <prefix>`: create the shared-memory artifact
//! * `--ignore-quit`: answer `/quitquitquit` but keep running
//! * `--startup-delay-ms <ms>`: wait before binding the admin port
//! * `--exit-code <code>`: exit status after a shutdown request

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use sidecar_harness::stats::{CLUSTERS_WARMING, LISTENERS_WARMING};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Options {
    config: Option<PathBuf>,
    admin_port: Option<u16>,
    base_id: Option<u32>,
    shm_dir: Option<PathBuf>,
    shm_prefix: String,
    warming: Duration,
    stats: Vec<(String, i64)>,
    prometheus_file: Option<PathBuf>,
    ignore_quit: bool,
    startup_delay: Duration,
    exit_code: i32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: None,
            admin_port: None,
            base_id: None,
            shm_dir: None,
            shm_prefix: "envoy_shared_memory_".to_string(),
            warming: Duration::ZERO,
            stats: Vec::new(),
            prometheus_file: None,
            ignore_quit: false,
            startup_delay: Duration::ZERO,
            exit_code: 0,
        }
    }
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> anyhow::Result<Options> {
    let mut options = Options::default();

    while let Some(flag) = args.next() {
        let mut value = || {
            args.next()
                .ok_or_else(|| anyhow::anyhow!("missing value for {}", flag))
        };
        match flag.as_str() {
            "-c" => options.config = Some(PathBuf::from(value()?)),
            "--admin-port" => options.admin_port = Some(value()?.parse()?),
            "--base-id" => options.base_id = Some(value()?.parse()?),
            "--shm-dir" => options.shm_dir = Some(PathBuf::from(value()?)),
            "--shm-prefix" => options.shm_prefix = value()?,
            "--warming-ms" => options.warming = Duration::from_millis(value()?.parse()?),
            "--startup-delay-ms" => options.startup_delay = Duration::from_millis(value()?.parse()?),
            "--exit-code" => options.exit_code = value()?.parse()?,
            "--prometheus-file" => options.prometheus_file = Some(PathBuf::from(value()?)),
            "--stat" => {
                let pair = value()?;
                let (name, v) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("--stat expects name=value, got {}", pair))?;
                options.stats.push((name.to_string(), v.parse()?));
            }
            "--ignore-quit" => options.ignore_quit = true,
            // Real proxy flags this fixture accepts and ignores
            "-l" | "--concurrency" | "--drain-time-s" | "--parent-shutdown-time-s"
            | "--restart-epoch" => {
                value()?;
            }
            "--allow-unknown-fields" | "--disable-hot-restart" => {}
            other => warn!(flag = other, "Ignoring unknown flag"),
        }
    }

    Ok(options)
}

/// First `port_value` inside the top-level `admin:` section
fn admin_port_from_bootstrap(text: &str) -> Option<u16> {
    let mut in_admin = false;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            in_admin = line.trim_end() == "admin:";
            continue;
        }
        if in_admin {
            if let Some(port) = line.trim().strip_prefix("port_value:") {
                return port.trim().parse().ok();
            }
        }
    }
    None
}

struct AdminState {
    started: Instant,
    warming: Duration,
    stats: Vec<(String, i64)>,
    prometheus: Option<String>,
    ignore_quit: bool,
    shutdown_tx: watch::Sender<bool>,
}

impl AdminState {
    fn warming_count(&self) -> i64 {
        i64::from(self.started.elapsed() < self.warming)
    }

    fn stats_json(&self) -> String {
        let warming = self.warming_count();
        let mut stats = vec![
            serde_json::json!({ "name": LISTENERS_WARMING, "value": warming }),
            serde_json::json!({ "name": CLUSTERS_WARMING, "value": warming }),
        ];
        stats.extend(
            self.stats
                .iter()
                .map(|(name, value)| serde_json::json!({ "name": name, "value": value })),
        );
        stats.push(serde_json::json!({ "histograms": { "supported_quantiles": [0, 25, 50, 75, 100] } }));
        serde_json::json!({ "stats": stats }).to_string()
    }

    fn stats_prometheus(&self) -> String {
        if let Some(ref text) = self.prometheus {
            return text.clone();
        }
        let mut out = String::new();
        for (name, value) in &self.stats {
            let name = format!("envoy_{}", name.replace('.', "_"));
            out.push_str(&format!("# TYPE {} counter\n{} {}\n", name, name, value));
        }
        out
    }
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

async fn handle_admin_request(
    req: Request<Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("");
    debug!(%method, %path, query, "Admin request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/server_info") => {
            response(StatusCode::OK, r#"{"state":"LIVE"}"#)
        }
        (&Method::GET, "/ready") => {
            if state.warming_count() == 0 {
                response(StatusCode::OK, "LIVE\n")
            } else {
                response(StatusCode::SERVICE_UNAVAILABLE, "PRE_INITIALIZING\n")
            }
        }
        (&Method::GET, "/stats") if query.contains("format=json") => {
            response(StatusCode::OK, state.stats_json())
        }
        (&Method::GET, "/stats/prometheus") => response(StatusCode::OK, state.stats_prometheus()),
        (&Method::POST, "/quitquitquit") => {
            if state.ignore_quit {
                info!("Ignoring shutdown request");
            } else {
                info!("Shutdown requested");
                let _ = state.shutdown_tx.send(true);
            }
            response(StatusCode::OK, "OK\n")
        }
        _ => response(StatusCode::NOT_FOUND, "not found\n"),
    };

    Ok(response)
}

async fn serve(listener: TcpListener, state: Arc<AdminState>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| handle_admin_request(req, Arc::clone(&state)));
                            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(addr = %addr, error = %e, "Admin connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept admin connection"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fake_proxy=info".parse()?),
        )
        .init();

    let options = parse_args(std::env::args().skip(1))?;

    let bootstrap = match options.config {
        Some(ref path) => std::fs::read_to_string(path)?,
        None => String::new(),
    };
    let admin_port = options
        .admin_port
        .or_else(|| admin_port_from_bootstrap(&bootstrap))
        .ok_or_else(|| anyhow::anyhow!("no admin port in flags or bootstrap"))?;

    if let (Some(dir), Some(base_id)) = (&options.shm_dir, options.base_id) {
        let path = dir.join(format!("{}{}0", options.shm_prefix, base_id));
        std::fs::write(&path, b"")?;
        info!(path = %path.display(), "Shared memory artifact created");
    }

    let prometheus = match options.prometheus_file {
        Some(ref path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };

    if !options.startup_delay.is_zero() {
        tokio::time::sleep(options.startup_delay).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AdminState {
        started: Instant::now(),
        warming: options.warming,
        stats: options.stats.clone(),
        prometheus,
        ignore_quit: options.ignore_quit,
        shutdown_tx,
    });

    let listener = TcpListener::bind(("127.0.0.1", admin_port)).await?;
    info!(admin_port, pid = std::process::id(), "Fake proxy admin listening");

    serve(listener, state, shutdown_rx).await;

    // Let the shutdown response reach the caller
    tokio::time::sleep(Duration::from_millis(20)).await;
    info!(exit_code = options.exit_code, "Fake proxy exiting");
    std::process::exit(options.exit_code);
}
