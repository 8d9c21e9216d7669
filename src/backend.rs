//! Backend target servers that proxied traffic ends up at
//!
//! Both servers bind inside their own task and report the bind result over a
//! oneshot channel, so `start` returns only once the port is really listening.

use crate::error::{HarnessError, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Body returned by the HTTP backend
pub const HTTP_RESPONSE_BODY: &str = "hello";

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

type BoxedStream = Box<dyn Stream>;

/// Self-signed server identity for TLS backends
#[derive(Clone)]
pub struct TlsIdentity {
    acceptor: TlsAcceptor,
    cert_der: CertificateDer<'static>,
}

impl TlsIdentity {
    /// Generate a certificate for `localhost` and `127.0.0.1`
    pub fn self_signed() -> Result<Self> {
        let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
            .map_err(|e| HarnessError::Backend(format!("failed to generate certificate: {}", e)))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| HarnessError::Backend(format!("failed to serialize private key: {}", e)))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| HarnessError::Backend(format!("TLS configuration error: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .map_err(|e| HarnessError::Backend(format!("TLS configuration error: {}", e)))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            cert_der,
        })
    }

    /// DER of the certificate clients must trust
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

/// Shutdown handle and accept task of a running server.
///
/// The accept task owns every connection task, so stopping it closes open
/// connections too.
struct Running {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Running {
    async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Backend task failed");
            }
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn start_server<H, Fut>(
    kind: &'static str,
    port: u16,
    tls: Option<TlsAcceptor>,
    handler: H,
) -> Result<Running>
where
    H: Fn(BoxedStream) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let secure = tls.is_some();

    let task = tokio::spawn(async move {
        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let _ = ready_tx.send(Ok(()));
                listener
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        accept_loop(kind, listener, tls, shutdown_rx, handler).await;
    });

    match ready_rx.await {
        Ok(Ok(())) => {
            info!(kind, port, tls = secure, "Backend listening");
            Ok(Running {
                shutdown_tx,
                task: Some(task),
            })
        }
        Ok(Err(e)) => Err(HarnessError::Backend(format!(
            "{} backend failed to bind port {}: {}",
            kind, port, e
        ))),
        Err(_) => Err(HarnessError::Backend(format!(
            "{} backend on port {} exited before binding",
            kind, port
        ))),
    }
}

async fn accept_loop<H, Fut>(
    kind: &'static str,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
    handler: H,
) where
    H: Fn(BoxedStream) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let tls = tls.clone();
                        let handler = handler.clone();
                        connections.spawn(async move {
                            if let Some(acceptor) = tls {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => handler(Box::new(tls_stream)).await,
                                    Err(e) => debug!(kind, addr = %addr, error = %e, "Backend TLS handshake failed"),
                                }
                            } else {
                                handler(Box::new(stream)).await;
                            }
                        });
                    }
                    Err(e) => {
                        error!(kind, error = %e, "Failed to accept backend connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(kind, open = connections.len(), "Backend shutting down");
                    break;
                }
            }
        }
    }

    // Established keep-alive connections go away with the listener
    connections.shutdown().await;
}

#[derive(Debug, Default)]
struct HttpObservations {
    last_headers: Mutex<Option<HeaderMap>>,
    requests: AtomicU64,
}

impl HttpObservations {
    fn record(&self, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        *self.last_headers.lock() = Some(req.headers().clone());
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(method = %req.method(), path = %req.uri().path(), requests = n, "Backend request");
        Response::new(Full::new(Bytes::from_static(HTTP_RESPONSE_BODY.as_bytes())))
    }
}

/// HTTP/1.1 and HTTP/2 backend answering every request with 200
pub struct HttpBackend {
    port: u16,
    observed: Arc<HttpObservations>,
    running: Running,
}

impl HttpBackend {
    pub async fn start(port: u16, tls: Option<&TlsIdentity>) -> Result<Self> {
        let observed = Arc::new(HttpObservations::default());
        let state = Arc::clone(&observed);

        let running = start_server("http", port, tls.map(|t| t.acceptor.clone()), move |stream| {
            serve_http_connection(stream, Arc::clone(&state))
        })
        .await?;

        Ok(Self {
            port,
            observed,
            running,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Headers of the most recent request, if any arrived
    pub fn last_request_headers(&self) -> Option<HeaderMap> {
        self.observed.last_headers.lock().clone()
    }

    pub fn request_count(&self) -> u64 {
        self.observed.requests.load(Ordering::SeqCst)
    }

    /// Stop accepting connections. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.running.stop().await;
    }
}

async fn serve_http_connection(stream: BoxedStream, state: Arc<HttpObservations>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(state.record(&req)) }
    });

    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
    {
        debug!(error = %e, "Backend connection error");
    }
}

/// TCP backend replying `<prefix><received bytes>` to every read
pub struct TcpBackend {
    port: u16,
    running: Running,
}

impl TcpBackend {
    pub async fn start(port: u16, prefix: &str, tls: Option<&TlsIdentity>) -> Result<Self> {
        let prefix: Arc<[u8]> = Arc::from(prefix.as_bytes());
        let running = start_server("tcp", port, tls.map(|t| t.acceptor.clone()), move |stream| {
            echo_with_prefix(stream, Arc::clone(&prefix))
        })
        .await?;

        Ok(Self { port, running })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn stop(&mut self) {
        self.running.stop().await;
    }
}

async fn echo_with_prefix(mut stream: BoxedStream, prefix: Arc<[u8]>) {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "TCP backend read failed");
                return;
            }
        };
        let mut reply = Vec::with_capacity(prefix.len() + n);
        reply.extend_from_slice(&prefix);
        reply.extend_from_slice(&buf[..n]);
        if let Err(e) = stream.write_all(&reply).await {
            debug!(error = %e, "TCP backend write failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::ServerName;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn trusting_connector(identity: &TlsIdentity) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(identity.certificate_der().clone()).unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    #[tokio::test]
    async fn test_http_backend_records_headers() {
        let port = free_port();
        let mut backend = HttpBackend::start(port, None).await.unwrap();
        assert!(backend.last_request_headers().is_none());

        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let body = client
            .get(format!("http://127.0.0.1:{}/anything", port))
            .header("x-request-id", "abc")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, HTTP_RESPONSE_BODY);

        let headers = backend.last_request_headers().unwrap();
        assert_eq!(headers.get("x-request-id").unwrap(), "abc");
        assert_eq!(backend.request_count(), 1);

        backend.stop().await;
        backend.stop().await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_closes_keep_alive_connections() {
        let port = free_port();
        let mut backend = HttpBackend::start(port, None).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        stream.write_all(request).await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&received).ends_with(HTTP_RESPONSE_BODY) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the response");
            received.extend_from_slice(&buf[..n]);
        }

        backend.stop().await;

        // The server side of the idle connection is gone
        let _ = stream.write_all(request).await;
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("connection left open after stop");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = HttpBackend::start(port, None).await.err().unwrap();
        assert!(matches!(err, HarnessError::Backend(_)));
        assert_eq!(err.class(), crate::error::ErrorClass::Launch);
        assert!(TcpBackend::start(port, "hello", None).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_backend_prefixes_echo() {
        let port = free_port();
        let mut backend = TcpBackend::start(port, "hello", None).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"world").await.unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"helloworld");

        backend.stop().await;
    }

    #[tokio::test]
    async fn test_tls_tcp_backend() {
        let identity = TlsIdentity::self_signed().unwrap();
        let port = free_port();
        let mut backend = TcpBackend::start(port, "hi:", Some(&identity)).await.unwrap();

        let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut tls = trusting_connector(&identity)
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();
        tls.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 7];
        tls.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hi:ping");

        backend.stop().await;
    }
}
