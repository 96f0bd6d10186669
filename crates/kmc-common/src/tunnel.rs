//! Port-forward tunnel into a cluster the test driver cannot route to
//!
//! [`TunnelBridge::open`] spawns one background task that owns the local
//! listener. The task first initializes (binds `127.0.0.1:<port>` and dials a
//! probe stream to the remote workload), then sends exactly one readiness or
//! failure notification, then forwards every accepted local connection to a
//! freshly dialed upstream stream until the session is closed.
//!
//! Lifecycle: Initializing -> Ready -> Closed, or Initializing -> Failed.
//! A failed open releases the listener before the error is returned; a ready
//! session releases it on [`TunnelSession::close`] or when dropped.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Portforwarder};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Error;

/// How long `open` waits for the tunnel to become ready
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed `accept` (e.g. EMFILE) before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A bidirectional byte stream to the remote workload
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed upstream stream
pub type BoxedStream = Box<dyn TunnelStream>;

/// Dials streams to one remote workload port
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Human-readable target, e.g. `kmc-test/kmc-kmc-test-0:30443`
    fn target(&self) -> String;

    /// Open a new stream to the remote port
    async fn dial(&self) -> Result<BoxedStream, Error>;
}

/// Upstream using the Kubernetes pod port-forward subresource
pub struct KubePortForward {
    client: Client,
    namespace: String,
    pod: String,
    port: u16,
}

impl KubePortForward {
    /// Forward to `port` of `namespace/pod`
    pub fn new(client: Client, namespace: &str, pod: &str, port: u16) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            port,
        }
    }
}

#[async_trait]
impl Upstream for KubePortForward {
    fn target(&self) -> String {
        format!("{}/{}:{}", self.namespace, self.pod, self.port)
    }

    async fn dial(&self) -> Result<BoxedStream, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut forwarder = pods.portforward(&self.pod, &[self.port]).await?;

        let stream = forwarder.take_stream(self.port).ok_or_else(|| {
            Error::tunnel(
                self.target(),
                format!("port-forward returned no stream for port {}", self.port),
            )
        })?;

        Ok(Box::new(PortForwardStream {
            stream: Box::new(stream),
            _forwarder: Box::new(forwarder),
        }))
    }
}

/// Keeps the port-forward session alive for as long as its stream is used
struct PortForwardStream {
    stream: BoxedStream,
    _forwarder: Box<Portforwarder>,
}

impl AsyncRead for PortForwardStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PortForwardStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Lifecycle state of a tunnel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    /// Listener being bound and upstream being probed
    Initializing,
    /// Local endpoint accepts and forwards connections
    Ready,
    /// Resources released
    Closed,
    /// Initialization failed; nothing is forwarded
    Failed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready => write!(f, "Ready"),
            Self::Closed => write!(f, "Closed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Options for opening a tunnel
#[derive(Clone, Debug)]
pub struct TunnelOptions {
    /// Local port to bind on 127.0.0.1 (0 lets the OS pick)
    pub local_port: u16,
    /// Maximum time spent in Initializing
    pub ready_timeout: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            local_port: 0,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Opens tunnels; see the module docs for the lifecycle
pub struct TunnelBridge;

impl TunnelBridge {
    /// Open a tunnel and wait until it is Ready or Failed.
    ///
    /// Returns only after the background task has signalled. On failure the
    /// task has already released the listener.
    pub async fn open(
        upstream: Arc<dyn Upstream>,
        options: &TunnelOptions,
    ) -> Result<TunnelSession, Error> {
        let target = upstream.target();
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        debug!(target = %target, state = %TunnelState::Initializing, "Opening tunnel");
        let task = tokio::spawn(run_tunnel(
            upstream,
            options.clone(),
            cancel.clone(),
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(local_addr)) => {
                info!(
                    target = %target,
                    local = %local_addr,
                    state = %TunnelState::Ready,
                    "Tunnel ready"
                );
                Ok(TunnelSession {
                    target,
                    local_addr,
                    cancel,
                    closed: AtomicBool::new(false),
                })
            }
            Ok(Err(e)) => {
                // The task exits right after signalling failure
                let _ = task.await;
                warn!(target = %target, state = %TunnelState::Failed, error = %e, "Tunnel failed");
                Err(e)
            }
            Err(_) => {
                cancel.cancel();
                Err(Error::tunnel(
                    target,
                    "tunnel task exited before signalling readiness",
                ))
            }
        }
    }
}

/// An open tunnel, exclusively owned by whoever opened it.
///
/// Closing is idempotent and also happens on drop.
pub struct TunnelSession {
    target: String,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl TunnelSession {
    /// The remote target description
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Local address accepting connections
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// HTTPS URL of the local endpoint
    pub fn local_url(&self) -> String {
        format!("https://{}", self.local_addr)
    }

    /// Current state (Ready until closed)
    pub fn state(&self) -> TunnelState {
        if self.closed.load(Ordering::SeqCst) {
            TunnelState::Closed
        } else {
            TunnelState::Ready
        }
    }

    /// Stop forwarding and release the local endpoint.
    ///
    /// Returns `true` if this call released the session, `false` if it was
    /// already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        info!(
            target = %self.target,
            local = %self.local_addr,
            state = %TunnelState::Closed,
            "Tunnel closed"
        );
        true
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("target", &self.target)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_tunnel(
    upstream: Arc<dyn Upstream>,
    options: TunnelOptions,
    cancel: CancellationToken,
    ready_tx: oneshot::Sender<Result<SocketAddr, Error>>,
) {
    let target = upstream.target();

    let initialized = tokio::time::timeout(
        options.ready_timeout,
        initialize(upstream.as_ref(), options.local_port),
    )
    .await;

    let (listener, local_addr) = match initialized {
        Ok(Ok(bound)) => bound,
        Ok(Err(e)) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
        Err(_) => {
            let _ = ready_tx.send(Err(Error::tunnel(
                target,
                format!("not ready after {:?}", options.ready_timeout),
            )));
            return;
        }
    };

    if ready_tx.send(Ok(local_addr)).is_err() {
        // Opener went away before reading the signal
        return;
    }

    forward_loop(listener, upstream, cancel).await;
    debug!(target = %target, "Tunnel forwarding loop stopped");
}

/// Bind the local listener and verify the remote end accepts connections
async fn initialize(
    upstream: &dyn Upstream,
    local_port: u16,
) -> Result<(TcpListener, SocketAddr), Error> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port))
        .await
        .map_err(|e| {
            Error::tunnel(
                upstream.target(),
                format!("failed to bind 127.0.0.1:{}: {}", local_port, e),
            )
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::tunnel(upstream.target(), format!("no local address: {}", e)))?;

    let probe = upstream.dial().await?;
    drop(probe);

    Ok((listener, local_addr))
}

/// Source of local connections for the forwarding loop
#[async_trait]
trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

async fn forward_loop<A: Acceptor>(
    listener: A,
    upstream: Arc<dyn Upstream>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let upstream = upstream.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(bridge(socket, peer, upstream, cancel));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept tunnel connection");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

async fn bridge(
    mut socket: TcpStream,
    peer: SocketAddr,
    upstream: Arc<dyn Upstream>,
    cancel: CancellationToken,
) {
    let mut remote = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = upstream.dial() => match dialed {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to dial upstream for tunnel connection");
                return;
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(peer = %peer, "Tunnel connection cancelled");
        }
        result = tokio::io::copy_bidirectional(&mut socket, &mut remote) => match result {
            Ok((sent, received)) => {
                debug!(peer = %peer, sent, received, "Tunnel connection finished");
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Tunnel connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Upstream whose remote end echoes everything back
    #[derive(Default)]
    struct EchoUpstream {
        dials: AtomicU32,
    }

    #[async_trait]
    impl Upstream for EchoUpstream {
        fn target(&self) -> String {
            "test/echo-0:30443".to_string()
        }

        async fn dial(&self) -> Result<BoxedStream, Error> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(server);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
            Ok(Box::new(client))
        }
    }

    #[derive(Default)]
    struct RefusingUpstream {
        dials: AtomicU32,
    }

    #[async_trait]
    impl Upstream for RefusingUpstream {
        fn target(&self) -> String {
            "test/down-0:30443".to_string()
        }

        async fn dial(&self) -> Result<BoxedStream, Error> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(Error::tunnel(self.target(), "connection refused"))
        }
    }

    struct HangingUpstream;

    #[async_trait]
    impl Upstream for HangingUpstream {
        fn target(&self) -> String {
            "test/hang-0:30443".to_string()
        }

        async fn dial(&self) -> Result<BoxedStream, Error> {
            std::future::pending().await
        }
    }

    struct FailingAcceptor {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Acceptor for FailingAcceptor {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_until_refused(addr: SocketAddr) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while TcpStream::connect(addr).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener was not released");
    }

    #[tokio::test]
    async fn open_returns_ready_session_that_forwards() {
        let upstream = Arc::new(EchoUpstream::default());
        let session = TunnelBridge::open(upstream.clone(), &TunnelOptions::default())
            .await
            .unwrap();

        assert_eq!(session.state(), TunnelState::Ready);
        assert_eq!(session.target(), "test/echo-0:30443");
        assert!(session.local_url().starts_with("https://127.0.0.1:"));
        // Probe stream dialed during initialization
        assert_eq!(upstream.dials.load(Ordering::SeqCst), 1);

        let mut conn = TcpStream::connect(session.local_addr()).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(upstream.dials.load(Ordering::SeqCst), 2);

        session.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_listener() {
        let session = TunnelBridge::open(
            Arc::new(EchoUpstream::default()),
            &TunnelOptions::default(),
        )
        .await
        .unwrap();
        let addr = session.local_addr();

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), TunnelState::Closed);

        wait_until_refused(addr).await;
    }

    #[tokio::test]
    async fn drop_closes_session() {
        let session = TunnelBridge::open(
            Arc::new(EchoUpstream::default()),
            &TunnelOptions::default(),
        )
        .await
        .unwrap();
        let addr = session.local_addr();

        drop(session);

        wait_until_refused(addr).await;
    }

    #[tokio::test]
    async fn failed_open_surfaces_error_and_releases_port() {
        let port = free_port().await;
        let upstream = Arc::new(RefusingUpstream::default());
        let options = TunnelOptions {
            local_port: port,
            ..Default::default()
        };

        let err = TunnelBridge::open(upstream.clone(), &options)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Tunnel { .. }));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(upstream.dials.load(Ordering::SeqCst), 1);
        // Nothing is left listening on the requested port
        assert!(TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.is_ok());
    }

    #[tokio::test]
    async fn open_fails_when_upstream_never_answers() {
        let options = TunnelOptions {
            local_port: 0,
            ready_timeout: Duration::from_millis(50),
        };

        let err = TunnelBridge::open(Arc::new(HangingUpstream), &options)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not ready after"));
    }

    #[tokio::test]
    async fn open_fails_when_local_port_taken() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = held.local_addr().unwrap().port();
        let upstream = Arc::new(EchoUpstream::default());
        let options = TunnelOptions {
            local_port: port,
            ..Default::default()
        };

        let err = TunnelBridge::open(upstream.clone(), &options)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("failed to bind"));
        // No upstream traffic happens for a failed session
        assert_eq!(upstream.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_errors_are_paced_until_cancelled() {
        let calls = Arc::new(AtomicU32::new(0));
        let acceptor = FailingAcceptor {
            calls: calls.clone(),
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_loop(
            acceptor,
            Arc::new(EchoUpstream::default()),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();

        // One attempt per retry delay, not a busy loop
        let calls = calls.load(Ordering::SeqCst);
        assert!((2..=12).contains(&calls), "accept called {calls} times");
    }
}
