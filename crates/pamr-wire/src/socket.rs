//! Socket factories: how an agent reaches its router.
//!
//! - [`PlainSocketFactory`] opens a direct TCP connection.
//! - [`TunneledSocketFactory`] asks an HTTP `CONNECT` gateway to relay the
//!   connection, for agents that cannot reach the router directly. Gateways
//!   can be restricted with a known-hosts file, and idle connections are
//!   reclaimed by an [`IdleReaper`].
//!
//! Neither transport encrypts or authenticates anything. The CONNECT relay
//! is plaintext, and the known-hosts file only lists which gateway
//! addresses may be used; it does not verify any host key.

use async_trait::async_trait;
use dashmap::DashMap;
use pamr_types::{AgentConfig, PamrError, PamrResult, SocketFactoryKind, TunnelConfig};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Byte stream carrying a tunnel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// Opens transport connections to the router.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Build the socket factory selected by an agent configuration.
pub fn from_config(config: &AgentConfig) -> PamrResult<Arc<dyn SocketFactory>> {
    Ok(match config.socket_factory {
        SocketFactoryKind::Plain => Arc::new(PlainSocketFactory::new(config.connect_timeout())),
        SocketFactoryKind::Tunnel => Arc::new(TunneledSocketFactory::new(&config.tunnel)?),
    })
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    what: &str,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{what} timed out after {} ms", limit.as_millis()),
            )
        })?,
        None => fut.await,
    }
}

/// Direct TCP connections.
#[derive(Debug, Clone)]
pub struct PlainSocketFactory {
    connect_timeout: Option<Duration>,
}

impl PlainSocketFactory {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SocketFactory for PlainSocketFactory {
    fn name(&self) -> &'static str {
        "plain"
    }

    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let what = format!("connection to {host}:{port}");
        let stream = with_timeout(self.connect_timeout, &what, TcpStream::connect((host, port))).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Read a known-hosts file: one `host:port` per line, `#` starts a comment.
pub fn load_known_hosts(path: &Path) -> io::Result<HashSet<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect())
}

/// Longest CONNECT response header accepted from a gateway.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Connections relayed by an HTTP `CONNECT` gateway.
///
/// The relay carries frames in plaintext and the gateway is trusted by
/// address alone: no confidentiality, no authentication.
pub struct TunneledSocketFactory {
    gateway: String,
    connect_timeout: Option<Duration>,
    reaper: Option<Arc<IdleReaper>>,
}

impl TunneledSocketFactory {
    pub fn new(config: &TunnelConfig) -> PamrResult<Self> {
        let gateway = config
            .gateway
            .clone()
            .ok_or_else(|| PamrError::Config("tunnel.gateway must be set".into()))?;

        if let Some(path) = &config.known_hosts {
            let known = load_known_hosts(path).map_err(|e| {
                PamrError::Config(format!("cannot read known hosts {}: {e}", path.display()))
            })?;
            if !known.contains(&gateway) {
                return Err(PamrError::Config(format!(
                    "gateway {gateway} is not listed in {}",
                    path.display()
                )));
            }
        }

        let reaper = config
            .gc_policy()
            .map(|(period, idle)| Arc::new(IdleReaper::new(period, idle)));

        Ok(Self {
            gateway,
            connect_timeout: config.connect_timeout(),
            reaper,
        })
    }

    pub fn reaper(&self) -> Option<&Arc<IdleReaper>> {
        self.reaper.as_ref()
    }

    async fn open(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect(self.gateway.as_str()).await?;
        stream.set_nodelay(true)?;

        let target = format!("{host}:{port}");
        let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;

        // Byte by byte so nothing past the header is consumed.
        let mut response = Vec::with_capacity(128);
        while !response.ends_with(b"\r\n\r\n") {
            if response.len() >= MAX_CONNECT_RESPONSE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "gateway response header too long",
                ));
            }
            response.push(stream.read_u8().await?);
        }

        let status_line = String::from_utf8_lossy(&response);
        let status_line = status_line.lines().next().unwrap_or("");
        let code = status_line.split_whitespace().nth(1).unwrap_or("");
        if !status_line.starts_with("HTTP/1.") || code != "200" {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("gateway {} refused {target}: {status_line}", self.gateway),
            ));
        }
        debug!(gateway = %self.gateway, %target, "Gateway tunnel established");
        Ok(stream)
    }
}

#[async_trait]
impl SocketFactory for TunneledSocketFactory {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let what = format!("gateway connection to {host}:{port}");
        let stream = with_timeout(self.connect_timeout, &what, self.open(host, port)).await?;
        Ok(match &self.reaper {
            Some(reaper) => Box::new(reaper.track(stream)),
            None => Box::new(stream),
        })
    }
}

#[derive(Debug)]
struct Activity {
    last_ms: AtomicU64,
    closed: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl Activity {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let waker = self.waker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Closes tracked connections that stay idle for too long.
///
/// The sweep task starts with the first tracked connection and stops when
/// the reaper is dropped.
#[derive(Debug)]
pub struct IdleReaper {
    period: Duration,
    idle: Duration,
    epoch: Instant,
    conns: DashMap<u64, Arc<Activity>>,
    next_id: AtomicU64,
    started: AtomicBool,
}

impl IdleReaper {
    pub fn new(period: Duration, idle: Duration) -> Self {
        Self {
            period,
            idle,
            epoch: Instant::now(),
            conns: DashMap::new(),
            next_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Number of connections currently tracked.
    pub fn tracked(&self) -> usize {
        self.conns.len()
    }

    /// Wrap a stream so that its activity is tracked.
    pub fn track<S>(self: &Arc<Self>, inner: S) -> IdleTracked<S> {
        if !self.started.swap(true, Ordering::SeqCst) {
            let weak = Arc::downgrade(self);
            let period = self.period;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(reaper) => {
                            reaper.sweep();
                        }
                        None => break,
                    }
                }
            });
        }

        let activity = Arc::new(Activity {
            last_ms: AtomicU64::new(self.now_ms()),
            closed: AtomicBool::new(false),
            waker: Mutex::new(None),
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(id, Arc::clone(&activity));
        IdleTracked {
            inner,
            id,
            activity,
            reaper: Arc::downgrade(self),
        }
    }

    /// Close every connection idle for longer than the threshold. Returns
    /// how many were closed.
    pub fn sweep(&self) -> usize {
        let now = self.now_ms();
        let idle_ms = self.idle.as_millis() as u64;
        let expired: Vec<u64> = self
            .conns
            .iter()
            .filter(|e| now.saturating_sub(e.value().last_ms.load(Ordering::Relaxed)) > idle_ms)
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            if let Some((_, activity)) = self.conns.remove(id) {
                activity.close();
            }
        }
        if !expired.is_empty() {
            info!(closed = expired.len(), "Reclaimed idle tunnel connections");
        }
        expired.len()
    }
}

/// A stream registered with an [`IdleReaper`].
///
/// Once reclaimed, every read and write fails with `TimedOut`.
pub struct IdleTracked<S> {
    inner: S,
    id: u64,
    activity: Arc<Activity>,
    reaper: Weak<IdleReaper>,
}

impl<S> IdleTracked<S> {
    fn touch(&self) {
        if let Some(reaper) = self.reaper.upgrade() {
            self.activity
                .last_ms
                .store(reaper.now_ms(), Ordering::Relaxed);
        }
    }

    fn reclaimed(&self) -> Option<io::Error> {
        if self.activity.closed.load(Ordering::SeqCst) {
            Some(io::Error::new(
                io::ErrorKind::TimedOut,
                "idle connection reclaimed",
            ))
        } else {
            None
        }
    }

    fn park(&self, cx: &Context<'_>) {
        *self.activity.waker.lock().unwrap_or_else(|e| e.into_inner()) = Some(cx.waker().clone());
    }
}

impl<S> Drop for IdleTracked<S> {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.upgrade() {
            reaper.conns.remove(&self.id);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTracked<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(err) = self.reclaimed() {
            return Poll::Ready(Err(err));
        }
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                self.touch();
                Poll::Ready(result)
            }
            Poll::Pending => {
                self.park(cx);
                // The reaper may have fired between the check and the park.
                match self.reclaimed() {
                    Some(err) => Poll::Ready(Err(err)),
                    None => Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTracked<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = self.reclaimed() {
            return Poll::Ready(Err(err));
        }
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if result.is_ready() {
            self.touch();
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::net::TcpListener;

    /// Minimal CONNECT gateway relaying to whatever target it is asked for.
    async fn spawn_gateway(accept: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut client, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut header = Vec::new();
                    while !header.ends_with(b"\r\n\r\n") {
                        header.push(client.read_u8().await.unwrap());
                    }
                    let text = String::from_utf8(header).unwrap();
                    let target = text.split_whitespace().nth(1).unwrap().to_string();
                    if !accept {
                        client
                            .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                            .await
                            .unwrap();
                        return;
                    }
                    let mut upstream = TcpStream::connect(target).await.unwrap();
                    client
                        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await
                        .unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                });
            }
        });
        addr
    }

    async fn spawn_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    fn tunnel_config(gateway: String, gc_period_ms: u64) -> TunnelConfig {
        TunnelConfig {
            gateway: Some(gateway),
            known_hosts: None,
            gc_period_ms,
            gc_idle_time_ms: 50,
            connect_timeout_ms: 2_000,
        }
    }

    #[tokio::test]
    async fn test_plain_connect() {
        let port = spawn_echo().await;
        let factory = PlainSocketFactory::new(Some(Duration::from_secs(2)));
        let mut stream = factory.connect("127.0.0.1", port).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_tunneled_connect_through_gateway() {
        let port = spawn_echo().await;
        let gateway = spawn_gateway(true).await;
        let factory = TunneledSocketFactory::new(&tunnel_config(gateway, 0)).unwrap();
        let mut stream = factory.connect("127.0.0.1", port).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_gateway_refusal_is_an_error() {
        let gateway = spawn_gateway(false).await;
        let factory = TunneledSocketFactory::new(&tunnel_config(gateway, 0)).unwrap();
        let err = match factory.connect("127.0.0.1", 1).await {
            Err(e) => e,
            Ok(_) => panic!("gateway should have refused"),
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_known_hosts_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# gateways").unwrap();
        writeln!(f, "gw1.example.org:3128").unwrap();
        writeln!(f, "  gw2.example.org:3128   # backup").unwrap();
        drop(f);

        let hosts = load_known_hosts(&path).unwrap();
        assert_eq!(hosts.len(), 2);
        assert!(hosts.contains("gw2.example.org:3128"));

        let mut config = tunnel_config("gw2.example.org:3128".into(), 0);
        config.known_hosts = Some(path.clone());
        assert!(TunneledSocketFactory::new(&config).is_ok());

        config.gateway = Some("rogue.example.org:3128".into());
        assert!(matches!(
            TunneledSocketFactory::new(&config),
            Err(PamrError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_connection_reclaimed() {
        let port = spawn_echo().await;
        let gateway = spawn_gateway(true).await;
        let factory = TunneledSocketFactory::new(&tunnel_config(gateway, 20)).unwrap();
        let mut stream = factory.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(factory.reaper().unwrap().tracked(), 1);

        // Nobody writes: the blocked read must be woken up with an error.
        let mut buf = [0u8; 1];
        let err = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("reaper should wake the reader")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(factory.reaper().unwrap().tracked(), 0);
    }

    #[test]
    fn test_from_config_selects_factory() {
        let plain = from_config(&AgentConfig::default()).unwrap();
        assert_eq!(plain.name(), "plain");

        let config = AgentConfig {
            socket_factory: SocketFactoryKind::Tunnel,
            tunnel: tunnel_config("127.0.0.1:3128".into(), 0),
            ..AgentConfig::default()
        };
        assert_eq!(from_config(&config).unwrap().name(), "tunnel");
    }
}
