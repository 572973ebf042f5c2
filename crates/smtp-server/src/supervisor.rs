use crate::config::{ServerConfig, ServerSnapshot};
use crate::error::ServerError;
use crate::port::{find_available_port, PORT_SEARCH_WINDOW};
use crate::session::{serve, SessionContext};
use crate::tls;
use mailbox::{Message, MessageId, MessageStore, StoreError};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Bound on the self-connect liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on joining background tasks during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between tearing a dead listener down and binding it again.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Owns the SMTP listener, its health check and the captured mail.
///
/// The message store outlives stop/start cycles of the same instance.
pub struct EmailServer {
    config: ServerConfig,
    actual_port: u16,
    store: Arc<MessageStore>,
    running: Option<Running>,
}

struct Running {
    shared: Arc<Shared>,
    health_shutdown: CancellationToken,
    health_task: JoinHandle<()>,
}

/// State the health-check loop needs to restart the listener.
struct Shared {
    addr: SocketAddr,
    span: Span,
    context: Arc<SessionContext>,
    listener: Mutex<Option<ListenerHandle>>,
    bound: AtomicBool,
}

struct ListenerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Shared {
    async fn serve(&self, listener: TcpListener) {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            serve(listener, Arc::clone(&self.context), shutdown.clone())
                .instrument(info_span!(parent: &self.span, "accept")),
        );
        *self.listener.lock().await = Some(ListenerHandle { shutdown, task });
        self.bound.store(true, Ordering::SeqCst);
    }

    /// Stops accepting and closes the socket. Sessions already running finish on their own.
    async fn release(&self) {
        let handle = self.listener.lock().await.take();
        self.bound.store(false, Ordering::SeqCst);

        if let Some(ListenerHandle { shutdown, mut task }) = handle {
            shutdown.cancel();
            if timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("Listener on {} did not stop in time, aborting", self.addr);
                task.abort();
            }
        }
    }

    async fn restart(&self, cancel: &CancellationToken) -> Result<(), ServerError> {
        self.release().await;
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Where the probe connects; wildcard binds are reached over loopback.
    fn probe_addr(&self) -> SocketAddr {
        match self.addr {
            SocketAddr::V4(a) if a.ip().is_unspecified() => (Ipv4Addr::LOCALHOST, a.port()).into(),
            SocketAddr::V6(a) if a.ip().is_unspecified() => (Ipv6Addr::LOCALHOST, a.port()).into(),
            addr => addr,
        }
    }
}

/// Periodically connects to the listener and rebinds it when nobody answers.
/// Failures are logged and retried on the next tick.
async fn health_check_loop(shared: Arc<Shared>, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let failure = match timeout(PROBE_TIMEOUT, TcpStream::connect(shared.probe_addr())).await {
            Ok(Ok(stream)) => {
                debug!("Connection check successful");
                // Leave politely so the session ends without a reset.
                let _ = timeout(PROBE_TIMEOUT, quit(stream)).await;
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        if shutdown.is_cancelled() {
            break;
        }

        warn!("Connection check failed: {}", failure);
        info!("Attempting to restart server...");
        match shared.restart(&shutdown).await {
            Ok(()) if shutdown.is_cancelled() => break,
            Ok(()) => info!("Server restarted successfully"),
            Err(e) => error!("Failed to restart server: {}", e),
        }
    }
    debug!("Health check stopped");
}

/// Reads the greeting, sends QUIT and returns the goodbye line.
async fn quit(stream: TcpStream) -> std::io::Result<String> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    reader.get_mut().write_all(b"QUIT\r\n").await?;
    line.clear();
    reader.read_line(&mut line).await?;
    Ok(line)
}

impl EmailServer {
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(MessageStore::new(config.max_messages));
        EmailServer {
            actual_port: config.port,
            config,
            store,
            running: None,
        }
    }

    /// Picks a port, prepares TLS if asked, binds and starts accepting.
    /// Returns the port actually bound.
    pub async fn start(&mut self) -> Result<u16, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let port = find_available_port(&self.config.host, self.config.port, PORT_SEARCH_WINDOW)?;
        let tls = if self.config.use_tls {
            let (cert_path, key_path) = (self.config.cert_path(), self.config.key_path());
            let acceptor = tokio::task::spawn_blocking(move || {
                tls::load_or_generate(&cert_path, &key_path)
            })
            .await
            .map_err(std::io::Error::other)??;
            Some(acceptor)
        } else {
            None
        };

        let listener = TcpListener::bind((self.config.host.as_str(), port)).await?;
        let addr = listener.local_addr()?;
        let context = Arc::new(SessionContext::new(
            &self.config,
            Arc::clone(&self.store),
            tls,
        ));
        let span = info_span!("supervisor", %addr);
        let shared = Arc::new(Shared {
            addr,
            span: span.clone(),
            context,
            listener: Mutex::new(None),
            bound: AtomicBool::new(false),
        });
        shared.serve(listener).await;

        let health_shutdown = CancellationToken::new();
        let health_task = tokio::spawn(
            health_check_loop(
                Arc::clone(&shared),
                self.config.health_check_interval,
                health_shutdown.clone(),
            )
            .instrument(info_span!(parent: &span, "health")),
        );

        self.actual_port = addr.port();
        self.running = Some(Running {
            shared,
            health_shutdown,
            health_task,
        });
        info!(
            parent: &span,
            "Server is listening on {} (tls: {}, auth: {})",
            addr,
            self.config.use_tls,
            self.config.auth_required()
        );
        Ok(addr.port())
    }

    /// Halts the health check first, then closes the listener. A no-op when stopped.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let Some(running) = self.running.take() else {
            debug!("Stop requested but server is not running");
            return Ok(());
        };

        let Running {
            shared,
            health_shutdown,
            mut health_task,
        } = running;

        health_shutdown.cancel();
        if timeout(SHUTDOWN_TIMEOUT, &mut health_task).await.is_err() {
            warn!("Health check did not stop in time, aborting");
            health_task.abort();
        }

        shared.release().await;
        info!(parent: &shared.span, "Server stopped gracefully");
        Ok(())
    }

    /// True while a listener is bound.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.shared.bound.load(Ordering::SeqCst))
    }

    pub fn get_config(&self) -> ServerSnapshot {
        ServerSnapshot {
            config: ServerConfig {
                port: self.actual_port,
                ..self.config.clone()
            },
            requested_port: self.config.port,
            auth_enabled: self.config.auth_required(),
            connection_count: self.store.connection_count(),
            running: self.is_running(),
        }
    }

    pub fn store(&self) -> Arc<MessageStore> {
        Arc::clone(&self.store)
    }

    pub fn list_messages(&self) -> Vec<Message> {
        self.store.list()
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message, StoreError> {
        self.store.get(id)
    }

    pub fn delete_message(&self, id: MessageId) -> bool {
        self.store.delete(id)
    }

    pub fn clear_messages(&self) {
        self.store.clear()
    }
}

impl Drop for EmailServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.health_shutdown.cancel();
            running.health_task.abort();
            if let Ok(mut slot) = running.shared.listener.try_lock() {
                if let Some(handle) = slot.take() {
                    handle.shutdown.cancel();
                }
            }
        }
    }
}
