//! Lifecycle controller
//!
//! Owns the shared state every transaction borrows (certificate store,
//! replay registry, upstream client, stats), binds the three listeners
//! (public v4, public v6, loopback replay) on ephemeral ports, publishes
//! the bound endpoints to the platform diverter and drives start/stop.
//! Start and stop are idempotent and serialized; per-connection failures
//! never tear a listener down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;

use crate::certs::{CertStoreError, SpoofedCertStore};
use crate::config::{ProxyConfig, ProxyHandler};
use crate::diverter::{Diverter, DiverterEndpoints};
use crate::proxy::dispatcher::{self, Route};
use crate::proxy::{http, websocket, ConnectionInfo, TransactionError};
use crate::replay::{self, ReplayRegistry};
use crate::tls::adapter::{self, AcceptedStream, AdapterError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(&'static str),

    #[error(transparent)]
    CertStore(#[from] CertStoreError),

    #[error("failed to bind listener: {0}")]
    BindFailed(#[from] std::io::Error),

    #[error("upstream client construction failed: {0}")]
    ClientBuildFailed(String),

    #[error("diverter failed: {0}")]
    Diverter(String),
}

/// Cheap per-engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    transactions: AtomicU64,
    dropped: AtomicU64,
    replays_started: AtomicU64,
    websocket_sessions: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_transaction(&self) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replay(&self) {
        self.replays_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_websocket(&self) {
        self.websocket_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions: self.transactions.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            replays_started: self.replays_started.load(Ordering::Relaxed),
            websocket_sessions: self.websocket_sessions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub transactions: u64,
    pub dropped: u64,
    pub replays_started: u64,
    pub websocket_sessions: u64,
}

/// State shared by every transaction task.
pub(crate) struct ProxyCore {
    pub(crate) handler: Arc<dyn ProxyHandler>,
    pub(crate) certs: Arc<SpoofedCertStore>,
    pub(crate) replays: Arc<ReplayRegistry>,
    pub(crate) default_client: reqwest::Client,
    pub(crate) stats: EngineStats,
    replay_port: AtomicU16,
}

impl ProxyCore {
    pub(crate) fn replay_port(&self) -> u16 {
        self.replay_port.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct EngineState {
    started: bool,
    endpoints: Option<DiverterEndpoints>,
    replay_endpoint: Option<SocketAddr>,
    diverter: Option<Arc<dyn Diverter>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The proxy engine. Construct once, `start` to go live, `stop` to wind
/// down; both transitions are idempotent.
pub struct ProxyEngine {
    config: ProxyConfig,
    core: Arc<ProxyCore>,
    running: Arc<AtomicBool>,
    state: tokio::sync::Mutex<EngineState>,
}

impl ProxyEngine {
    /// Validate the configuration, mint and install the CA, and build
    /// the upstream client. Fatal errors here mean the proxy never runs.
    pub async fn new(config: ProxyConfig) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::ConfigurationInvalid)?;

        let certs = Arc::new(
            SpoofedCertStore::new(
                &config.authority_name,
                config.trust_store.as_ref(),
                config.downstream_tls,
            )
            .await?,
        );

        let default_client = match &config.custom_proxy_handler {
            Some(client) => client.clone(),
            None => ProxyConfig::default_upstream_client()
                .map_err(|e| EngineError::ClientBuildFailed(e.to_string()))?,
        };

        let core = Arc::new(ProxyCore {
            handler: Arc::clone(&config.handler),
            certs,
            replays: Arc::new(ReplayRegistry::new()),
            default_client,
            stats: EngineStats::default(),
            replay_port: AtomicU16::new(0),
        });

        Ok(Self {
            config,
            core,
            running: Arc::new(AtomicBool::new(false)),
            state: tokio::sync::Mutex::new(EngineState::default()),
        })
    }

    /// Bind the listeners, publish endpoints to the diverter and start
    /// accepting. Idempotent.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.started {
            return Ok(());
        }

        let v4 = TcpListener::bind(("0.0.0.0", 0)).await?;
        let v6 = TcpListener::bind(("::", 0)).await?;
        let replay_listener = TcpListener::bind(("127.0.0.1", 0)).await?;

        let v4_addr = v4.local_addr()?;
        let v6_addr = v6.local_addr()?;
        let replay_addr = replay_listener.local_addr()?;
        self.core.replay_port.store(replay_addr.port(), Ordering::Release);
        self.running.store(true, Ordering::Release);

        let mut tasks = Vec::new();
        for listener in [v4, v6] {
            tasks.push(tokio::spawn(serve_public_listener(
                Arc::clone(&self.core),
                listener,
                Arc::clone(&self.running),
            )));
        }
        tasks.push(tokio::spawn(replay::serve_replay_listener(
            replay_listener,
            Arc::clone(&self.core.replays),
            Arc::clone(&self.running),
        )));
        tasks.push(replay::spawn_pruner(
            Arc::clone(&self.core.replays),
            Arc::clone(&self.running),
        ));

        // Each public listener serves HTTP and HTTPS on its one port, so
        // the pair per family reports that same bound endpoint.
        let endpoints = DiverterEndpoints {
            v4_http: v4_addr,
            v4_https: v4_addr,
            v6_http: v6_addr,
            v6_https: v6_addr,
        };

        let diverter = self
            .config
            .diverter_factory
            .create(
                endpoints,
                Arc::clone(&self.config.handler),
                self.config.block_external_proxies,
            )
            .map_err(|e| EngineError::Diverter(e.to_string()))?;
        diverter
            .start(0)
            .await
            .map_err(|e| EngineError::Diverter(e.to_string()))?;

        info!(
            v4 = %v4_addr,
            v6 = %v6_addr,
            replay = %replay_addr,
            "proxy engine started"
        );

        state.started = true;
        state.endpoints = Some(endpoints);
        state.replay_endpoint = Some(replay_addr);
        state.diverter = Some(diverter);
        state.tasks = tasks;
        Ok(())
    }

    /// Stop the diverter and the listeners. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.started {
            return;
        }

        if let Some(diverter) = state.diverter.take() {
            diverter.stop().await;
        }
        self.running.store(false, Ordering::Release);
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.started = false;
        state.endpoints = None;
        state.replay_endpoint = None;
        info!("proxy engine stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.started
    }

    /// The public endpoints bound at start, while running.
    pub async fn endpoints(&self) -> Option<DiverterEndpoints> {
        self.state.lock().await.endpoints
    }

    /// The loopback replay endpoint, while running.
    pub async fn replay_endpoint(&self) -> Option<SocketAddr> {
        self.state.lock().await.replay_endpoint
    }

    /// The certificate store backing the TLS front-end.
    pub fn cert_store(&self) -> Arc<SpoofedCertStore> {
        Arc::clone(&self.core.certs)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }
}

async fn serve_public_listener(
    core: Arc<ProxyCore>,
    listener: TcpListener,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let core = Arc::clone(&core);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(core, socket, peer).await {
                debug!(peer = %peer, error = %e, "connection ended");
            }
        });
    }
}

async fn handle_connection(
    core: Arc<ProxyCore>,
    socket: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let local = socket.local_addr()?;

    match adapter::accept(socket, &core.certs).await {
        Ok(AcceptedStream::Tls {
            stream,
            sni,
            has_peer_certificate,
        }) => {
            let conn = ConnectionInfo {
                local,
                peer,
                encrypted: true,
                sni: Some(sni),
                has_peer_certificate,
            };
            serve_http(core, stream, conn).await
        }
        Ok(AcceptedStream::Plain { stream }) => {
            let conn = ConnectionInfo {
                local,
                peer,
                encrypted: false,
                sni: None,
                has_peer_certificate: false,
            };
            serve_http(core, stream, conn).await
        }
        Err(AdapterError::SniMissing) => {
            debug!(peer = %peer, "closing connection without SNI");
            Ok(())
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "TLS adapter failed, closing connection");
            Ok(())
        }
    }
}

async fn serve_http<S>(
    core: Arc<ProxyCore>,
    stream: S,
    conn: ConnectionInfo,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let core = Arc::clone(&core);
        let conn = conn.clone();
        async move {
            match dispatcher::route(&req) {
                Route::Http => http::handle_transaction(core, conn, req).await,
                Route::WebSocket => websocket::handle_upgrade(core, conn, req).await,
                Route::Close => Err(TransactionError::BadRequest("unsupported upgrade")),
            }
        }
    });

    hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await?;
    Ok(())
}
