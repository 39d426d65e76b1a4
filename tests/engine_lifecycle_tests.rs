//! Lifecycle controller tests
//!
//! Start/stop idempotence, endpoint publication to the diverter, and
//! restart behavior.

use anyhow::Result;
use async_trait::async_trait;
use gatewarden::{
    Diverter, DiverterEndpoints, DiverterFactory, NoopTrustStore, ProxyConfig, ProxyEngine,
    ProxyHandler, TrustStore, TrustStoreError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Passthrough;
impl ProxyHandler for Passthrough {}

#[derive(Default)]
struct RecordingDiverter {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl Diverter for RecordingDiverter {
    async fn start(&self, _num_threads: i32) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn drop_external_proxies(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct RecordingFactory {
    diverter: Arc<RecordingDiverter>,
    endpoints: Mutex<Vec<DiverterEndpoints>>,
}

impl DiverterFactory for RecordingFactory {
    fn create(
        &self,
        endpoints: DiverterEndpoints,
        _handler: Arc<dyn ProxyHandler>,
        block_external_proxies: bool,
    ) -> Result<Arc<dyn Diverter>> {
        assert!(block_external_proxies, "default configuration blocks external proxies");
        self.endpoints.lock().push(endpoints);
        Ok(Arc::clone(&self.diverter) as Arc<dyn Diverter>)
    }
}

fn config_with(factory: Arc<RecordingFactory>) -> ProxyConfig {
    ProxyConfig::new(Arc::new(Passthrough), Arc::new(NoopTrustStore), factory)
}

#[tokio::test]
async fn test_start_publishes_bound_endpoints() {
    let factory = Arc::new(RecordingFactory::default());
    let engine = ProxyEngine::new(config_with(Arc::clone(&factory)))
        .await
        .unwrap();

    engine.start().await.unwrap();
    assert!(engine.is_running().await);

    let endpoints = factory.endpoints.lock()[0];
    assert!(endpoints.v4_http.is_ipv4());
    assert!(endpoints.v6_http.is_ipv6());
    assert_ne!(endpoints.v4_http.port(), 0);
    assert_ne!(endpoints.v6_http.port(), 0);
    // Each public listener carries both protocols on its one port; the
    // per-family pair reports that same endpoint.
    assert_eq!(endpoints.v4_http, endpoints.v4_https);
    assert_eq!(endpoints.v6_http, endpoints.v6_https);

    let replay = engine.replay_endpoint().await.unwrap();
    assert!(replay.ip().is_loopback());

    assert_eq!(factory.diverter.starts.load(Ordering::SeqCst), 1);
    engine.stop().await;
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let factory = Arc::new(RecordingFactory::default());
    let engine = ProxyEngine::new(config_with(Arc::clone(&factory)))
        .await
        .unwrap();

    engine.start().await.unwrap();
    engine.start().await.unwrap();
    assert_eq!(factory.diverter.starts.load(Ordering::SeqCst), 1);

    engine.stop().await;
    engine.stop().await;
    assert_eq!(factory.diverter.stops.load(Ordering::SeqCst), 1);
    assert!(!engine.is_running().await);
    assert!(engine.endpoints().await.is_none());
}

#[tokio::test]
async fn test_engine_restarts_with_fresh_listeners() {
    let factory = Arc::new(RecordingFactory::default());
    let engine = ProxyEngine::new(config_with(Arc::clone(&factory)))
        .await
        .unwrap();

    engine.start().await.unwrap();
    engine.stop().await;
    engine.start().await.unwrap();

    assert!(engine.is_running().await);
    assert_eq!(factory.diverter.starts.load(Ordering::SeqCst), 2);
    assert_eq!(factory.endpoints.lock().len(), 2);

    engine.stop().await;
}

#[tokio::test]
async fn test_empty_authority_name_is_fatal() {
    let factory = Arc::new(RecordingFactory::default());
    let config = config_with(factory).with_authority_name("");
    let result = ProxyEngine::new(config).await;
    assert!(matches!(
        result,
        Err(gatewarden::EngineError::ConfigurationInvalid(_))
    ));
}

#[tokio::test]
async fn test_trust_install_failure_is_fatal() {
    struct RefusingTrustStore;

    #[async_trait]
    impl TrustStore for RefusingTrustStore {
        async fn remove_by_subject(&self, _cn: &str) -> Result<(), TrustStoreError> {
            Ok(())
        }

        async fn install(&self, _der: &[u8]) -> Result<(), TrustStoreError> {
            Err(TrustStoreError::Unavailable("no trust store".into()))
        }
    }

    let factory = Arc::new(RecordingFactory::default());
    let config = ProxyConfig::new(
        Arc::new(Passthrough),
        Arc::new(RefusingTrustStore),
        factory,
    );
    let result = ProxyEngine::new(config).await;
    assert!(matches!(result, Err(gatewarden::EngineError::CertStore(_))));
}
