//! TLS SNI adapter
//!
//! For each accepted socket: peek up to 4 KiB looking for a ClientHello.
//! TLS connections get a leaf minted for their SNI and a completed
//! server-side handshake; anything else is handed to the plain-HTTP path
//! with the peeked bytes replayed. A hello without SNI cannot be
//! intercepted and closes the connection.

use bytes::BytesMut;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::certs::{CertStoreError, SpoofedCertStore};
use crate::tls::peek::{parse_client_hello, PeekError, Sniff};
use crate::tls::rewind::Rewind;

/// Peek window size. A ClientHello that does not fit cannot be sniffed.
const PEEK_WINDOW: usize = 4096;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("handshake peek failed: {0}")]
    PeekFailed(&'static str),

    #[error("ClientHello carried no server name")]
    SniMissing,

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error(transparent)]
    Certificate(#[from] CertStoreError),

    #[error("socket error during peek: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PeekError> for AdapterError {
    fn from(_: PeekError) -> Self {
        AdapterError::PeekFailed("malformed ClientHello")
    }
}

/// A connection after TLS detection.
pub enum AcceptedStream<S> {
    /// Decrypted TLS connection terminated with a spoofed leaf.
    Tls {
        stream: TlsStream<Rewind<S>>,
        /// The hostname the client asked for via SNI.
        sni: String,
        /// Whether the peer presented a client certificate. Forwarding it
        /// upstream is a declared future extension.
        has_peer_certificate: bool,
    },
    /// No TLS detected; the peeked bytes are replayed ahead of the inner
    /// stream.
    Plain { stream: Rewind<S> },
}

/// Detect TLS on `socket` and, when present, terminate it with a leaf
/// for the advertised SNI.
pub async fn accept<S>(
    mut socket: S,
    certs: &SpoofedCertStore,
) -> Result<AcceptedStream<S>, AdapterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut peeked = BytesMut::with_capacity(PEEK_WINDOW);

    let sniff = loop {
        match parse_client_hello(&peeked)? {
            Sniff::NeedMoreData => {
                if peeked.len() >= PEEK_WINDOW {
                    return Err(AdapterError::PeekFailed("peek window exhausted"));
                }
                let n = socket.read_buf(&mut peeked).await?;
                if n == 0 {
                    return Err(AdapterError::PeekFailed("connection closed during peek"));
                }
            }
            other => break other,
        }
    };

    match sniff {
        Sniff::NotTls => {
            debug!(peeked = peeked.len(), "no ClientHello, plain-HTTP passthrough");
            Ok(AcceptedStream::Plain {
                stream: Rewind::new(socket, peeked.freeze()),
            })
        }
        Sniff::ClientHello { server_name: None } => Err(AdapterError::SniMissing),
        Sniff::ClientHello {
            server_name: Some(sni),
        } => {
            let leaf = certs.leaf_for(&sni).await?;
            let acceptor = TlsAcceptor::from(leaf.server_config());
            let rewound = Rewind::new(socket, peeked.freeze());

            let stream = acceptor.accept(rewound).await.map_err(|e| {
                warn!(sni = %sni, error = %e, "server-side TLS handshake failed");
                AdapterError::HandshakeFailed(e.to_string())
            })?;

            let has_peer_certificate = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| !certs.is_empty())
                .unwrap_or(false);

            debug!(sni = %sni, "TLS interception handshake complete");
            Ok(AcceptedStream::Tls {
                stream,
                sni,
                has_peer_certificate,
            })
        }
        Sniff::NeedMoreData => unreachable!("loop exits only on a decision"),
    }
}

/// Build a TLS acceptor for a pre-fetched leaf. Used by tests that drive
/// handshakes without the full adapter.
pub fn acceptor_for(leaf: &Arc<crate::certs::LeafCert>) -> TlsAcceptor {
    TlsAcceptor::from(leaf.server_config())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::trust::NoopTrustStore;
    use crate::certs::DownstreamTlsRange;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn store() -> SpoofedCertStore {
        SpoofedCertStore::new("AdapterTest", &NoopTrustStore, DownstreamTlsRange::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_plain_http_falls_through_with_bytes_intact() {
        let certs = store().await;
        let (client, server) = tokio::io::duplex(8192);

        let payload = b"GET /path HTTP/1.1\r\nHost: example.test\r\n\r\n";
        let mut client = client;
        client.write_all(payload).await.unwrap();
        client.shutdown().await.unwrap();

        match accept(server, &certs).await.unwrap() {
            AcceptedStream::Plain { mut stream } => {
                let mut out = Vec::new();
                stream.read_to_end(&mut out).await.unwrap();
                assert_eq!(out, payload);
            }
            AcceptedStream::Tls { .. } => panic!("plain HTTP misdetected as TLS"),
        }
    }

    #[tokio::test]
    async fn test_hello_without_sni_is_rejected() {
        let certs = store().await;
        let (client, server) = tokio::io::duplex(8192);

        let hello = crate::tls::peek::tests::build_client_hello(None);
        let mut client = client;
        client.write_all(&hello).await.unwrap();

        let result = accept(server, &certs).await;
        assert!(matches!(result, Err(AdapterError::SniMissing)));
    }

    #[tokio::test]
    async fn test_eof_during_peek_fails() {
        let certs = store().await;
        let (client, server) = tokio::io::duplex(8192);

        // Half a record header, then EOF.
        let mut client = client;
        client.write_all(&[0x16, 0x03]).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let result = accept(server, &certs).await;
        assert!(matches!(result, Err(AdapterError::PeekFailed(_))));
    }

    #[tokio::test]
    async fn test_full_handshake_against_spoofed_leaf() {
        use rustls::pki_types::ServerName;
        use tokio_rustls::TlsConnector;

        let certs = Arc::new(store().await);
        let (client_io, server_io) = tokio::io::duplex(65536);

        let certs_server = Arc::clone(&certs);
        let server = tokio::spawn(async move {
            match accept(server_io, &certs_server).await.unwrap() {
                AcceptedStream::Tls { sni, .. } => sni,
                AcceptedStream::Plain { .. } => panic!("TLS misdetected as plain"),
            }
        });

        // Client trusting only the spoofed CA.
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(rustls::pki_types::CertificateDer::from(
                certs.ca_cert_der().to_vec(),
            ))
            .unwrap();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from("spoofed.test").unwrap();

        let _client_tls = connector.connect(name, client_io).await.unwrap();
        assert_eq!(server.await.unwrap(), "spoofed.test");
    }
}
