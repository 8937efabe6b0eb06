//! Client-side entry point: dial a URL and adopt the negotiated transport
//! into a [`Connection`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use super::connection::{spawn_pumps, Connection, ConnectionConfig, ConnectionId};
use super::handler::Handler;

/// TLS behavior for [`connect`]. `skip_verify` exists for test environments
/// only (§1 Non-goals) — never set it for a production endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsOptions {
    pub skip_verify: bool,
}

impl TlsOptions {
    fn connector(self) -> Result<Option<tokio_tungstenite::Connector>> {
        if !self.skip_verify {
            return Ok(None);
        }
        let provider = rustls::crypto::ring::default_provider();
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .context("building rustls protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertVerification))
            .with_no_client_auth();
        Ok(Some(tokio_tungstenite::Connector::Rustls(Arc::new(config))))
    }
}

/// Opens a WebSocket client connection to `url`, performing the RFC 6455
/// handshake, and spawns its reader/writer pumps.
///
/// Addresses are captured from the raw TCP socket before any TLS wrapping,
/// so the resulting [`ConnectionId`] is accurate for both `ws://` and
/// `wss://` endpoints. Returns an error if the URL is invalid, the TCP
/// dial fails, or the handshake is rejected.
pub async fn connect(
    url: &str,
    handler: Arc<dyn Handler>,
    config: ConnectionConfig,
    tls: TlsOptions,
) -> Result<Connection> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("invalid connection config for {url}"))?;

    let request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let host = request
        .uri()
        .host()
        .with_context(|| format!("WebSocket URL has no host: {url}"))?
        .to_string();
    let is_tls = request.uri().scheme_str() == Some("wss");
    let port = request
        .uri()
        .port_u16()
        .unwrap_or(if is_tls { 443 } else { 80 });

    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("TCP dial to {host}:{port} failed"))?;
    let id = ConnectionId::new(
        tcp.local_addr().ok().map(|a| a.port()),
        tcp.peer_addr().ok(),
    );

    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.limit_message_bytes))
        .max_frame_size(Some(config.limit_message_bytes));
    let connector = tls.connector()?;

    let (stream, _response) =
        tokio_tungstenite::client_async_tls_with_config(request, tcp, Some(ws_config), connector)
            .await
            .with_context(|| format!("WebSocket handshake with {url} failed"))?;

    Ok(spawn_pumps(stream, id, config, handler, None))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate without validation. Only reachable
    /// via [`super::TlsOptions::skip_verify`], intended for test
    /// environments talking to a self-signed endpoint.
    #[derive(Debug)]
    pub struct NoCertVerification;

    impl ServerCertVerifier for NoCertVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA1,
                SignatureScheme::ECDSA_SHA1_Legacy,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::handler::Ignorer;

    #[tokio::test]
    async fn connect_invalid_url_returns_error() {
        let result = connect(
            "not-a-url",
            Arc::new(Ignorer),
            ConnectionConfig::default(),
            TlsOptions::default(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connect_unreachable_host_returns_error() {
        let result = connect(
            "ws://127.0.0.1:1/invalid",
            Arc::new(Ignorer),
            ConnectionConfig::default(),
            TlsOptions::default(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connect_rejects_invalid_config() {
        let bad_config = ConnectionConfig::default().with_ping_period(std::time::Duration::ZERO);
        let result = connect(
            "ws://127.0.0.1:1/invalid",
            Arc::new(Ignorer),
            bad_config,
            TlsOptions::default(),
        )
        .await;
        assert!(result.is_err());
    }
}
