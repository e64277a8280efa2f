//! Secure transport configuration
//!
//! The session runs its twinned connections over QUIC via `quinn`. This
//! module builds the client and server configurations both directions share:
//! one ALPN value, a short idle timeout sized for game traffic, aggressive
//! ack scheduling, and datagram support for the unreliable lane.
//!
//! Peers do not authenticate each other. The server presents the
//! materialized self-signed credential from [`credentials`], and the client
//! accepts any certificate. Encryption still keeps middleboxes and casual
//! observers out of the game state.

pub mod credentials;
pub(crate) mod demux;

use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{AckFrequencyConfig, EndpointConfig, IdleTimeout, TransportConfig, VarInt};

/// ALPN value both sides must offer.
pub const ALPN: &[u8] = b"mygame-ksyn";

/// Server name presented during the TLS handshake. Never validated.
pub const SERVER_NAME: &str = "koisyn";

/// Connections die after this long without traffic.
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Half a frame at 60 Hz. Acks must not sit longer than this.
const MAX_ACK_DELAY: Duration = Duration::from_millis(8);

/// Bidirectional streams the server grants the connecting side. One per
/// reliable lane.
const PEER_BIDI_STREAMS: u32 = 4;

/// Endpoint-level settings shared by the listener and per-peer client
/// endpoints. QUIC-bit greasing hides the protocol from middleboxes that
/// key on the fixed bit.
pub(crate) fn endpoint_config() -> EndpointConfig {
    let mut config = EndpointConfig::default();
    config.grease_quic_bit(true);
    config
}

fn tuning(peer_bidi_streams: u32) -> TransportConfig {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        IdleTimeout::try_from(IDLE_TIMEOUT).expect("idle timeout fits the varint range"),
    ));
    transport.max_concurrent_bidi_streams(VarInt::from(peer_bidi_streams));
    transport.max_concurrent_uni_streams(VarInt::from(0u32));
    transport.datagram_receive_buffer_size(Some(65536));

    let mut ack = AckFrequencyConfig::default();
    ack.max_ack_delay(Some(MAX_ACK_DELAY));
    transport.ack_frequency_config(Some(ack));

    transport
}

/// Client configuration: accept any server certificate, offer the ALPN.
pub(crate) fn client_config() -> crate::Result<quinn::ClientConfig> {
    let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(crypto)?));
    config.transport_config(Arc::new(tuning(0)));
    Ok(config)
}

/// Server configuration: present the materialized credential, grant the
/// connecting peer one bidirectional stream per reliable lane.
pub(crate) fn server_config() -> crate::Result<quinn::ServerConfig> {
    let creds = credentials::load()?;

    let mut crypto = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])?
    .with_no_client_auth()
    .with_single_cert(creds.cert_chain.clone(), creds.key.clone_key())?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(crypto)?));
    config.transport_config(Arc::new(tuning(PEER_BIDI_STREAMS)));
    Ok(config)
}

/// Accepts every server certificate.
///
/// The credential is a well-known self-signed blob; validating it would add
/// nothing. The TLS layer is kept for encryption only.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
