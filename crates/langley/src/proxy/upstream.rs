//! Outbound connections to the real servers. Certificate verification
//! against the system roots is on by default; a per-host insecure override
//! exists for corporate middleboxes and is logged loudly every time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{
	HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
	#[error("dns/tcp connect to {host}:{port}: {source}")]
	Connect {
		host: String,
		port: u16,
		source: std::io::Error,
	},
	#[error("connect to {host}:{port} timed out")]
	Timeout { host: String, port: u16 },
	#[error("tls handshake with {host}: {source}")]
	Tls {
		host: String,
		source: std::io::Error,
	},
	#[error("invalid server name {0:?}")]
	ServerName(String),
}

pub struct UpstreamConnector {
	verified: Arc<ClientConfig>,
	insecure: Arc<ClientConfig>,
	insecure_hosts: HashSet<String>,
}

impl UpstreamConnector {
	pub fn new(insecure_hosts: &[String]) -> anyhow::Result<UpstreamConnector> {
		let mut roots = RootCertStore::empty();
		let native = rustls_native_certs::load_native_certs();
		for err in &native.errors {
			tracing::warn!(error = %err, "skipping unreadable system root");
		}
		let (_added, ignored) = roots.add_parsable_certificates(native.certs);
		if ignored > 0 {
			tracing::debug!(ignored, "ignored unparsable system roots");
		}
		let verified = ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();

		let insecure = ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerify::new()))
			.with_no_client_auth();

		Ok(UpstreamConnector {
			verified: Arc::new(verified),
			insecure: Arc::new(insecure),
			insecure_hosts: insecure_hosts
				.iter()
				.map(|h| h.to_ascii_lowercase())
				.collect(),
		})
	}

	/// Dial and complete the TLS handshake with the real `host:port`.
	pub async fn connect(
		&self,
		host: &str,
		port: u16,
	) -> Result<TlsStream<TcpStream>, UpstreamError> {
		let config = if self.insecure_hosts.contains(&host.to_ascii_lowercase()) {
			tracing::warn!(host, "upstream certificate verification DISABLED for this host");
			self.insecure.clone()
		} else {
			self.verified.clone()
		};
		let server_name = ServerName::try_from(host.to_string())
			.map_err(|_| UpstreamError::ServerName(host.to_string()))?;

		let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
			.await
			.map_err(|_| UpstreamError::Timeout {
				host: host.to_string(),
				port,
			})?
			.map_err(|e| UpstreamError::Connect {
				host: host.to_string(),
				port,
				source: e,
			})?;
		let _ = tcp.set_nodelay(true);

		tokio::time::timeout(
			DIAL_TIMEOUT,
			TlsConnector::from(config).connect(server_name, tcp),
		)
		.await
		.map_err(|_| UpstreamError::Timeout {
			host: host.to_string(),
			port,
		})?
		.map_err(|e| UpstreamError::Tls {
			host: host.to_string(),
			source: e,
		})
	}
}

/// Accepts any upstream certificate. Only reachable through the explicit
/// per-host insecure override.
#[derive(Debug)]
struct NoVerify {
	schemes: Vec<SignatureScheme>,
}

impl NoVerify {
	fn new() -> NoVerify {
		NoVerify {
			schemes: vec![
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::ED25519,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
			],
		}
	}
}

impl ServerCertVerifier for NoVerify {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.schemes.clone()
	}
}
