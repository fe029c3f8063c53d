//! Local certificate authority: a self-signed root that signs per-host
//! leaves, plus the CRL the leaves point at. The key is written once with
//! owner-only permissions and never overwritten silently.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use rcgen::{
	BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName, DnType,
	IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls_pki_types::CertificateDer;
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::errors::{ActionableError, InitError};

pub mod cache;

const CA_COMMON_NAME: &str = "Langley Local CA";
/// Root validity; kept under the two-year ceiling client platforms enforce.
const CA_VALIDITY_DAYS: i64 = 730;
/// NotBefore backdate for clock-skew tolerance.
const CA_BACKDATE_HOURS: i64 = 24;
const CRL_VALIDITY_DAYS: i64 = 30;

pub struct CertificateAuthority {
	issuer: Issuer<'static, KeyPair>,
	cert_der: CertificateDer<'static>,
	cert_pem: String,
	not_after: OffsetDateTime,
	crl_url: String,
	crl_der: Mutex<Vec<u8>>,
	cert_path: PathBuf,
}

impl std::fmt::Debug for CertificateAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertificateAuthority")
			.field("cert_pem", &self.cert_pem)
			.field("not_after", &self.not_after)
			.field("crl_url", &self.crl_url)
			.field("cert_path", &self.cert_path)
			.finish_non_exhaustive()
	}
}

impl CertificateAuthority {
	/// Load the CA from `certs/` under the config dir, generating it on
	/// first start. Parse and validity failures are classified so the
	/// launcher can tell the user whether to delete or chmod.
	pub fn load_or_create(config_dir: &Path, crl_url: &str) -> Result<CertificateAuthority, InitError> {
		let certs_dir = config_dir.join("certs");
		let cert_path = certs_dir.join("ca.crt");
		let key_path = certs_dir.join("ca.key");

		let (cert_pem, key_pem) = if cert_path.exists() || key_path.exists() {
			(read_pem(&cert_path)?, read_pem(&key_path)?)
		} else {
			fs::create_dir_all(&certs_dir).map_err(|e| {
				InitError::Io(ActionableError::new(
					format!("cannot create {}", certs_dir.display()),
					e.to_string(),
					"check permissions on the config directory",
				))
			})?;
			let generated = generate_ca()?;
			// Key first: if the cert write fails we remove the key so no
			// half-created CA is left behind.
			write_atomic(&key_path, generated.1.as_bytes(), 0o600)?;
			if let Err(e) = write_atomic(&cert_path, generated.0.as_bytes(), 0o644) {
				let _ = fs::remove_file(&key_path);
				return Err(e);
			}
			tracing::info!(cert = %cert_path.display(), "generated local CA");
			generated
		};

		let (cert_der, not_after) = validate_ca_pem(&cert_pem, &cert_path)?;
		let key = KeyPair::from_pem(&key_pem).map_err(|e| corrupt(&key_path, e.to_string()))?;
		let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)
			.map_err(|e| corrupt(&cert_path, e.to_string()))?;

		let ca = CertificateAuthority {
			issuer,
			cert_der,
			cert_pem,
			not_after,
			crl_url: crl_url.to_string(),
			crl_der: Mutex::new(Vec::new()),
			cert_path,
		};
		ca.refresh_crl()?;
		Ok(ca)
	}

	pub fn cert_der(&self) -> &CertificateDer<'static> {
		&self.cert_der
	}

	pub fn cert_pem(&self) -> &str {
		&self.cert_pem
	}

	pub fn cert_path(&self) -> &Path {
		&self.cert_path
	}

	pub fn not_after(&self) -> OffsetDateTime {
		self.not_after
	}

	pub fn crl_url(&self) -> &str {
		&self.crl_url
	}

	pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
		&self.issuer
	}

	/// Current CRL in DER form, for the local distribution endpoint.
	pub fn crl_der(&self) -> Vec<u8> {
		self.crl_der.lock().clone()
	}

	/// Re-sign an empty CRL with fresh ThisUpdate/NextUpdate.
	pub fn refresh_crl(&self) -> Result<(), InitError> {
		let now = OffsetDateTime::now_utc();
		let params = CertificateRevocationListParams {
			this_update: now,
			next_update: now + TimeDuration::days(CRL_VALIDITY_DAYS),
			crl_number: SerialNumber::from_slice(&random_serial()),
			issuing_distribution_point: None,
			revoked_certs: Vec::new(),
			key_identifier_method: KeyIdMethod::Sha256,
		};
		let crl = params.signed_by(&self.issuer).map_err(|e| {
			InitError::CaCorrupt(ActionableError::new(
				"cannot sign CRL",
				e.to_string(),
				"delete the certs directory to regenerate the CA",
			))
		})?;
		*self.crl_der.lock() = crl.der().to_vec();
		tracing::debug!("CRL rotated");
		Ok(())
	}
}

/// Periodic CRL rotation, well inside the 30-day NextUpdate window.
pub async fn run_crl_refresher(
	ca: std::sync::Arc<CertificateAuthority>,
	mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
	let mut tick = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
	tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	loop {
		tokio::select! {
			_ = tick.tick() => {
				if let Err(e) = ca.refresh_crl() {
					tracing::warn!(error = %e, "CRL refresh failed");
				}
			},
			_ = shutdown.changed() => break,
		}
	}
}

fn generate_ca() -> Result<(String, String), InitError> {
	let mut params = CertificateParams::default();
	params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	params.serial_number = Some(SerialNumber::from_slice(&random_serial()));
	let now = OffsetDateTime::now_utc();
	params.not_before = now - TimeDuration::hours(CA_BACKDATE_HOURS);
	params.not_after = now + TimeDuration::days(CA_VALIDITY_DAYS);
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, CA_COMMON_NAME);
	dn.push(DnType::OrganizationName, "Langley");
	params.distinguished_name = dn;
	params.key_identifier_method = KeyIdMethod::Sha256;

	let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(gen_err)?;
	let cert = params.self_signed(&key_pair).map_err(gen_err)?;
	Ok((cert.pem(), key_pair.serialize_pem()))
}

fn gen_err(e: rcgen::Error) -> InitError {
	InitError::CaCorrupt(ActionableError::new(
		"CA generation failed",
		e.to_string(),
		"report this as a bug",
	))
}

/// 128-bit random serial, guaranteed non-zero.
pub(crate) fn random_serial() -> [u8; 16] {
	let mut bytes = [0u8; 16];
	loop {
		rand::rng().fill(&mut bytes);
		// Clear the top bit so the DER integer stays positive.
		bytes[0] &= 0x7f;
		if bytes.iter().any(|b| *b != 0) {
			return bytes;
		}
	}
}

fn validate_ca_pem(
	pem: &str,
	path: &Path,
) -> Result<(CertificateDer<'static>, OffsetDateTime), InitError> {
	let der = rustls_pemfile::certs(&mut pem.as_bytes())
		.next()
		.ok_or_else(|| corrupt(path, "no certificate in file".to_string()))?
		.map_err(|e| corrupt(path, e.to_string()))?;
	let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
		.map_err(|e| corrupt(path, format!("{e:?}")))?;
	let is_ca = parsed
		.basic_constraints()
		.ok()
		.flatten()
		.map(|bc| bc.value.ca)
		.unwrap_or(false);
	if !is_ca {
		return Err(corrupt(path, "certificate is not a CA".to_string()));
	}
	let not_after = parsed.validity().not_after.to_datetime();
	if not_after <= OffsetDateTime::now_utc() {
		return Err(corrupt(path, "certificate has expired".to_string()));
	}
	Ok((der.into_owned(), not_after))
}

fn corrupt(path: &Path, cause: String) -> InitError {
	InitError::CaCorrupt(ActionableError::new(
		format!("CA material at {} is unusable", path.display()),
		cause,
		"delete the certs directory and restart to regenerate, then re-trust the new root",
	))
}

fn read_pem(path: &Path) -> Result<String, InitError> {
	fs::read_to_string(path).map_err(|e| {
		if e.kind() == std::io::ErrorKind::PermissionDenied {
			InitError::CaPermission(ActionableError::new(
				format!("cannot read {}", path.display()),
				e.to_string(),
				"fix ownership/permissions on the certs directory",
			))
		} else {
			corrupt(path, e.to_string())
		}
	})
}

/// Temp-file-then-link write: never overwrites an existing CA file, since
/// that would invalidate previously trusted chains.
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), InitError> {
	let io_err = |e: std::io::Error| {
		InitError::Io(ActionableError::new(
			format!("cannot write {}", path.display()),
			e.to_string(),
			"check permissions on the certs directory",
		))
	};
	let parent = path.parent().ok_or_else(|| {
		InitError::Io(ActionableError::new(
			format!("cannot write {}", path.display()),
			"missing parent directory",
			"check the config directory layout",
		))
	})?;
	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_nanos();
	let tmp = parent.join(format!(".ca.tmp.{}.{nanos}", std::process::id()));
	let mut file = open_with_mode(&tmp, mode).map_err(io_err)?;
	file.write_all(contents).map_err(io_err)?;
	file.sync_all().map_err(io_err)?;
	drop(file);
	fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(unix)]
fn open_with_mode(path: &Path, mode: u32) -> std::io::Result<File> {
	use std::os::unix::fs::OpenOptionsExt;
	OpenOptions::new()
		.write(true)
		.create_new(true)
		.mode(mode)
		.open(path)
}

#[cfg(not(unix))]
fn open_with_mode(path: &Path, _mode: u32) -> std::io::Result<File> {
	OpenOptions::new().write(true).create_new(true).open(path)
}
