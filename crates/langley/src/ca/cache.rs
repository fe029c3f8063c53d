//! Per-host leaf certificates, issued lazily and cached LRU.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rcgen::{
	CertificateParams, CrlDistributionPoint, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose,
	SanType, SerialNumber,
};
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration as TimeDuration, OffsetDateTime};

use super::{CertificateAuthority, random_serial};

pub const DEFAULT_CAPACITY: usize = 1000;
/// Leaf lifetime cap; also clamped to the CA's own NotAfter.
const LEAF_VALIDITY_DAYS: i64 = 90;
const LEAF_BACKDATE_HOURS: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
	#[error("certificate generation: {0}")]
	Rcgen(#[from] rcgen::Error),
	#[error("tls config: {0}")]
	Rustls(#[from] rustls::Error),
}

struct Entry {
	config: Arc<ServerConfig>,
	not_after: OffsetDateTime,
	last_used: u64,
}

/// Leaf cache. One mutex guards the map; issuance happens outside the
/// critical section with a re-check on insert, so concurrent misses for the
/// same host cost at most one wasted keypair.
pub struct CertCache {
	ca: Arc<CertificateAuthority>,
	entries: Mutex<HashMap<String, Entry>>,
	capacity: usize,
	clock: AtomicU64,
}

impl CertCache {
	pub fn new(ca: Arc<CertificateAuthority>, capacity: usize) -> CertCache {
		CertCache {
			ca,
			entries: Mutex::new(HashMap::new()),
			capacity: capacity.max(1),
			clock: AtomicU64::new(0),
		}
	}

	fn tick(&self) -> u64 {
		self.clock.fetch_add(1, Ordering::Relaxed)
	}

	/// Cached leaf for `host`, regenerated on expiry. Issuance failure
	/// aborts only the requesting exchange; the cache is unchanged.
	pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, IssueError> {
		let now = OffsetDateTime::now_utc();
		{
			let mut entries = self.entries.lock();
			if let Some(entry) = entries.get_mut(host) {
				if entry.not_after > now {
					entry.last_used = self.clock.fetch_add(1, Ordering::Relaxed);
					return Ok(entry.config.clone());
				}
				entries.remove(host);
			}
		}

		let (config, not_after) = self.issue(host)?;

		let mut entries = self.entries.lock();
		// A racing miss may have issued first; its leaf is just as good.
		if let Some(entry) = entries.get_mut(host)
			&& entry.not_after > now
		{
			entry.last_used = self.tick();
			return Ok(entry.config.clone());
		}
		if entries.len() >= self.capacity {
			evict_lru(&mut entries);
		}
		entries.insert(
			host.to_string(),
			Entry {
				config: config.clone(),
				not_after,
				last_used: self.tick(),
			},
		);
		Ok(config)
	}

	fn issue(&self, host: &str) -> Result<(Arc<ServerConfig>, OffsetDateTime), IssueError> {
		let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
			let mut params = CertificateParams::new(Vec::new())?;
			params.subject_alt_names.push(SanType::IpAddress(ip));
			params
		} else {
			CertificateParams::new(vec![host.to_string()])?
		};
		params.serial_number = Some(SerialNumber::from_slice(&random_serial()));
		params
			.distinguished_name
			.push(rcgen::DnType::CommonName, host);
		params.key_usages = vec![
			KeyUsagePurpose::DigitalSignature,
			KeyUsagePurpose::KeyEncipherment,
		];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		params.crl_distribution_points = vec![CrlDistributionPoint {
			uris: vec![self.ca.crl_url().to_string()],
		}];
		let now = OffsetDateTime::now_utc();
		params.not_before = now - TimeDuration::hours(LEAF_BACKDATE_HOURS);
		let not_after = (now + TimeDuration::days(LEAF_VALIDITY_DAYS)).min(self.ca.not_after());
		params.not_after = not_after;

		let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
		let cert = params.signed_by(&key_pair, self.ca.issuer())?;

		let chain: Vec<CertificateDer<'static>> =
			vec![cert.der().clone(), self.ca.cert_der().clone()];
		let key: PrivateKeyDer<'static> =
			PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into();
		let mut config = ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(chain, key)?;
		config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
		Ok((Arc::new(config), not_after))
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[cfg(test)]
	fn contains(&self, host: &str) -> bool {
		self.entries.lock().contains_key(host)
	}
}

fn evict_lru(entries: &mut HashMap<String, Entry>) {
	if let Some(victim) = entries
		.iter()
		.min_by_key(|(_, entry)| entry.last_used)
		.map(|(host, _)| host.clone())
	{
		tracing::debug!(host = %victim, "evicting least-recently-used leaf");
		entries.remove(&victim);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ca::CertificateAuthority;

	fn cache(capacity: usize) -> (tempfile::TempDir, CertCache) {
		let dir = tempfile::tempdir().unwrap();
		let ca = Arc::new(
			CertificateAuthority::load_or_create(dir.path(), "http://127.0.0.1:9091/crl.der").unwrap(),
		);
		(dir, CertCache::new(ca, capacity))
	}

	#[test]
	fn issues_and_caches() {
		let (_dir, cache) = cache(10);
		let a = cache.server_config("api.anthropic.com").unwrap();
		let b = cache.server_config("api.anthropic.com").unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn lru_evicts_oldest() {
		let (_dir, cache) = cache(2);
		cache.server_config("a.example.com").unwrap();
		cache.server_config("b.example.com").unwrap();
		// Touch `a` so `b` becomes the LRU victim.
		cache.server_config("a.example.com").unwrap();
		cache.server_config("c.example.com").unwrap();
		assert_eq!(cache.len(), 2);
		assert!(cache.contains("a.example.com"));
		assert!(!cache.contains("b.example.com"));
		assert!(cache.contains("c.example.com"));
	}

	#[test]
	fn evicted_host_gets_fresh_leaf() {
		let (_dir, cache) = cache(2);
		let first = cache.server_config("a.example.com").unwrap();
		cache.server_config("b.example.com").unwrap();
		cache.server_config("c.example.com").unwrap();
		assert!(!cache.contains("a.example.com"));
		let second = cache.server_config("a.example.com").unwrap();
		// New issuance, new serial: distinct config object.
		assert!(!Arc::ptr_eq(&first, &second));
	}

	#[test]
	fn ip_literal_hosts_are_issuable() {
		let (_dir, cache) = cache(4);
		cache.server_config("127.0.0.1").unwrap();
		assert_eq!(cache.len(), 1);
	}
}
