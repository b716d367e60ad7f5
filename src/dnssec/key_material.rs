//! DNSSEC Key Material
//!
//! Mints KSK/ZSK records for a zone: generates the asymmetric key pair,
//! renders the DNSKEY record and BIND private-key file, and computes the DS
//! record for KSKs. Generation is CPU bound and runs on a bounded pool of
//! blocking workers.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pkcs8::PrivateKeyInfo;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use sec1::EcPrivateKey;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::debug;

use super::dnssec_config::{CryptoConfig, DnssecAlgorithm};
use super::{Deadline, DnssecError, DnssecKey, DsRecord, KeyKind, KeyStatus};

/// DS digest type for SHA-256
pub const DIGEST_TYPE_SHA256: u8 = 2;

/// DNSKEY protocol field, always 3
const DNSKEY_PROTOCOL: u8 = 3;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;

/// Parameters of one key to mint
#[derive(Debug, Clone)]
pub struct MintRequest {
    /// Zone the key signs
    pub zone: String,
    pub kind: KeyKind,
    pub algorithm: DnssecAlgorithm,
    /// RSA modulus bits; ignored for ECDSA
    pub key_size: usize,
    pub inception: i64,
    pub expiration: i64,
    pub ttl_seconds: u64,
}

/// Mint a single key record. Blocks while the key pair is generated.
pub fn mint(req: &MintRequest) -> Result<DnssecKey, DnssecError> {
    if req.expiration < req.inception {
        return Err(DnssecError::Crypto(format!(
            "expiration {} precedes inception {} for {}",
            req.expiration, req.inception, req.zone
        )));
    }

    let owner = fqdn(&req.zone);
    let owner_wire = domain_to_wire_format(&owner)?;

    let pair = generate_keypair(req.algorithm, req.key_size, req.inception)?;
    let flags = req.kind.flags();
    let algorithm = req.algorithm.number();

    let dnskey = format!(
        "{} {} IN DNSKEY {} {} {} {}",
        owner,
        req.ttl_seconds,
        flags,
        DNSKEY_PROTOCOL,
        algorithm,
        STANDARD.encode(&pair.public_key)
    );

    let ds_record = match req.kind {
        KeyKind::Ksk => Some(ds_record_from_wire(&owner_wire, flags, algorithm, &pair.public_key)),
        KeyKind::Zsk => None,
    };

    Ok(DnssecKey {
        inception: req.inception,
        expiration: req.expiration,
        effective: req.inception,
        name: req.zone.clone(),
        ttl_seconds: req.ttl_seconds,
        status: KeyStatus::New,
        public: dnskey.into_bytes(),
        private: pair.private_text.into_bytes(),
        ds_record,
    })
}

/// Mints keys on a bounded pool of blocking workers
pub struct KeyMaterialFactory {
    algorithm: DnssecAlgorithm,
    key_size: usize,
    workers: Arc<Semaphore>,
}

impl KeyMaterialFactory {
    pub fn new(config: &CryptoConfig) -> Self {
        Self::with_algorithm(config.algorithm, config.key_size, config.worker_threads)
    }

    pub fn with_algorithm(algorithm: DnssecAlgorithm, key_size: usize, worker_threads: usize) -> Self {
        Self {
            algorithm,
            key_size,
            workers: Arc::new(Semaphore::new(worker_threads.max(1))),
        }
    }

    pub fn algorithm(&self) -> DnssecAlgorithm {
        self.algorithm
    }

    /// Build a request using this factory's algorithm and key size
    pub fn request(
        &self,
        zone: &str,
        kind: KeyKind,
        inception: i64,
        expiration: i64,
        ttl_seconds: u64,
    ) -> MintRequest {
        MintRequest {
            zone: zone.to_string(),
            kind,
            algorithm: self.algorithm,
            key_size: self.key_size,
            inception,
            expiration,
            ttl_seconds,
        }
    }

    /// Mint a key on a worker, honouring `deadline`
    pub async fn mint(&self, req: MintRequest, deadline: Deadline) -> Result<DnssecKey, DnssecError> {
        deadline.check("generating key")?;

        let workers = Arc::clone(&self.workers);
        let permit = deadline
            .run("waiting for key generation worker", async move {
                workers
                    .acquire_owned()
                    .await
                    .map_err(|_| DnssecError::Internal("key generation pool closed".to_string()))
            })
            .await?;

        debug!("Minting {} {} for {}", req.algorithm, req.kind, req.zone);

        let job = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            mint(&req)
        });

        deadline
            .run("generating key", async move {
                job.await
                    .map_err(|e| DnssecError::Internal(format!("key generation task failed: {}", e)))?
            })
            .await
    }
}

// =============================================================================
// KEY PAIRS
// =============================================================================

/// Raw key pair: the DNSKEY public key field and the private-key file text
pub(crate) struct GeneratedKeyPair {
    pub public_key: Vec<u8>,
    pub private_text: String,
}

pub(crate) fn generate_keypair(
    algorithm: DnssecAlgorithm,
    key_size: usize,
    created: i64,
) -> Result<GeneratedKeyPair, DnssecError> {
    match algorithm {
        DnssecAlgorithm::RsaSha256 => generate_rsa(key_size, created),
        DnssecAlgorithm::EcdsaP256Sha256 => generate_ecdsa_p256(created),
    }
}

fn generate_rsa(bits: usize, created: i64) -> Result<GeneratedKeyPair, DnssecError> {
    let mut rng = rand::rngs::OsRng;
    let key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| DnssecError::Crypto(format!("generating RSA key: {}", e)))?;

    let public_key = rsa_dnskey_public(key.e(), key.n());

    let primes = key.primes();
    let (prime1, prime2) = match primes {
        [p, q] => (p, q),
        _ => {
            return Err(DnssecError::Crypto(format!(
                "expected 2 RSA primes, got {}",
                primes.len()
            )))
        }
    };
    let missing = || DnssecError::Crypto("RSA CRT values not precomputed".to_string());
    let exponent1 = key.dp().ok_or_else(missing)?;
    let exponent2 = key.dq().ok_or_else(missing)?;
    let coefficient = key.crt_coefficient().ok_or_else(missing)?;

    let fields = [
        ("Modulus", key.n().to_bytes_be()),
        ("PublicExponent", key.e().to_bytes_be()),
        ("PrivateExponent", key.d().to_bytes_be()),
        ("Prime1", prime1.to_bytes_be()),
        ("Prime2", prime2.to_bytes_be()),
        ("Exponent1", exponent1.to_bytes_be()),
        ("Exponent2", exponent2.to_bytes_be()),
        ("Coefficient", coefficient.to_bytes_be()),
    ];

    let private_text = private_key_text(DnssecAlgorithm::RsaSha256, &fields, created)?;
    Ok(GeneratedKeyPair {
        public_key,
        private_text,
    })
}

/// RSA public key in DNSKEY form (RFC 3110): exponent length, exponent, modulus
fn rsa_dnskey_public(exponent: &BigUint, modulus: &BigUint) -> Vec<u8> {
    let e = exponent.to_bytes_be();
    let n = modulus.to_bytes_be();

    let mut out = Vec::with_capacity(3 + e.len() + n.len());
    if e.len() <= 255 {
        out.push(e.len() as u8);
    } else {
        out.push(0);
        out.extend_from_slice(&(e.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(&e);
    out.extend_from_slice(&n);
    out
}

fn generate_ecdsa_p256(created: i64) -> Result<GeneratedKeyPair, DnssecError> {
    let rng = SystemRandom::new();

    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .map_err(|_| DnssecError::Crypto("generating ECDSA P-256 key".to_string()))?;
    let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
        .map_err(|e| DnssecError::Crypto(format!("loading ECDSA P-256 key: {}", e)))?;

    // Uncompressed SEC1 point; DNSKEY carries X || Y without the 0x04 prefix
    let point = pair.public_key().as_ref();
    if point.len() != 65 || point[0] != 0x04 {
        return Err(DnssecError::Crypto("unexpected ECDSA public key encoding".to_string()));
    }
    let public_key = point[1..].to_vec();

    let scalar = ec_private_scalar(pkcs8.as_ref())?;
    let private_text = private_key_text(
        DnssecAlgorithm::EcdsaP256Sha256,
        &[("PrivateKey", scalar)],
        created,
    )?;

    Ok(GeneratedKeyPair {
        public_key,
        private_text,
    })
}

/// Pull the 32-byte private scalar out of a P-256 PKCS#8 document
fn ec_private_scalar(document: &[u8]) -> Result<Vec<u8>, DnssecError> {
    let info = PrivateKeyInfo::try_from(document)
        .map_err(|e| DnssecError::Crypto(format!("decoding PKCS#8 document: {}", e)))?;
    let ec_key = EcPrivateKey::try_from(info.private_key)
        .map_err(|e| DnssecError::Crypto(format!("decoding SEC1 private key: {}", e)))?;

    if ec_key.private_key.len() != 32 {
        return Err(DnssecError::Crypto(format!(
            "ECDSA P-256 scalar is {} bytes",
            ec_key.private_key.len()
        )));
    }
    Ok(ec_key.private_key.to_vec())
}

/// BIND `Private-key-format: v1.3` document
fn private_key_text(
    algorithm: DnssecAlgorithm,
    fields: &[(&str, Vec<u8>)],
    created: i64,
) -> Result<String, DnssecError> {
    let timestamp = chrono::DateTime::from_timestamp(created, 0)
        .ok_or_else(|| DnssecError::Crypto(format!("timestamp {} out of range", created)))?
        .format("%Y%m%d%H%M%S")
        .to_string();

    let mut text = String::from("Private-key-format: v1.3\n");
    text.push_str(&format!("Algorithm: {} ({})\n", algorithm.number(), algorithm.name()));
    for (label, value) in fields {
        text.push_str(&format!("{}: {}\n", label, STANDARD.encode(value)));
    }
    text.push_str(&format!("Created: {}\n", timestamp));
    text.push_str(&format!("Publish: {}\n", timestamp));
    text.push_str(&format!("Activate: {}\n", timestamp));
    Ok(text)
}

// =============================================================================
// DNSKEY / DS
// =============================================================================

/// DNSKEY RDATA: flags (2) + protocol (1) + algorithm (1) + public key
pub fn dnskey_rdata(flags: u16, algorithm: u8, public_key: &[u8]) -> Vec<u8> {
    let mut rdata = Vec::with_capacity(4 + public_key.len());
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(DNSKEY_PROTOCOL);
    rdata.push(algorithm);
    rdata.extend_from_slice(public_key);
    rdata
}

/// Calculate DNSKEY key tag per RFC 4034 Appendix B
pub fn calculate_key_tag(flags: u16, algorithm: u8, public_key: &[u8]) -> u16 {
    let rdata = dnskey_rdata(flags, algorithm, public_key);
    let mut ac: u32 = 0;

    for (i, byte) in rdata.iter().enumerate() {
        if i % 2 == 0 {
            ac += (*byte as u32) << 8;
        } else {
            ac += *byte as u32;
        }
    }

    ac += (ac >> 16) & 0xFFFF;
    (ac & 0xFFFF) as u16
}

/// DS record: SHA-256(owner name wire form || DNSKEY RDATA)
pub fn ds_record(owner: &str, flags: u16, algorithm: u8, public_key: &[u8]) -> Result<DsRecord, DnssecError> {
    let owner_wire = domain_to_wire_format(owner)?;
    Ok(ds_record_from_wire(&owner_wire, flags, algorithm, public_key))
}

fn ds_record_from_wire(owner_wire: &[u8], flags: u16, algorithm: u8, public_key: &[u8]) -> DsRecord {
    let mut hasher = Sha256::new();
    hasher.update(owner_wire);
    hasher.update(dnskey_rdata(flags, algorithm, public_key));

    DsRecord {
        algorithm,
        digest_type: DIGEST_TYPE_SHA256,
        digest: hex::encode(hasher.finalize()).to_uppercase(),
        key_tag: calculate_key_tag(flags, algorithm, public_key),
    }
}

/// Canonical (lower-case) wire format of a domain name.
///
/// Labels are at most 63 bytes and the whole name at most 255.
fn domain_to_wire_format(domain: &str) -> Result<Vec<u8>, DnssecError> {
    let mut wire = Vec::with_capacity(domain.len() + 2);

    for label in domain.split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(DnssecError::MatchList(format!(
                "label of {} bytes in '{}' exceeds {} bytes",
                label.len(),
                domain,
                MAX_LABEL_LEN
            )));
        }
        wire.push(label.len() as u8);
        wire.extend(label.bytes().map(|b| b.to_ascii_lowercase()));
    }

    wire.push(0); // Root label
    if wire.len() > MAX_NAME_LEN {
        return Err(DnssecError::MatchList(format!(
            "name '{}' is {} bytes on the wire, limit is {}",
            domain,
            wire.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(wire)
}

/// Absolute form of a zone name
pub fn fqdn(zone: &str) -> String {
    if zone.ends_with('.') {
        zone.to_string()
    } else {
        format!("{}.", zone)
    }
}
