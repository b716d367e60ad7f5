//! DNSSEC Key Data Model
//!
//! Key records, key sets and the per-CDN bundle persisted in the KV cluster,
//! plus the delivery service metadata read from the relational database and
//! the error type shared by every component.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// KEY RECORDS
// =============================================================================

/// Lifecycle status of a key within a key set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Freshly minted; the head of a key set
    New,
    /// A prior generation kept for rollover
    Existing,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::New => write!(f, "new"),
            KeyStatus::Existing => write!(f, "existing"),
        }
    }
}

/// Which half of the signing hierarchy a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Key Signing Key (DNSKEY flags 257)
    Ksk,
    /// Zone Signing Key (DNSKEY flags 256)
    Zsk,
}

impl KeyKind {
    /// DNSKEY flags field for this kind
    pub fn flags(&self) -> u16 {
        match self {
            KeyKind::Ksk => 257,
            KeyKind::Zsk => 256,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Ksk => write!(f, "KSK"),
            KeyKind::Zsk => write!(f, "ZSK"),
        }
    }
}

/// DS (Delegation Signer) record attached to a KSK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DsRecord {
    #[serde(with = "as_string")]
    pub algorithm: u8,
    #[serde(with = "as_string")]
    pub digest_type: u8,
    /// Upper-case hex digest
    pub digest: String,
    #[serde(default)]
    pub key_tag: u16,
}

/// A single DNSSEC key as stored in the bundle
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnssecKey {
    /// Unix seconds the key was created
    #[serde(rename = "inceptionDate")]
    pub inception: i64,
    /// Unix seconds the key stops being valid
    #[serde(rename = "expirationDate")]
    pub expiration: i64,
    /// Unix seconds the key becomes active
    #[serde(rename = "effectiveDate", default)]
    pub effective: i64,
    /// Zone this key signs
    pub name: String,
    #[serde(rename = "ttl", with = "as_string")]
    pub ttl_seconds: u64,
    pub status: KeyStatus,
    /// DNSKEY resource record in zone-file form
    #[serde(with = "base64_bytes")]
    pub public: Vec<u8>,
    /// BIND private-key file contents
    #[serde(with = "base64_bytes")]
    pub private: Vec<u8>,
    #[serde(rename = "dsRecord", default, skip_serializing_if = "Option::is_none")]
    pub ds_record: Option<DsRecord>,
}

impl DnssecKey {
    /// Copy of this key demoted to a prior generation that stops being valid
    /// at `effective`
    pub fn demoted(&self, ttl_seconds: u64, effective: i64) -> Self {
        let mut key = self.clone();
        key.status = KeyStatus::Existing;
        key.ttl_seconds = ttl_seconds;
        key.expiration = effective;
        key
    }
}

impl fmt::Debug for DnssecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnssecKey")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("inception", &self.inception)
            .field("expiration", &self.expiration)
            .field("effective", &self.effective)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("public_len", &self.public.len())
            .field("private", &"<redacted>")
            .field("ds_record", &self.ds_record)
            .finish()
    }
}

/// KSKs and ZSKs for one zone. Index 0 is the active key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnssecKeySet {
    #[serde(default)]
    pub zsk: Vec<DnssecKey>,
    #[serde(default)]
    pub ksk: Vec<DnssecKey>,
}

impl DnssecKeySet {
    pub fn head_ksk(&self) -> Option<&DnssecKey> {
        self.ksk.first()
    }

    pub fn head_zsk(&self) -> Option<&DnssecKey> {
        self.zsk.first()
    }

    /// Both sequences are non-empty and headed by a `new` key
    pub fn has_active_heads(&self) -> bool {
        matches!(self.head_ksk(), Some(k) if k.status == KeyStatus::New)
            && matches!(self.head_zsk(), Some(k) if k.status == KeyStatus::New)
    }
}

/// Every key set for a CDN, keyed by zone name (the CDN name itself plus one
/// entry per delivery service xml_id)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CdnDnssecBundle(pub BTreeMap<String, DnssecKeySet>);

impl CdnDnssecBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, zone: &str) -> Option<&DnssecKeySet> {
        self.0.get(zone)
    }

    pub fn insert(&mut self, zone: impl Into<String>, keys: DnssecKeySet) {
        self.0.insert(zone.into(), keys);
    }

    pub fn contains(&self, zone: &str) -> bool {
        self.0.contains_key(zone)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn zones(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

// =============================================================================
// DELIVERY SERVICE METADATA
// =============================================================================

/// Delivery service types known to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsType {
    Http,
    HttpNoCache,
    HttpLive,
    HttpLiveNational,
    Dns,
    DnsLive,
    DnsLiveNational,
    AnyMap,
    Steering,
    ClientSteering,
}

impl DsType {
    pub fn is_http(&self) -> bool {
        matches!(
            self,
            DsType::Http | DsType::HttpNoCache | DsType::HttpLive | DsType::HttpLiveNational
        )
    }

    pub fn is_dns(&self) -> bool {
        matches!(self, DsType::Dns | DsType::DnsLive | DsType::DnsLiveNational)
    }

    /// Routed by DNS or HTTP and therefore signed
    pub fn is_signed(&self) -> bool {
        self.is_http() || self.is_dns()
    }
}

impl fmt::Display for DsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DsType::Http => "HTTP",
            DsType::HttpNoCache => "HTTP_NO_CACHE",
            DsType::HttpLive => "HTTP_LIVE",
            DsType::HttpLiveNational => "HTTP_LIVE_NATNL",
            DsType::Dns => "DNS",
            DsType::DnsLive => "DNS_LIVE",
            DsType::DnsLiveNational => "DNS_LIVE_NATNL",
            DsType::AnyMap => "ANY_MAP",
            DsType::Steering => "STEERING",
            DsType::ClientSteering => "CLIENT_STEERING",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for DsType {
    type Err = DnssecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HTTP" => Ok(DsType::Http),
            "HTTP_NO_CACHE" => Ok(DsType::HttpNoCache),
            "HTTP_LIVE" => Ok(DsType::HttpLive),
            "HTTP_LIVE_NATNL" => Ok(DsType::HttpLiveNational),
            "DNS" => Ok(DsType::Dns),
            "DNS_LIVE" => Ok(DsType::DnsLive),
            "DNS_LIVE_NATNL" => Ok(DsType::DnsLiveNational),
            "ANY_MAP" => Ok(DsType::AnyMap),
            "STEERING" => Ok(DsType::Steering),
            "CLIENT_STEERING" => Ok(DsType::ClientSteering),
            _ => Err(DnssecError::Database(format!(
                "got invalid delivery service type '{}'",
                s
            ))),
        }
    }
}

/// Basic delivery service data needed to mint its keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryServiceDescriptor {
    pub xml_id: String,
    /// Protocol selector: 0 HTTP, 1 HTTPS, 2 HTTP and HTTPS, 3 HTTP to HTTPS
    pub protocol: Option<i64>,
    pub ds_type: DsType,
    pub routing_name: String,
}

/// Kind of a delivery service regex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    HostRegexp,
    PathRegexp,
    HeaderRegexp,
}

impl FromStr for MatchType {
    type Err = DnssecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HOST_REGEXP" => Ok(MatchType::HostRegexp),
            "PATH_REGEXP" => Ok(MatchType::PathRegexp),
            "HEADER_REGEXP" => Ok(MatchType::HeaderRegexp),
            _ => Err(DnssecError::Database(format!("got invalid regex type '{}'", s))),
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchType::HostRegexp => write!(f, "HOST_REGEXP"),
            MatchType::PathRegexp => write!(f, "PATH_REGEXP"),
            MatchType::HeaderRegexp => write!(f, "HEADER_REGEXP"),
        }
    }
}

/// One entry of a delivery service match list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEntry {
    pub match_type: MatchType,
    pub pattern: String,
    /// 0 for the routing regex; other sets hold literal hostnames
    pub set_number: i64,
}

impl MatchEntry {
    pub fn host(pattern: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::HostRegexp,
            pattern: pattern.into(),
            set_number: 0,
        }
    }
}

pub type MatchList = Vec<MatchEntry>;

// =============================================================================
// DEADLINES
// =============================================================================

/// Request deadline propagated into every external call
#[derive(Debug, Clone, Copy)]
pub struct Deadline(tokio::time::Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(tokio::time::Instant::now() + timeout)
    }

    pub fn instant(&self) -> tokio::time::Instant {
        self.0
    }

    /// Fail with `RequestCancelled` once the deadline has passed
    pub fn check(&self, what: &str) -> Result<(), DnssecError> {
        if tokio::time::Instant::now() >= self.0 {
            return Err(DnssecError::RequestCancelled(format!(
                "{}: deadline exceeded",
                what
            )));
        }
        Ok(())
    }

    /// Run `fut`, failing with `RequestCancelled` if the deadline passes first
    pub async fn run<T, F>(&self, what: &str, fut: F) -> Result<T, DnssecError>
    where
        F: Future<Output = Result<T, DnssecError>>,
    {
        match tokio::time::timeout_at(self.0, fut).await {
            Ok(result) => result,
            Err(_) => Err(DnssecError::RequestCancelled(format!(
                "{}: deadline exceeded",
                what
            ))),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Root cause classification used for HTTP status mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    BundleMissing,
    MatchList,
    Crypto,
    StoreUnavailable,
    StoreSerialization,
    Database,
    RequestCancelled,
    Internal,
    Config,
}

/// DNSSEC key management errors
#[derive(Debug, thiserror::Error)]
pub enum DnssecError {
    #[error("{0}")]
    BadRequest(String),

    #[error("getting DNSSec keys from Riak: no DNSSec keys for CDN {0}")]
    BundleMissing(String),

    #[error("{0}")]
    MatchList(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("malformed stored value: {0}")]
    StoreSerialization(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("request cancelled: {0}")]
    RequestCancelled(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {inner}")]
    Context {
        context: String,
        inner: Box<DnssecError>,
    },
}

impl DnssecError {
    /// Wrap this error with a one-line context prefix
    pub fn context(self, context: impl Into<String>) -> Self {
        DnssecError::Context {
            context: context.into(),
            inner: Box::new(self),
        }
    }

    /// Kind of the innermost error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DnssecError::BadRequest(_) => ErrorKind::BadRequest,
            DnssecError::BundleMissing(_) => ErrorKind::BundleMissing,
            DnssecError::MatchList(_) => ErrorKind::MatchList,
            DnssecError::Crypto(_) => ErrorKind::Crypto,
            DnssecError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            DnssecError::StoreSerialization(_) => ErrorKind::StoreSerialization,
            DnssecError::Database(_) => ErrorKind::Database,
            DnssecError::RequestCancelled(_) => ErrorKind::RequestCancelled,
            DnssecError::Internal(_) => ErrorKind::Internal,
            DnssecError::Config(_) => ErrorKind::Config,
            DnssecError::Context { inner, .. } => inner.kind(),
        }
    }
}

impl From<rusqlite::Error> for DnssecError {
    fn from(e: rusqlite::Error) -> Self {
        DnssecError::Database(e.to_string())
    }
}

/// Context prefixing for `Result`s carrying a `DnssecError`
pub trait ResultExt<T> {
    fn context(self, context: &str) -> Result<T, DnssecError>;
}

impl<T> ResultExt<T> for Result<T, DnssecError> {
    fn context(self, context: &str) -> Result<T, DnssecError> {
        self.map_err(|e| e.context(context))
    }
}

// =============================================================================
// SERDE HELPERS
// =============================================================================

/// Numbers carried as decimal strings on the wire; plain numbers are accepted too
mod as_string {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }

    pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let raw = match StringOrNumber::deserialize(deserializer)? {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        };
        raw.trim().parse::<T>().map_err(serde::de::Error::custom)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
