//! CDN DNSSEC Key Lifecycle
//!
//! Generates, rotates, stores and serves the DNSSEC signing keys (KSK and
//! ZSK) of a CDN and of every delivery service routed through it.
//!
//! ## Architecture
//!
//! ```text
//! Admin → HTTP API → DbTx (SQLite, commit gated on success)
//!                       ↓
//!                    Rotator ── Metadata (delivery services, match lists)
//!                       ↓
//!          Example URLs → Key Material (bounded worker pool)
//!                       ↓
//!                    Key Store → KV cluster (bucket "dnssec", key = CDN)
//! ```
//!
//! ## Components
//!
//! - `dnssec_types`: Key records, key sets, bundles, delivery service metadata, errors
//! - `dnssec_config`: Service configuration (listen address, database, KV cluster, crypto)
//! - `key_material`: KSK/ZSK generation, DNSKEY and DS record computation
//! - `example_urls`: Example URL synthesis from delivery service host regexes
//! - `key_store`: Whole-bundle persistence in a KV cluster with scoped sessions
//! - `metadata`: Delivery service queries, audit log and the scoped DB transaction
//! - `schema`: SQLite schema bootstrap
//! - `rotator`: Key rotation for a CDN and its delivery services
//! - `dnssec_api`: HTTP handlers

pub mod dnssec_types;
pub mod dnssec_config;
pub mod key_material;
pub mod example_urls;
pub mod key_store;
pub mod metadata;
pub mod schema;
pub mod rotator;
pub mod dnssec_api;

pub use dnssec_types::*;
pub use dnssec_config::*;
pub use key_material::{KeyMaterialFactory, MintRequest};
pub use key_store::{KeyStore, KvCluster, KvSession, MemoryKvCluster, RedisKvCluster};
pub use metadata::{Database, DbTx};
pub use rotator::{RotationRequest, Rotator};
pub use dnssec_api::{run_dnssec_api, ApiResponse, DnssecApi, GenerateRequest};
