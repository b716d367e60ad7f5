//! DNSSEC Key Rotation
//!
//! Produces a new generation of keys for a CDN and every DNS or HTTP routed
//! delivery service on it. The CDN's prior head keys are kept one position
//! down with status `existing`; delivery service key sets are minted fresh.

use std::sync::Arc;

use tracing::{debug, info};

use super::example_urls;
use super::key_material::{fqdn, KeyMaterialFactory};
use super::key_store::KeyStore;
use super::metadata::{self, DbTx};
use super::{
    CdnDnssecBundle, Deadline, DeliveryServiceDescriptor, DnssecError, DnssecKey, DnssecKeySet,
    KeyKind, MatchList, ResultExt,
};

const SECONDS_PER_DAY: i64 = 86_400;

/// Parameters of one rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRequest {
    pub cdn_name: String,
    pub ttl_seconds: u64,
    pub ksk_expiration_days: u64,
    pub zsk_expiration_days: u64,
    pub effective_date_unix: i64,
}

impl RotationRequest {
    fn expiration(&self, days: u64) -> Result<i64, DnssecError> {
        i64::try_from(days)
            .ok()
            .and_then(|d| d.checked_mul(SECONDS_PER_DAY))
            .and_then(|s| self.effective_date_unix.checked_add(s))
            .ok_or_else(|| DnssecError::BadRequest(format!("expiration of {} days is out of range", days)))
    }

    fn ksk_expiration(&self) -> Result<i64, DnssecError> {
        self.expiration(self.ksk_expiration_days)
    }

    fn zsk_expiration(&self) -> Result<i64, DnssecError> {
        self.expiration(self.zsk_expiration_days)
    }
}

/// Rotates CDN key bundles
#[derive(Clone)]
pub struct Rotator {
    store: KeyStore,
    factory: Arc<KeyMaterialFactory>,
}

impl Rotator {
    pub fn new(store: KeyStore, factory: Arc<KeyMaterialFactory>) -> Self {
        Self { store, factory }
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    /// Rotate the keys of `req.cdn_name` and write the new bundle.
    ///
    /// Fails without touching the stored bundle if any step fails. On success
    /// the transaction's commit flag is set.
    pub async fn rotate(
        &self,
        tx: &mut DbTx,
        req: &RotationRequest,
        deadline: Deadline,
    ) -> Result<CdnDnssecBundle, DnssecError> {
        let cdn_name = req.cdn_name.as_str();
        let ksk_expiration = req.ksk_expiration()?;
        let zsk_expiration = req.zsk_expiration()?;

        let old_bundle = self
            .store
            .get(cdn_name, deadline)
            .await
            .context("getting old dnssec keys")?
            .ok_or_else(|| DnssecError::BundleMissing(cdn_name.to_string()))?;

        let (services, cdn_domain, match_lists) = tx
            .query(|conn| {
                let (services, cdn_domain) = metadata::list_cdn_delivery_services(conn, cdn_name)
                    .context("getting cdn delivery services")?;
                let ds_names: Vec<String> = services.iter().map(|ds| ds.xml_id.clone()).collect();
                let match_lists = metadata::get_match_lists(conn, &ds_names)
                    .context("getting delivery service matchlists")?;
                Ok((services, cdn_domain, match_lists))
            })
            .await
            .context("reading delivery service metadata")?;

        let prior = old_bundle.get(cdn_name).cloned().unwrap_or_default();
        let cdn_zone = cdn_zone_name(&prior, cdn_name, &cdn_domain);

        let mut new_bundle = CdnDnssecBundle::new();
        let cdn_keys = self
            .rotate_cdn_keys(prior, &cdn_zone, req, ksk_expiration, zsk_expiration, deadline)
            .await
            .context("creating CDN DNSSEC keys")?;
        new_bundle.insert(cdn_name, cdn_keys);

        for ds in &services {
            if !ds.ds_type.is_signed() {
                debug!("Skipping delivery service {} of type {}", ds.xml_id, ds.ds_type);
                continue;
            }

            let match_list = match_lists.get(&ds.xml_id).ok_or_else(|| {
                DnssecError::MatchList(format!(
                    "no regex match list found for delivery service '{}'",
                    ds.xml_id
                ))
            })?;

            info!("Creating keys for {}", ds.xml_id);
            let keys = self
                .delivery_service_keys(ds, match_list, &cdn_domain, req, ksk_expiration, zsk_expiration, deadline)
                .await
                .context("creating delivery service DNSSEC keys")?;
            new_bundle.insert(ds.xml_id.clone(), keys);
        }

        self.store
            .put(cdn_name, &new_bundle, deadline)
            .await
            .context("putting Riak DNSSEC CDN keys")?;

        tx.set_commit(true);
        info!(
            "Rotated DNSSEC keys for CDN {} ({} zones)",
            cdn_name,
            new_bundle.len()
        );
        Ok(new_bundle)
    }

    /// New head keys for the CDN apex, followed by the demoted prior heads
    /// and the older generations
    async fn rotate_cdn_keys(
        &self,
        prior: DnssecKeySet,
        zone: &str,
        req: &RotationRequest,
        ksk_expiration: i64,
        zsk_expiration: i64,
        deadline: Deadline,
    ) -> Result<DnssecKeySet, DnssecError> {
        let ksk = self
            .mint(zone, KeyKind::Ksk, req, ksk_expiration, deadline)
            .await?;
        let zsk = self
            .mint(zone, KeyKind::Zsk, req, zsk_expiration, deadline)
            .await?;

        Ok(DnssecKeySet {
            ksk: roll(ksk, prior.ksk, req),
            zsk: roll(zsk, prior.zsk, req),
        })
    }

    /// One KSK and one ZSK per example URL, in URL order
    #[allow(clippy::too_many_arguments)]
    async fn delivery_service_keys(
        &self,
        ds: &DeliveryServiceDescriptor,
        match_list: &MatchList,
        cdn_domain: &str,
        req: &RotationRequest,
        ksk_expiration: i64,
        zsk_expiration: i64,
        deadline: Deadline,
    ) -> Result<DnssecKeySet, DnssecError> {
        let urls = example_urls::build(ds.protocol, ds.ds_type, &ds.routing_name, match_list, cdn_domain)?;
        if urls.is_empty() {
            return Err(DnssecError::MatchList(format!(
                "no example URLs for delivery service '{}'",
                ds.xml_id
            )));
        }

        let mut keys = DnssecKeySet::default();
        for url in &urls {
            let zone = example_urls::ds_zone_name(url)?;
            debug!("Minting keys for {} ({})", zone, url);
            keys.ksk
                .push(self.mint(&zone, KeyKind::Ksk, req, ksk_expiration, deadline).await?);
            keys.zsk
                .push(self.mint(&zone, KeyKind::Zsk, req, zsk_expiration, deadline).await?);
        }
        Ok(keys)
    }

    async fn mint(
        &self,
        zone: &str,
        kind: KeyKind,
        req: &RotationRequest,
        expiration: i64,
        deadline: Deadline,
    ) -> Result<DnssecKey, DnssecError> {
        let mint_req = self.factory.request(
            zone,
            kind,
            req.effective_date_unix,
            expiration,
            req.ttl_seconds,
        );
        self.factory.mint(mint_req, deadline).await
    }
}

/// `[head, demoted(prior[0]), prior[1..]]`
fn roll(head: DnssecKey, prior: Vec<DnssecKey>, req: &RotationRequest) -> Vec<DnssecKey> {
    let mut keys = Vec::with_capacity(prior.len() + 1);
    keys.push(head);

    let mut prior = prior.into_iter();
    if let Some(previous) = prior.next() {
        keys.push(previous.demoted(req.ttl_seconds, req.effective_date_unix));
    }
    keys.extend(prior);
    keys
}

/// Zone of the CDN apex keys: the prior head's zone, else the CDN domain
fn cdn_zone_name(prior: &DnssecKeySet, cdn_name: &str, cdn_domain: &str) -> String {
    if let Some(head) = prior.head_ksk().or_else(|| prior.head_zsk()) {
        return head.name.clone();
    }
    if cdn_domain.is_empty() {
        fqdn(cdn_name)
    } else {
        fqdn(cdn_domain)
    }
}
