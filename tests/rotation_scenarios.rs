//! End-to-end key rotation scenarios driven through the HTTP handlers

use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Method, Request, Response, StatusCode};

use cdn_dnssec::dnssec::key_material::mint;
use cdn_dnssec::dnssec::key_store::DNSSEC_BUCKET;
use cdn_dnssec::dnssec::schema::{insert_cdn, insert_delivery_service, insert_regex};
use cdn_dnssec::dnssec::{
    CdnDnssecBundle, Database, Deadline, DnssecAlgorithm, DnssecApi, DnssecKeySet, KeyKind,
    KeyMaterialFactory, KeyStatus, KeyStore, MemoryKvCluster, Rotator,
};

const CDN: &str = "cdn-a";

struct Harness {
    api: DnssecApi,
    db: Database,
    cluster: Arc<MemoryKvCluster>,
}

impl Harness {
    fn new(db: Database) -> Self {
        let cluster = Arc::new(MemoryKvCluster::new());
        let factory = Arc::new(KeyMaterialFactory::with_algorithm(
            DnssecAlgorithm::EcdsaP256Sha256,
            0,
            2,
        ));
        let rotator = Rotator::new(KeyStore::new(cluster.clone()), factory);
        let api = DnssecApi::new(db.clone(), rotator, Duration::from_secs(30));
        Self { api, db, cluster }
    }

    fn in_memory() -> Self {
        Self::new(Database::in_memory().unwrap())
    }

    fn store(&self) -> KeyStore {
        KeyStore::new(self.cluster.clone())
    }

    /// CDN with one HTTP delivery service per name, each with one host regex
    async fn seed_cdn(&self, services: &[(&str, &str)]) {
        let services: Vec<(String, String)> = services
            .iter()
            .map(|(name, ty)| (name.to_string(), ty.to_string()))
            .collect();
        self.db
            .with_conn(move |conn| {
                let cdn = insert_cdn(conn, CDN, "mycdn.com")?;
                for (name, ty) in &services {
                    let ds = insert_delivery_service(conn, name, cdn, ty, Some(0), "cdn")?;
                    insert_regex(conn, ds, "HOST_REGEXP", &format!(r".*\.{}\..*", name), 0)?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn seed_bundle(&self) -> CdnDnssecBundle {
        let factory = KeyMaterialFactory::with_algorithm(DnssecAlgorithm::EcdsaP256Sha256, 0, 1);
        let now = chrono::Utc::now().timestamp();
        let ksk = mint(&factory.request("mycdn.com.", KeyKind::Ksk, now - 86_400, now + 86_400, 60)).unwrap();
        let zsk = mint(&factory.request("mycdn.com.", KeyKind::Zsk, now - 86_400, now + 86_400, 60)).unwrap();

        let mut bundle = CdnDnssecBundle::new();
        bundle.insert(CDN, DnssecKeySet { zsk: vec![zsk], ksk: vec![ksk] });
        self.store().put(CDN, &bundle, deadline()).await.unwrap();
        bundle
    }

    async fn stored(&self) -> Option<CdnDnssecBundle> {
        self.store().get(CDN, deadline()).await.unwrap()
    }

    async fn stored_raw(&self) -> Option<Vec<u8>> {
        self.cluster.object(DNSSEC_BUCKET, CDN).await.map(|o| o.value)
    }

    async fn send(&self, method: Method, uri: &str, body: Body) -> Response<Body> {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("X-User", "ops-admin")
            .body(body)
            .unwrap();
        self.api.handle_request(req).await.unwrap()
    }

    async fn generate(&self, body: serde_json::Value) -> Response<Body> {
        self.send(Method::POST, "/cdns/dnssecks/generate", Body::from(body.to_string()))
            .await
    }

    async fn audit_messages(&self) -> Vec<String> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT message FROM log ORDER BY id")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                let mut messages = Vec::new();
                for row in rows {
                    messages.push(row?);
                }
                Ok(messages)
            })
            .await
            .unwrap()
    }
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(10))
}

fn generate_body() -> serde_json::Value {
    serde_json::json!({
        "key": CDN,
        "ttl": 3600,
        "kskExpirationDays": 365,
        "zskExpirationDays": 30,
    })
}

async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn cold_rotate_refuses() {
    let h = Harness::in_memory();
    h.seed_cdn(&[("ds1", "HTTP")]).await;

    let response = h.generate(generate_body()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let json = body_json(response).await;
    assert!(json["message"].as_str().unwrap().contains("no DNSSec keys for CDN"));
    assert!(h.cluster.is_empty().await);
    assert!(h.audit_messages().await.is_empty());
}

#[tokio::test]
async fn warm_rotate() {
    let h = Harness::in_memory();
    h.seed_cdn(&[("ds1", "HTTP"), ("ds2", "HTTP")]).await;
    let old = h.seed_bundle().await;

    let mut body = generate_body();
    body["effectiveDateUnix"] = serde_json::json!(chrono::Utc::now().timestamp());
    let response = h.generate(body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["message"], "Successfully created dnssec keys for cdn-a");

    let bundle = h.stored().await.unwrap();
    let cdn = bundle.get(CDN).unwrap();
    assert_eq!(cdn.ksk.len(), 2);
    assert_eq!(cdn.zsk.len(), 2);
    assert_eq!(cdn.ksk[0].status, KeyStatus::New);
    assert_eq!(cdn.zsk[0].status, KeyStatus::New);
    assert_eq!(cdn.ksk[1].status, KeyStatus::Existing);
    assert_eq!(cdn.zsk[1].status, KeyStatus::Existing);
    assert_eq!(cdn.ksk[1].public, old.get(CDN).unwrap().ksk[0].public);

    for ds in ["ds1", "ds2"] {
        let keys = bundle.get(ds).unwrap();
        assert!(!keys.ksk.is_empty());
        assert!(!keys.zsk.is_empty());
        assert!(keys.has_active_heads());
        assert!(keys.ksk[0].inception <= keys.ksk[0].effective);
        assert!(keys.ksk[0].effective <= keys.ksk[0].expiration);
    }
    assert_eq!(bundle.len(), 3);

    assert_eq!(h.audit_messages().await, vec!["Generated DNSSEC keys for CDN cdn-a"]);
}

#[tokio::test]
async fn skip_any_map() {
    let h = Harness::in_memory();
    h.seed_cdn(&[("ds1", "HTTP"), ("anymap", "ANY_MAP")]).await;
    h.seed_bundle().await;

    let response = h.generate(generate_body()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let bundle = h.stored().await.unwrap();
    assert!(bundle.contains("ds1"));
    assert!(!bundle.contains("anymap"));
}

#[tokio::test]
async fn missing_match_list() {
    let h = Harness::in_memory();
    h.seed_cdn(&[("ds2", "HTTP")]).await;
    h.db
        .with_conn(|conn| {
            let cdn: i64 = conn.query_row("SELECT id FROM cdn WHERE name = ?1", [CDN], |row| row.get(0))?;
            insert_delivery_service(conn, "d1", cdn, "HTTP", Some(0), "cdn")?;
            Ok(())
        })
        .await
        .unwrap();
    h.seed_bundle().await;
    let before = h.stored_raw().await;

    let response = h.generate(generate_body()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(h.stored_raw().await, before);
    assert!(h.audit_messages().await.is_empty());
}

#[tokio::test]
async fn delete_then_get() {
    let h = Harness::in_memory();
    h.seed_cdn(&[("ds1", "HTTP"), ("ds2", "HTTP")]).await;
    h.seed_bundle().await;
    assert_eq!(h.generate(generate_body()).await.status(), StatusCode::OK);

    let response = h.send(Method::DELETE, "/cdns/name/cdn-a/dnssec", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["message"], "Successfully deleted dnssec for cdn-a");

    let response = h.send(Method::GET, "/cdns/name/cdn-a/dnssec", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = h.send(Method::DELETE, "/cdns/name/cdn-a/dnssec", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(h.cluster.open_sessions(), 0);
    assert_eq!(
        h.audit_messages().await,
        vec![
            "Generated DNSSEC keys for CDN cdn-a",
            "Deleted DNSSEC keys for CDN cdn-a",
            "Deleted DNSSEC keys for CDN cdn-a",
        ]
    );
}

#[tokio::test]
async fn effective_date_defaults_to_now() {
    let h = Harness::in_memory();
    h.seed_cdn(&[("ds1", "HTTP")]).await;
    h.seed_bundle().await;

    let t = chrono::Utc::now().timestamp();
    assert_eq!(h.generate(generate_body()).await.status(), StatusCode::OK);

    let bundle = h.stored().await.unwrap();
    for (zone, keys) in &bundle.0 {
        let head_ksk = &keys.ksk[0];
        let head_zsk = &keys.zsk[0];
        for key in [head_ksk, head_zsk] {
            assert!(
                (t - 5..=t + 5).contains(&key.inception),
                "{} key inception {} not near {}",
                zone,
                key.inception,
                t
            );
        }
    }
}

#[tokio::test]
async fn delivery_service_keys_by_id() {
    let h = Harness::in_memory();
    h.seed_cdn(&[("ds1", "DNS")]).await;
    h.seed_bundle().await;
    assert_eq!(h.generate(generate_body()).await.status(), StatusCode::OK);

    let response = h.send(Method::GET, "/deliveryservices/1/dnssec", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["ksk"][0]["name"], "ds1.mycdn.com.");
    assert_eq!(json["data"]["ksk"][0]["status"], "new");
    assert!(json["data"]["ksk"][0]["dsRecord"]["digest"].is_string());
}

#[tokio::test]
async fn on_disk_database() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(Database::open(dir.path().join("traffic_ops.db")).unwrap());
    h.seed_cdn(&[("ds1", "HTTP_LIVE")]).await;
    h.seed_bundle().await;

    assert_eq!(h.generate(generate_body()).await.status(), StatusCode::OK);
    assert!(h.stored().await.unwrap().contains("ds1"));
}
