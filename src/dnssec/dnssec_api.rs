//! DNSSEC Key Management HTTP API
//!
//! Provides REST API endpoints for CDN DNSSEC keys:
//! - Generate (rotate) the keys of a CDN and its delivery services
//! - Fetch and delete a CDN's key bundle
//! - Fetch a delivery service's key set by id
//!
//! Every handler runs under a request deadline and in a database
//! transaction that commits only when the handler succeeded.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::dnssec_config::DnssecServiceConfig;
use super::key_material::KeyMaterialFactory;
use super::key_store::{KeyStore, KvCluster};
use super::metadata::{self, Database};
use super::rotator::{RotationRequest, Rotator};
use super::{Deadline, DnssecError, ErrorKind};

/// Header naming the user recorded in the audit log
pub const USER_HEADER: &str = "x-user";

const UNKNOWN_USER: &str = "unknown";

// =============================================================================
// API RESPONSE
// =============================================================================

/// Standard API response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn success_message(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            data: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            data: None,
        }
    }
}

// =============================================================================
// REQUEST TYPES
// =============================================================================

/// Body of a generate request. Numbers may be sent as JSON numbers or strings.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    /// CDN name
    pub key: Option<String>,
    #[serde(default, deserialize_with = "int_or_string")]
    pub ttl: Option<u64>,
    #[serde(default, deserialize_with = "int_or_string")]
    pub ksk_expiration_days: Option<u64>,
    #[serde(default, deserialize_with = "int_or_string")]
    pub zsk_expiration_days: Option<u64>,
    pub effective_date_unix: Option<i64>,
}

impl GenerateRequest {
    /// Validate and fill defaults; the effective date defaults to `now`
    pub fn into_rotation(self, now: i64) -> Result<RotationRequest, DnssecError> {
        let mut missing = Vec::new();
        let cdn_name = self.key.map(|k| k.trim().to_string()).unwrap_or_default();
        if cdn_name.is_empty() {
            missing.push("key");
        }
        if self.ttl.is_none() {
            missing.push("ttl");
        }
        if self.ksk_expiration_days.is_none() {
            missing.push("kskExpirationDays");
        }
        if self.zsk_expiration_days.is_none() {
            missing.push("zskExpirationDays");
        }
        if !missing.is_empty() {
            let reasons: Vec<String> = missing
                .iter()
                .map(|field| format!("{}: cannot be blank", field))
                .collect();
            return Err(DnssecError::BadRequest(format!(
                "parsing request: {}",
                reasons.join(", ")
            )));
        }

        Ok(RotationRequest {
            cdn_name,
            ttl_seconds: self.ttl.unwrap_or_default(),
            ksk_expiration_days: self.ksk_expiration_days.unwrap_or_default(),
            zsk_expiration_days: self.zsk_expiration_days.unwrap_or_default(),
            effective_date_unix: self.effective_date_unix.unwrap_or(now),
        })
    }
}

fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(u64),
        String(String),
    }

    match Option::<IntOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IntOrString::Int(n)) => Ok(Some(n)),
        Some(IntOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("'{}' is not an integer: {}", s, e))),
    }
}

// =============================================================================
// API HANDLER
// =============================================================================

/// DNSSEC key management API
pub struct DnssecApi {
    db: Database,
    rotator: Rotator,
    request_timeout: Duration,
}

impl DnssecApi {
    pub fn new(db: Database, rotator: Rotator, request_timeout: Duration) -> Self {
        Self {
            db,
            rotator,
            request_timeout,
        }
    }

    /// Build the API from configuration and an already connected KV cluster
    pub fn from_config(config: &DnssecServiceConfig, db: Database, cluster: Arc<dyn KvCluster>) -> Self {
        let factory = Arc::new(KeyMaterialFactory::new(&config.crypto));
        let rotator = Rotator::new(KeyStore::new(cluster), factory);
        Self::new(db, rotator, config.server.request_timeout())
    }

    fn store(&self) -> &KeyStore {
        self.rotator.store()
    }

    /// Route an HTTP request
    pub async fn handle_request(
        &self,
        req: Request<Body>,
    ) -> Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let deadline = Deadline::after(self.request_timeout);

        debug!("DNSSEC API request: {} {}", method, path);

        let response = match (method, path.as_str()) {
            // Health check
            (Method::GET, "/health") => self.handle_health(),

            // Key generation
            (Method::POST, "/cdns/dnssecks/generate") | (Method::POST, "/cdns/dnsseckeys/generate") => {
                self.handle_generate(req, deadline).await
            }

            // CDN key bundles
            (Method::GET, p) if extract_cdn_name(p).is_some() => match extract_cdn_name(p) {
                Some(name) => self.handle_get_cdn_keys(&name, deadline).await,
                None => self.not_found(),
            },
            (Method::DELETE, p) if extract_cdn_name(p).is_some() => match extract_cdn_name(p) {
                Some(name) => self.handle_delete_cdn_keys(&name, user_of(&req), deadline).await,
                None => self.not_found(),
            },

            // Delivery service keys
            (Method::GET, p) if extract_ds_id(p).is_some() => match extract_ds_id(p) {
                Some(id) => self.handle_get_ds_keys(&id, deadline).await,
                None => self.not_found(),
            },

            _ => self.not_found(),
        };

        Ok(response)
    }

    // =========================================================================
    // HEALTH
    // =========================================================================

    fn handle_health(&self) -> Response<Body> {
        let response = serde_json::json!({
            "status": "healthy",
            "service": "cdn-dnssec",
            "request_timeout_secs": self.request_timeout.as_secs(),
        });
        json_response(StatusCode::OK, &response)
    }

    // =========================================================================
    // KEY HANDLERS
    // =========================================================================

    async fn handle_generate(&self, req: Request<Body>, deadline: Deadline) -> Response<Body> {
        let user = user_of(&req);
        let body: GenerateRequest = match parse_body(req).await {
            Ok(b) => b,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, &format!("parsing request: {}", e)),
        };
        let rotation = match body.into_rotation(chrono::Utc::now().timestamp()) {
            Ok(r) => r,
            Err(e) => return self.error_response("parsing generate request", &e),
        };
        let cdn_name = rotation.cdn_name.clone();

        let mut tx = self.db.begin(deadline);
        if let Err(e) = self.rotator.rotate(&mut tx, &rotation, deadline).await {
            return self.error_response("generating and storing DNSSEC CDN keys", &e);
        }

        tx.log_change(format!("Generated DNSSEC keys for CDN {}", cdn_name), user);
        tx.set_commit(true);
        if let Err(e) = tx.finish().await {
            // The stored keys stay authoritative; only the audit entry is lost
            error!("Committing generate of CDN {}: {}", cdn_name, e);
        }

        info!("Created DNSSEC keys for CDN {}", cdn_name);
        json_response(
            StatusCode::OK,
            &ApiResponse::<()>::success_message(&format!(
                "Successfully created dnssec keys for {}",
                cdn_name
            )),
        )
    }

    async fn handle_delete_cdn_keys(&self, name: &str, user: String, deadline: Deadline) -> Response<Body> {
        let mut tx = self.db.begin(deadline);
        if let Err(e) = self.store().delete(name, deadline).await {
            return self.error_response("deleting cdn dnssec keys", &e);
        }

        tx.log_change(format!("Deleted DNSSEC keys for CDN {}", name), user);
        tx.set_commit(true);
        if let Err(e) = tx.finish().await {
            error!("Committing delete of CDN {}: {}", name, e);
        }

        json_response(
            StatusCode::OK,
            &ApiResponse::<()>::success_message(&format!("Successfully deleted dnssec for {}", name)),
        )
    }

    async fn handle_get_cdn_keys(&self, name: &str, deadline: Deadline) -> Response<Body> {
        match self.store().get(name, deadline).await {
            Ok(Some(bundle)) => json_response(StatusCode::OK, &ApiResponse::success(bundle)),
            Ok(None) => json_error(
                StatusCode::NOT_FOUND,
                &format!("no DNSSec keys for CDN {}", name),
            ),
            Err(e) => self.error_response("getting cdn dnssec keys", &e),
        }
    }

    async fn handle_get_ds_keys(&self, id: &str, deadline: Deadline) -> Response<Body> {
        let id: i64 = match id.parse() {
            Ok(id) => id,
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "delivery service id must be an integer"),
        };

        let lookup = self
            .db
            .begin(deadline)
            .query(|conn| metadata::get_delivery_service_name_and_cdn(conn, id))
            .await;
        let (ds_name, cdn_name) = match lookup {
            Ok(Some(found)) => found,
            Ok(None) => {
                return json_error(
                    StatusCode::NOT_FOUND,
                    &format!("delivery service {} not found", id),
                )
            }
            Err(e) => return self.error_response("getting delivery service name", &e),
        };

        match self.store().get(&cdn_name, deadline).await {
            Ok(Some(bundle)) => match bundle.get(&ds_name) {
                Some(keys) => json_response(StatusCode::OK, &ApiResponse::success(keys)),
                None => json_error(
                    StatusCode::NOT_FOUND,
                    &format!("no DNSSec keys for delivery service {}", ds_name),
                ),
            },
            Ok(None) => json_error(
                StatusCode::NOT_FOUND,
                &format!("no DNSSec keys for CDN {}", cdn_name),
            ),
            Err(e) => self.error_response("getting delivery service dnssec keys", &e),
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    /// Map a failure to a response by the kind of its root cause
    fn error_response(&self, action: &str, err: &DnssecError) -> Response<Body> {
        match err.kind() {
            ErrorKind::BadRequest => json_error(StatusCode::BAD_REQUEST, &err.to_string()),
            ErrorKind::BundleMissing => {
                warn!(action = action, "{}", err);
                json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("{}; the CDN's keys must be initialized before they can be refreshed", err),
                )
            }
            kind => {
                error!(action = action, kind = ?kind, "{}: {}", action, err);
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    fn not_found(&self) -> Response<Body> {
        json_error(StatusCode::NOT_FOUND, "Endpoint not found")
    }

    /// Run the API server (convenience method)
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        run_dnssec_api(addr, self).await
    }
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Parse JSON body from request
async fn parse_body<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, String> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| format!("Failed to read body: {}", e))?;

    serde_json::from_slice(&bytes).map_err(|e| format!("Invalid JSON: {}", e))
}

/// Create JSON response
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Body::from(json));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Create JSON error response
fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &ApiResponse::<()>::error(message))
}

/// User named by the request, for the audit log
fn user_of(req: &Request<Body>) -> String {
    req.headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_USER)
        .to_string()
}

/// Extract CDN name from path like /cdns/name/cdn-a/dnssec
fn extract_cdn_name(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('/').collect();
    // /cdns/name/{name}/dnssec
    // 0("") 1    2     3      4
    if parts.len() == 5 && parts[1] == "cdns" && parts[2] == "name" && parts[4] == "dnssec" && !parts[3].is_empty() {
        Some(parts[3].to_string())
    } else {
        None
    }
}

/// Extract delivery service id from path like /deliveryservices/12/dnssec
fn extract_ds_id(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('/').collect();
    // /deliveryservices/{id}/dnssec
    // 0("") 1                2    3
    if parts.len() == 4 && parts[1] == "deliveryservices" && parts[3] == "dnssec" && !parts[2].is_empty() {
        Some(parts[2].to_string())
    } else {
        None
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Run the DNSSEC API server
pub async fn run_dnssec_api(addr: SocketAddr, api: Arc<DnssecApi>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let api = Arc::clone(&api);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let api = Arc::clone(&api);
                async move { api.handle_request(req).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!("DNSSEC API listening on http://{}", addr);
    server.await?;
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
