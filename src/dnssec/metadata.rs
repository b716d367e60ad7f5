//! Delivery Service Metadata
//!
//! Read-only queries against the control plane database, and the scoped
//! transaction the handlers run them in. The connection is locked only for
//! the duration of a query, under the handler's deadline, so a handler never
//! holds it across KV or key generation work.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::schema;
use super::{
    Deadline, DeliveryServiceDescriptor, DnssecError, DsType, MatchEntry, MatchList, MatchType,
};

/// Audit log level for API driven changes
pub const API_CHANGE_LEVEL: &str = "APICHANGE";

/// SQLite control plane database
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database at `path`, creating tables if needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DnssecError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| DnssecError::Database(format!("Failed to open database: {}", e)))?;
        schema::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (useful for testing)
    pub fn in_memory() -> Result<Self, DnssecError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DnssecError::Database(format!("Failed to open in-memory database: {}", e)))?;
        schema::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Begin a transaction bound to `deadline`. Staged writes are discarded
    /// when it is dropped unless the commit flag was set and `finish` ran.
    pub fn begin(&self, deadline: Deadline) -> DbTx {
        DbTx {
            db: self.clone(),
            deadline,
            changes: Vec::new(),
            commit: false,
        }
    }

    /// Lock the connection, failing with `RequestCancelled` once `deadline` passes
    pub(crate) async fn lock(&self, deadline: Deadline) -> Result<MutexGuard<'_, Connection>, DnssecError> {
        deadline.check("waiting for database")?;
        deadline
            .run("waiting for database", async { Ok(self.conn.lock().await) })
            .await
    }

    /// Run `f` against the connection outside any handler transaction
    pub async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DnssecError>,
    ) -> Result<T, DnssecError> {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}

/// Audit entry staged by a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChangeLogEntry {
    message: String,
    user: String,
}

/// Scoped database transaction.
///
/// Queries run as they are issued; audit entries are staged and written in
/// a single SQLite transaction by `finish` once the owner set the commit
/// flag. Anything else, including a drop, discards them.
pub struct DbTx {
    db: Database,
    deadline: Deadline,
    changes: Vec<ChangeLogEntry>,
    commit: bool,
}

impl DbTx {
    pub fn set_commit(&mut self, commit: bool) {
        self.commit = commit;
    }

    pub fn will_commit(&self) -> bool {
        self.commit
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Run `f` against the connection, locked only for the call
    pub async fn query<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DnssecError>,
    ) -> Result<T, DnssecError> {
        let conn = self.db.lock(self.deadline).await?;
        f(&conn)
    }

    /// Stage an API change entry for the audit log
    pub fn log_change(&mut self, message: impl Into<String>, user: impl Into<String>) {
        self.changes.push(ChangeLogEntry {
            message: message.into(),
            user: user.into(),
        });
    }

    /// End the transaction according to the commit flag, reporting failures
    pub async fn finish(mut self) -> Result<(), DnssecError> {
        let changes = std::mem::take(&mut self.changes);
        if !self.commit || changes.is_empty() {
            return Ok(());
        }

        let mut conn = self.db.lock(self.deadline).await?;
        let tx = conn
            .transaction()
            .map_err(|e| DnssecError::Database(format!("beginning transaction: {}", e)))?;
        for change in &changes {
            create_change_log(&tx, &change.message, &change.user)?;
        }
        tx.commit()
            .map_err(|e| DnssecError::Database(format!("committing transaction: {}", e)))
    }
}

impl Drop for DbTx {
    fn drop(&mut self) {
        if self.commit && !self.changes.is_empty() {
            warn!(
                "Transaction dropped before finish; discarding {} audit entries",
                self.changes.len()
            );
        }
    }
}

/// Delivery services on a CDN, and the CDN's domain name
pub fn list_cdn_delivery_services(
    conn: &Connection,
    cdn_name: &str,
) -> Result<(Vec<DeliveryServiceDescriptor>, String), DnssecError> {
    let mut stmt = conn.prepare(
        "SELECT ds.xml_id, ds.protocol, t.name AS type, ds.routing_name, cdn.domain_name AS cdn_domain
         FROM deliveryservice AS ds
         JOIN cdn ON ds.cdn_id = cdn.id
         JOIN type AS t ON ds.type = t.id
         WHERE cdn.name = ?1
         ORDER BY ds.xml_id",
    )?;

    let rows = stmt.query_map(params![cdn_name], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<i64>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut cdn_domain = String::new();
    let mut services = Vec::new();
    for row in rows {
        let (xml_id, protocol, type_name, routing_name, domain) = row?;
        let ds_type: DsType = type_name.parse()?;
        cdn_domain = domain;
        services.push(DeliveryServiceDescriptor {
            xml_id,
            protocol,
            ds_type,
            routing_name,
        });
    }

    debug!("CDN {} has {} delivery services", cdn_name, services.len());
    Ok((services, cdn_domain))
}

/// Match lists for the named delivery services, keyed by xml id.
///
/// Services without any regex are absent from the result.
pub fn get_match_lists(
    conn: &Connection,
    ds_names: &[String],
) -> Result<HashMap<String, MatchList>, DnssecError> {
    let mut lists: HashMap<String, MatchList> = HashMap::new();
    if ds_names.is_empty() {
        return Ok(lists);
    }

    let placeholders = (1..=ds_names.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let query = format!(
        "SELECT ds.xml_id, t.name AS type, r.pattern, dsr.set_number
         FROM regex AS r
         JOIN type AS t ON r.type = t.id
         JOIN deliveryservice_regex AS dsr ON dsr.regex = r.id
         JOIN deliveryservice AS ds ON ds.id = dsr.deliveryservice
         WHERE ds.xml_id IN ({})
         ORDER BY ds.xml_id, dsr.set_number, r.id",
        placeholders
    );

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(params_from_iter(ds_names.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    for row in rows {
        let (xml_id, type_name, pattern, set_number) = row?;
        let match_type: MatchType = type_name.parse()?;
        lists.entry(xml_id).or_default().push(MatchEntry {
            match_type,
            pattern,
            set_number,
        });
    }

    Ok(lists)
}

/// Delivery service xml id and CDN name for a delivery service id
pub fn get_delivery_service_name_and_cdn(
    conn: &Connection,
    id: i64,
) -> Result<Option<(String, String)>, DnssecError> {
    conn.query_row(
        "SELECT ds.xml_id, cdn.name
         FROM deliveryservice AS ds
         JOIN cdn ON cdn.id = ds.cdn_id
         WHERE ds.id = ?1",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| DnssecError::Database(format!("querying delivery service name: {}", e)))
}

/// Append an API change entry to the audit log
pub fn create_change_log(conn: &Connection, message: &str, user: &str) -> Result<(), DnssecError> {
    conn.execute(
        "INSERT INTO log (level, message, user, last_updated) VALUES (?1, ?2, ?3, ?4)",
        params![API_CHANGE_LEVEL, message, user, chrono::Utc::now().timestamp()],
    )?;
    Ok(())
}
