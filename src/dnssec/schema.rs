//! Metadata schema
//!
//! SQLite bootstrap for the control plane tables the key manager reads,
//! plus the audit log it appends to. Production deployments own their
//! schema; this is used for development databases and tests.

use rusqlite::{params, Connection};

use super::DnssecError;

/// Type names seeded into the `type` table
pub const SEEDED_TYPES: &[&str] = &[
    "HTTP",
    "HTTP_NO_CACHE",
    "HTTP_LIVE",
    "HTTP_LIVE_NATNL",
    "DNS",
    "DNS_LIVE",
    "DNS_LIVE_NATNL",
    "ANY_MAP",
    "STEERING",
    "CLIENT_STEERING",
    "HOST_REGEXP",
    "PATH_REGEXP",
    "HEADER_REGEXP",
];

/// Create tables and seed the type table. Idempotent.
pub fn create_tables(conn: &Connection) -> Result<(), DnssecError> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS cdn (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            domain_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS type (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS deliveryservice (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            xml_id TEXT NOT NULL UNIQUE,
            protocol INTEGER,
            cdn_id INTEGER NOT NULL REFERENCES cdn(id),
            type INTEGER NOT NULL REFERENCES type(id),
            routing_name TEXT NOT NULL DEFAULT 'cdn'
        );

        CREATE TABLE IF NOT EXISTS regex (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pattern TEXT NOT NULL,
            type INTEGER NOT NULL REFERENCES type(id)
        );

        CREATE TABLE IF NOT EXISTS deliveryservice_regex (
            deliveryservice INTEGER NOT NULL REFERENCES deliveryservice(id) ON DELETE CASCADE,
            regex INTEGER NOT NULL REFERENCES regex(id) ON DELETE CASCADE,
            set_number INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (deliveryservice, regex)
        );

        CREATE INDEX IF NOT EXISTS idx_deliveryservice_cdn ON deliveryservice(cdn_id);

        CREATE TABLE IF NOT EXISTS log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            user TEXT NOT NULL,
            last_updated INTEGER NOT NULL
        );",
    )
    .map_err(|e| DnssecError::Database(format!("Failed to create tables: {}", e)))?;

    for name in SEEDED_TYPES {
        conn.execute("INSERT OR IGNORE INTO type (name) VALUES (?1)", params![name])
            .map_err(|e| DnssecError::Database(format!("Failed to seed type {}: {}", name, e)))?;
    }

    Ok(())
}

/// Insert a CDN, returning its id
pub fn insert_cdn(conn: &Connection, name: &str, domain_name: &str) -> Result<i64, DnssecError> {
    conn.execute(
        "INSERT INTO cdn (name, domain_name) VALUES (?1, ?2)",
        params![name, domain_name],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Insert a delivery service on a CDN, returning its id
pub fn insert_delivery_service(
    conn: &Connection,
    xml_id: &str,
    cdn_id: i64,
    type_name: &str,
    protocol: Option<i64>,
    routing_name: &str,
) -> Result<i64, DnssecError> {
    conn.execute(
        "INSERT INTO deliveryservice (xml_id, protocol, cdn_id, type, routing_name)
         VALUES (?1, ?2, ?3, (SELECT id FROM type WHERE name = ?4), ?5)",
        params![xml_id, protocol, cdn_id, type_name, routing_name],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Attach a regex of the given type to a delivery service
pub fn insert_regex(
    conn: &Connection,
    delivery_service_id: i64,
    type_name: &str,
    pattern: &str,
    set_number: i64,
) -> Result<(), DnssecError> {
    conn.execute(
        "INSERT INTO regex (pattern, type) VALUES (?1, (SELECT id FROM type WHERE name = ?2))",
        params![pattern, type_name],
    )?;
    let regex_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO deliveryservice_regex (deliveryservice, regex, set_number) VALUES (?1, ?2, ?3)",
        params![delivery_service_id, regex_id, set_number],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM type", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count as usize, SEEDED_TYPES.len());
    }

    #[test]
    fn test_insert_helpers() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let cdn = insert_cdn(&conn, "cdn-a", "mycdn.com").unwrap();
        let ds = insert_delivery_service(&conn, "ds1", cdn, "HTTP", Some(0), "cdn").unwrap();
        insert_regex(&conn, ds, "HOST_REGEXP", r".*\.ds1\..*", 0).unwrap();

        let (pattern, type_name): (String, String) = conn
            .query_row(
                "SELECT r.pattern, t.name FROM regex r
                 JOIN type t ON r.type = t.id
                 JOIN deliveryservice_regex dsr ON dsr.regex = r.id
                 WHERE dsr.deliveryservice = ?1",
                params![ds],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(pattern, r".*\.ds1\..*");
        assert_eq!(type_name, "HOST_REGEXP");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        let cdn = insert_cdn(&conn, "cdn-a", "mycdn.com").unwrap();

        assert!(insert_delivery_service(&conn, "ds1", cdn, "NOT_A_TYPE", None, "cdn").is_err());
    }
}
