//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqlResult, Row};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const TARGET_COLUMNS: &str = "id, name, hostname, probe_type, probe_config, probe_interval, \
     timeout, dns_ttl, dualstack, resolver, remote_group, static_addresses";

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        hostname: row.get(2)?,
        probe_type: row.get(3)?,
        probe_config: row.get(4)?,
        probe_interval: row.get(5)?,
        timeout: row.get(6)?,
        dns_ttl: row.get(7)?,
        dualstack: row.get(8)?,
        resolver: row.get(9)?,
        remote_group: row.get(10)?,
        static_addresses: row.get(11)?,
    })
}

/// Clamp intervals the engine cannot schedule.
fn sanitize(target: &mut Target) {
    if target.probe_interval <= 0.0 {
        target.probe_interval = 10.0;
    }
    if target.timeout <= 0.0 {
        target.timeout = 5.0;
    }
    if target.dns_ttl < 0.0 {
        target.dns_ttl = 0.0;
    }
    if target.static_addresses.trim().is_empty() {
        target.static_addresses = "[]".to_string();
    }
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn.lock();
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!("Store: applied migration {}", migration);
        }
        Ok(())
    }

    // --- Target CRUD ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        sanitize(target);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO targets (name, hostname, probe_type, probe_config, probe_interval, timeout, \
             dns_ttl, dualstack, resolver, remote_group, static_addresses) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                target.name,
                target.hostname,
                target.probe_type,
                target.probe_config,
                target.probe_interval,
                target.timeout,
                target.dns_ttl,
                target.dualstack,
                target.resolver,
                target.remote_group,
                target.static_addresses,
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Get all targets.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM targets ORDER BY id", TARGET_COLUMNS))?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    // --- Results ---

    /// Add check and DNS records in one transaction.
    pub fn add_records(&self, records: &[StoreRecord]) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        {
            let mut check_stmt = tx.prepare(
                "INSERT INTO check_results (time, target_id, address, success, latency, reason, remote_group) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let mut dns_stmt = tx.prepare(
                "INSERT INTO dns_results (time, hostname, family, resolver, success, addresses) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for record in records {
                match record {
                    StoreRecord::Check(r) => {
                        check_stmt.execute(params![
                            r.time.format(TIME_FORMAT).to_string(),
                            r.target_id,
                            r.address,
                            r.success,
                            r.latency,
                            r.reason,
                            r.remote_group,
                        ])?;
                    }
                    StoreRecord::Dns(r) => {
                        dns_stmt.execute(params![
                            r.time.format(TIME_FORMAT).to_string(),
                            r.hostname,
                            r.family,
                            r.resolver,
                            r.success,
                            serde_json::to_string(&r.addresses)?,
                        ])?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get check results for a target within a time range.
    pub fn get_check_results(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i32,
    ) -> Result<Vec<CheckRecord>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, address, success, latency, reason, remote_group FROM check_results
             WHERE target_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC LIMIT ?4",
        )?;

        let results = stmt
            .query_map(
                params![
                    target_id,
                    start.format(TIME_FORMAT).to_string(),
                    end.format(TIME_FORMAT).to_string(),
                    limit,
                ],
                |row| {
                    let time_str: String = row.get(0)?;
                    let time = parse_db_time(&time_str).unwrap_or_else(Utc::now);
                    Ok(CheckRecord {
                        time,
                        target_id: row.get(1)?,
                        address: row.get(2)?,
                        success: row.get(3)?,
                        latency: row.get(4)?,
                        reason: row.get(5)?,
                        remote_group: row.get(6)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }

    /// The most recent resolution per hostname, family and resolver.
    pub fn latest_dns_results(&self) -> Result<Vec<DnsRecord>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT d.time, d.hostname, d.family, d.resolver, d.success, d.addresses
             FROM dns_results d
             JOIN (SELECT hostname, family, resolver, MAX(time) AS latest
                   FROM dns_results GROUP BY hostname, family, resolver) m
             ON d.hostname = m.hostname AND d.family = m.family
                AND d.resolver = m.resolver AND d.time = m.latest",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let time_str: String = row.get(0)?;
                let addresses: String = row.get(5)?;
                Ok((
                    time_str,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    addresses,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (time_str, hostname, family, resolver, success, addresses) in rows {
            let Some(time) = parse_db_time(&time_str) else {
                tracing::warn!("Store: skipping dns result with bad time {:?}", time_str);
                continue;
            };
            let addresses: Vec<IpAddr> = serde_json::from_str(&addresses)?;
            records.push(DnsRecord {
                time,
                hostname,
                family,
                resolver,
                success,
                addresses,
            });
        }
        Ok(records)
    }

    /// Delete results recorded before a cutoff time.
    pub fn delete_results_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let cutoff = cutoff.format(TIME_FORMAT).to_string();
        let checks = conn.execute("DELETE FROM check_results WHERE time < ?1", params![cutoff])?;
        let lookups = conn.execute("DELETE FROM dns_results WHERE time < ?1", params![cutoff])?;
        Ok(checks + lookups)
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
