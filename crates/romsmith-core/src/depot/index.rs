use super::models::{BatchOutcome, DepotLocation, DepotRecord, DepotStats, NeededMatch};
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::hasher::Hashes;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const SCHEMA_VERSION: i64 = 1;

/// Persistent CRC32/MD5/SHA-1 cross reference for a depot.
///
/// The connection sits behind one mutex, which doubles as the ingestion
/// lock: batches from different workers never interleave.
pub struct DepotIndex {
    conn: Mutex<Connection>,
}

impl DepotIndex {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, Error> {
        configure_pragmas(&conn)?;
        migrate_schema(&conn)?;
        Ok(DepotIndex {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a file with these digests is already in the depot.
    pub fn contains(&self, hashes: &Hashes, mode: NeededMatch) -> Result<bool, Error> {
        let conn = self.connection();
        let found = match mode {
            NeededMatch::AnyHash => {
                row_exists(&conn, "SELECT 1 FROM crc WHERE crc = ?1", hashes.crc32.as_deref())?
                    || row_exists(&conn, "SELECT 1 FROM md5 WHERE md5 = ?1", hashes.md5.as_deref())?
                    || row_exists(&conn, "SELECT 1 FROM sha1 WHERE sha1 = ?1", hashes.sha1.as_deref())?
            }
            NeededMatch::AllHashes => {
                let Some(sha1) = hashes.sha1.as_deref() else {
                    return Ok(false);
                };
                let mut present = row_exists(&conn, "SELECT 1 FROM sha1 WHERE sha1 = ?1", Some(sha1))?;
                if present {
                    if let Some(crc) = hashes.crc32.as_deref() {
                        present = conn
                            .query_row(
                                "SELECT 1 FROM crcsha1 WHERE crc = ?1 AND sha1 = ?2",
                                params![crc, sha1],
                                |_| Ok(()),
                            )
                            .optional()?
                            .is_some();
                    }
                }
                if present {
                    if let Some(md5) = hashes.md5.as_deref() {
                        present = conn
                            .query_row(
                                "SELECT 1 FROM md5sha1 WHERE md5 = ?1 AND sha1 = ?2",
                                params![md5, sha1],
                                |_| Ok(()),
                            )
                            .optional()?
                            .is_some();
                    }
                }
                present
            }
        };
        Ok(found)
    }

    pub fn depot_of(&self, sha1: &str) -> Result<Option<String>, Error> {
        let depot = self
            .connection()
            .query_row(
                "SELECT depot FROM sha1 WHERE sha1 = ?1",
                params![sha1.to_ascii_lowercase()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(depot)
    }

    /// Resolve a CRC32, MD5 or SHA-1 (chosen by length) to stored files.
    pub fn lookup(&self, hash: &str) -> Result<Vec<DepotLocation>, Error> {
        let hash = hash.trim().to_ascii_lowercase();
        let sql = match hash.len() {
            8 => {
                "SELECT s.sha1, s.depot FROM crcsha1 c JOIN sha1 s ON s.sha1 = c.sha1 \
                 WHERE c.crc = ?1 ORDER BY s.sha1"
            }
            32 => {
                "SELECT s.sha1, s.depot FROM md5sha1 m JOIN sha1 s ON s.sha1 = m.sha1 \
                 WHERE m.md5 = ?1 ORDER BY s.sha1"
            }
            40 => "SELECT sha1, depot FROM sha1 WHERE sha1 = ?1",
            _ => {
                return Err(Error::InvalidSetting(format!(
                    "'{}' is not a CRC32, MD5 or SHA-1 value",
                    hash
                )))
            }
        };

        let conn = self.connection();
        let mut stmt = conn.prepare(sql)?;
        let locations = stmt
            .query_map(params![hash], |row| {
                Ok(DepotLocation {
                    sha1: row.get(0)?,
                    depot: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(locations)
    }

    /// Insert every record's rows in one transaction.
    ///
    /// Inserts are `INSERT OR IGNORE`, so existing rows are never rewritten.
    /// A failure on any row, or cancellation observed before commit, rolls
    /// back the whole batch.
    pub fn ingest_batch(
        &self,
        records: &[DepotRecord],
        cancel: Option<&CancelToken>,
    ) -> Result<BatchOutcome, Error> {
        let mut conn = self.connection();
        let tx = conn
            .transaction()
            .map_err(|e| Error::IndexTransaction(e.to_string()))?;

        let mut outcome = BatchOutcome::default();
        apply_batch(&tx, records, &mut outcome)
            .map_err(|e| Error::IndexTransaction(e.to_string()))?;

        if cancel.is_some_and(|c| c.is_cancelled()) {
            debug!("Rolling back depot batch of {} records", records.len());
            return Err(Error::Cancelled);
        }

        tx.commit()
            .map_err(|e| Error::IndexTransaction(e.to_string()))?;
        debug!(
            "Depot batch committed: {} new, {} present, {} conflicts",
            outcome.inserted,
            outcome.already_present,
            outcome.conflicts.len()
        );
        Ok(outcome)
    }

    pub fn stats(&self) -> Result<DepotStats, Error> {
        let conn = self.connection();
        let count = |table: &str| -> rusqlite::Result<i64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        };
        Ok(DepotStats {
            crc: count("crc")?,
            md5: count("md5")?,
            sha1: count("sha1")?,
            crcsha1: count("crcsha1")?,
            md5sha1: count("md5sha1")?,
        })
    }
}

fn configure_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA busy_timeout = 5000;",
    )?;
    debug!("SQLite pragmas configured (WAL mode, 64MB cache)");
    Ok(())
}

/// Create the schema on a fresh database. Depot rows are never dropped by a
/// migration.
fn migrate_schema(conn: &Connection) -> Result<(), Error> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version > SCHEMA_VERSION {
        return Err(Error::Other(format!(
            "depot index schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }

    if version < SCHEMA_VERSION {
        conn.execute_batch(include_str!("schema.sql"))?;
        debug!("Depot index schema initialized (version {})", SCHEMA_VERSION);
    }
    Ok(())
}

fn row_exists(conn: &Connection, sql: &str, value: Option<&str>) -> rusqlite::Result<bool> {
    let Some(value) = value else {
        return Ok(false);
    };
    Ok(conn
        .query_row(sql, params![value], |_| Ok(()))
        .optional()?
        .is_some())
}

fn apply_batch(
    tx: &Transaction<'_>,
    records: &[DepotRecord],
    outcome: &mut BatchOutcome,
) -> rusqlite::Result<()> {
    let mut crc_conflict =
        tx.prepare_cached("SELECT sha1 FROM crcsha1 WHERE crc = ?1 AND sha1 <> ?2 LIMIT 1")?;
    let mut md5_conflict =
        tx.prepare_cached("SELECT sha1 FROM md5sha1 WHERE md5 = ?1 AND sha1 <> ?2 LIMIT 1")?;
    let mut insert_crc = tx.prepare_cached("INSERT OR IGNORE INTO crc (crc) VALUES (?1)")?;
    let mut insert_md5 = tx.prepare_cached("INSERT OR IGNORE INTO md5 (md5) VALUES (?1)")?;
    let mut insert_sha1 =
        tx.prepare_cached("INSERT OR IGNORE INTO sha1 (sha1, depot) VALUES (?1, ?2)")?;
    let mut insert_crcsha1 =
        tx.prepare_cached("INSERT OR IGNORE INTO crcsha1 (crc, sha1) VALUES (?1, ?2)")?;
    let mut insert_md5sha1 =
        tx.prepare_cached("INSERT OR IGNORE INTO md5sha1 (md5, sha1) VALUES (?1, ?2)")?;

    for record in records {
        let existing: Option<String> = crc_conflict
            .query_row(params![record.crc32, record.sha1], |row| row.get(0))
            .optional()?;
        if let Some(other) = existing {
            warn!(
                "{}",
                Error::DepotInconsistency(format!(
                    "crc {} already maps to sha1 {}, now also {}",
                    record.crc32, other, record.sha1
                ))
            );
            outcome.conflicts.push(record.crc32.clone());
        }

        let existing: Option<String> = md5_conflict
            .query_row(params![record.md5, record.sha1], |row| row.get(0))
            .optional()?;
        if let Some(other) = existing {
            warn!(
                "{}",
                Error::DepotInconsistency(format!(
                    "md5 {} already maps to sha1 {}, now also {}",
                    record.md5, other, record.sha1
                ))
            );
            outcome.conflicts.push(record.md5.clone());
        }

        insert_crc.execute(params![record.crc32])?;
        insert_md5.execute(params![record.md5])?;
        if insert_sha1.execute(params![record.sha1, record.depot])? == 1 {
            outcome.inserted += 1;
        } else {
            outcome.already_present += 1;
        }
        insert_crcsha1.execute(params![record.crc32, record.sha1])?;
        insert_md5sha1.execute(params![record.md5, record.sha1])?;
    }
    Ok(())
}
