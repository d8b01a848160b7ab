//! Connection bootstrap utilities for the record store.
//!
//! # Invariants
//! - Writer connections have `foreign_keys=ON` and migrations applied.
//! - File-backed writer connections run with `journal_mode=WAL`.
//! - Reader connections are read-only and never migrate.

use super::migrations::apply_migrations;
use super::{DbError, DbResult};
use log::{error, info};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::{Duration, Instant};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the record store file and applies all pending migrations.
///
/// # Side effects
/// - Creates the file when missing.
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode=file");

    let result = Connection::open(path.as_ref())
        .map_err(Into::into)
        .and_then(|mut conn| {
            enable_wal(&conn)?;
            bootstrap_connection(&mut conn)?;
            Ok(conn)
        });

    log_open_result("file", started_at, &result);
    result
}

/// Opens an in-memory record store and applies all pending migrations.
///
/// Used by schema tests; notebooks themselves are always file-backed.
pub fn open_db_in_memory() -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode=memory");

    let result = Connection::open_in_memory()
        .map_err(Into::into)
        .and_then(|mut conn| {
            bootstrap_connection(&mut conn)?;
            Ok(conn)
        });

    log_open_result("memory", started_at, &result);
    result
}

/// Opens a read-only connection on an existing, migrated record store.
///
/// Lifecycle operations read through this connection so they never contend
/// with the notebook write lock.
pub fn open_reader(path: impl AsRef<Path>) -> DbResult<Connection> {
    let conn = Connection::open_with_flags(
        path.as_ref(),
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Opens a plain connection on an existing record store for `VACUUM INTO`
/// snapshots. It never migrates and never writes to the source.
///
/// The create flag is required: SQLite opens the `VACUUM INTO` target with
/// the flags of the source connection.
pub fn open_snapshot_source(path: impl AsRef<Path>) -> DbResult<Connection> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(DbError::Sqlite(rusqlite::Error::InvalidPath(path.to_path_buf())));
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Writes a consistent copy of the connection's database to `target`.
///
/// `target` must not exist yet.
pub fn vacuum_into(conn: &Connection, target: impl AsRef<Path>) -> DbResult<()> {
    let target = target.as_ref();
    let target_text = target
        .to_str()
        .ok_or_else(|| DbError::NonUtf8Path(target.to_path_buf()))?;
    conn.execute("VACUUM INTO ?1;", [target_text])?;
    Ok(())
}

/// Switches a standalone copy of the store to rollback journaling, so the
/// copy is one self-contained file that read-only connections can open.
pub fn seal_copy(path: impl AsRef<Path>) -> DbResult<()> {
    let conn = Connection::open(path.as_ref())?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = DELETE;", [], |row| row.get(0))?;
    conn.close().map_err(|(_, err)| DbError::Sqlite(err))
}

fn enable_wal(conn: &Connection) -> DbResult<()> {
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    Ok(())
}

fn bootstrap_connection(conn: &mut Connection) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    apply_migrations(conn)?;
    Ok(())
}

fn log_open_result<T>(mode: &str, started_at: Instant, result: &DbResult<T>) {
    match result {
        Ok(_) => info!(
            "event=db_open module=db status=ok mode={} duration_ms={}",
            mode,
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=db_open module=db status=error mode={} duration_ms={} error_code=db_open_failed error={}",
            mode,
            started_at.elapsed().as_millis(),
            err
        ),
    }
}
