use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::classify::ClassifiedAttributes;
use crate::error::StorageError;
use crate::record::ServerRecord;
use crate::schedule::{format_timestamp, parse_timestamp, WipeEvent, WipeScheduleInference};
use crate::stats::{Reporter, RunStats};

/// Context saved next to each wipe observation.
#[derive(Debug, Clone, Copy)]
pub struct HistoryNote<'a> {
    pub is_bp: bool,
    pub title: &'a str,
    pub description: &'a str,
    pub attributes: &'a ClassifiedAttributes,
}

/// Persistence used by the ingestion pipeline.
pub trait Storage {
    fn get_existing(&self, bm_id: i64) -> Result<Option<ServerRecord>, StorageError>;

    /// Wipe observations in insertion order.
    fn get_history(&self, bm_id: i64) -> Result<Vec<WipeEvent>, StorageError>;

    /// Returns false when the (server, wipe time) pair was already stored.
    fn append_history(&self, event: &WipeEvent, note: &HistoryNote<'_>)
        -> Result<bool, StorageError>;

    fn upsert(&self, record: &ServerRecord) -> Result<(), StorageError>;
}

impl<T: Storage + ?Sized> Storage for &T {
    fn get_existing(&self, bm_id: i64) -> Result<Option<ServerRecord>, StorageError> {
        (**self).get_existing(bm_id)
    }

    fn get_history(&self, bm_id: i64) -> Result<Vec<WipeEvent>, StorageError> {
        (**self).get_history(bm_id)
    }

    fn append_history(
        &self,
        event: &WipeEvent,
        note: &HistoryNote<'_>,
    ) -> Result<bool, StorageError> {
        (**self).append_history(event, note)
    }

    fn upsert(&self, record: &ServerRecord) -> Result<(), StorageError> {
        (**self).upsert(record)
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS servers (
        bm_id           INTEGER PRIMARY KEY,
        rank            INTEGER,
        ip              TEXT,
        title           TEXT,
        region          TEXT,
        players         INTEGER,
        max_players     INTEGER,
        wipe_schedule   TEXT,
        game_mode       TEXT,
        resource_rate   TEXT,
        group_limit     TEXT,
        last_wipe       TEXT,
        next_wipe       TEXT,
        next_wipe_full  TEXT,
        next_wipe_is_bp BOOLEAN,
        next_wipe_hour  INTEGER,
        next_wipe_dow   INTEGER,
        next_wipe_week  INTEGER,
        main_wipe_hour  INTEGER,
        main_wipe_dow   INTEGER,
        last_main_wipe  TEXT,
        sec_wipe_hour   INTEGER,
        sec_wipe_dow    INTEGER,
        last_sec_wipe   TEXT,
        bp_wipe_hour    INTEGER,
        bp_wipe_dow     INTEGER,
        last_bp_wipe    TEXT,
        created_at      TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX IF NOT EXISTS idx_servers_region ON servers(region);

    CREATE TABLE IF NOT EXISTS wipe_history (
        id          INTEGER PRIMARY KEY,
        bm_id       INTEGER NOT NULL,
        wipe_time   TEXT NOT NULL,
        is_bp       BOOLEAN NOT NULL DEFAULT 0,
        title       TEXT,
        description TEXT,
        attributes  TEXT,
        recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE(bm_id, wipe_time)
    );
    CREATE INDEX IF NOT EXISTS idx_history_server ON wipe_history(bm_id);

    CREATE TABLE IF NOT EXISTS scraper_stats (
        id              INTEGER PRIMARY KEY,
        started_at      TEXT NOT NULL,
        duration_secs   INTEGER NOT NULL,
        servers_parsed  INTEGER NOT NULL,
        servers_skipped INTEGER NOT NULL,
        servers_posted  INTEGER NOT NULL,
        attribute_stats TEXT,
        errors          TEXT
    );
";

const SERVER_COLUMNS: &str = "bm_id, rank, ip, title, region, players, max_players,
    wipe_schedule, game_mode, resource_rate, group_limit,
    last_wipe, next_wipe, next_wipe_full, next_wipe_is_bp,
    next_wipe_hour, next_wipe_dow, next_wipe_week,
    main_wipe_hour, main_wipe_dow, last_main_wipe,
    sec_wipe_hour, sec_wipe_dow, last_sec_wipe,
    bp_wipe_hour, bp_wipe_dow, last_bp_wipe";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn server_ids(&self) -> Result<Vec<i64>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT bm_id FROM servers ORDER BY bm_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Overwrite only the inferred schedule columns of one server.
    pub fn update_schedule(
        &self,
        bm_id: i64,
        schedule: &WipeScheduleInference,
    ) -> Result<usize, StorageError> {
        let changed = self.conn.execute(
            "UPDATE servers SET
                main_wipe_hour = ?2, main_wipe_dow = ?3, last_main_wipe = ?4,
                sec_wipe_hour = ?5, sec_wipe_dow = ?6, last_sec_wipe = ?7,
                bp_wipe_hour = ?8, bp_wipe_dow = ?9, last_bp_wipe = ?10,
                updated_at = datetime('now')
             WHERE bm_id = ?1",
            params![
                bm_id,
                schedule.main_hour,
                schedule.main_dow,
                schedule.last_main.map(format_timestamp),
                schedule.secondary_hour,
                schedule.secondary_dow,
                schedule.last_secondary.map(format_timestamp),
                schedule.blueprint_hour,
                schedule.blueprint_dow,
                schedule.last_blueprint.map(format_timestamp),
            ],
        )?;
        Ok(changed)
    }

    /// Stored servers, best ranked first.
    pub fn list_servers(
        &self,
        region: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ServerRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM servers
             WHERE (?1 IS NULL OR region = ?1)
             ORDER BY rank IS NULL, rank, bm_id
             LIMIT ?2",
            SERVER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![region, limit as i64], server_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_run_stats(&self, stats: &RunStats) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO scraper_stats
             (started_at, duration_secs, servers_parsed, servers_skipped, servers_posted,
              attribute_stats, errors)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                format_timestamp(stats.started_at),
                stats.duration().as_secs() as i64,
                stats.parsed as i64,
                stats.skipped as i64,
                stats.posted as i64,
                serde_json::to_string(&stats.attribute_counts)?,
                serde_json::to_string(&stats.errors)?,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT started_at, duration_secs, servers_parsed, servers_skipped, servers_posted,
                    COALESCE(errors, '[]')
             FROM scraper_stats
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(RunSummary {
                    started_at: row.get(0)?,
                    duration_secs: row.get(1)?,
                    parsed: row.get(2)?,
                    skipped: row.get(3)?,
                    posted: row.get(4)?,
                    errors: row.get::<_, String>(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// One row of `scraper_stats`.
pub struct RunSummary {
    pub started_at: String,
    pub duration_secs: i64,
    pub parsed: i64,
    pub skipped: i64,
    pub posted: i64,
    /// JSON array of error messages.
    pub errors: String,
}

impl RunSummary {
    pub fn error_count(&self) -> usize {
        serde_json::from_str::<Vec<String>>(&self.errors)
            .map(|e| e.len())
            .unwrap_or(0)
    }
}

impl Storage for SqliteStore {
    fn get_existing(&self, bm_id: i64) -> Result<Option<ServerRecord>, StorageError> {
        let sql = format!("SELECT {} FROM servers WHERE bm_id = ?1", SERVER_COLUMNS);
        let record = self
            .conn
            .query_row(&sql, params![bm_id], server_from_row)
            .optional()?;
        Ok(record)
    }

    fn get_history(&self, bm_id: i64) -> Result<Vec<WipeEvent>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT wipe_time FROM wipe_history WHERE bm_id = ?1 ORDER BY id")?;
        let raw = stmt
            .query_map(params![bm_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        raw.iter()
            .map(|wipe_time| {
                parse_timestamp(wipe_time)
                    .map(|timestamp| WipeEvent { bm_id, timestamp })
                    .ok_or_else(|| StorageError::Corrupt {
                        bm_id,
                        reason: format!("unparseable wipe_time {:?}", wipe_time),
                    })
            })
            .collect()
    }

    fn append_history(
        &self,
        event: &WipeEvent,
        note: &HistoryNote<'_>,
    ) -> Result<bool, StorageError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO wipe_history
             (bm_id, wipe_time, is_bp, title, description, attributes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.bm_id,
                format_timestamp(event.timestamp),
                note.is_bp,
                note.title,
                note.description,
                serde_json::to_string(note.attributes)?,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn upsert(&self, r: &ServerRecord) -> Result<(), StorageError> {
        let attrs = r.attributes.clone().unwrap_or_default();
        let schedule = r.schedule.clone().unwrap_or_default();
        self.conn.execute(
            &format!(
                "INSERT INTO servers ({})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,
                         ?19,?20,?21,?22,?23,?24,?25,?26,?27)
                 ON CONFLICT(bm_id) DO UPDATE SET
                    rank = excluded.rank, ip = excluded.ip, title = excluded.title,
                    region = excluded.region, players = excluded.players,
                    max_players = excluded.max_players,
                    wipe_schedule = excluded.wipe_schedule, game_mode = excluded.game_mode,
                    resource_rate = excluded.resource_rate, group_limit = excluded.group_limit,
                    last_wipe = excluded.last_wipe, next_wipe = excluded.next_wipe,
                    next_wipe_full = excluded.next_wipe_full,
                    next_wipe_is_bp = excluded.next_wipe_is_bp,
                    next_wipe_hour = excluded.next_wipe_hour,
                    next_wipe_dow = excluded.next_wipe_dow,
                    next_wipe_week = excluded.next_wipe_week,
                    main_wipe_hour = excluded.main_wipe_hour,
                    main_wipe_dow = excluded.main_wipe_dow,
                    last_main_wipe = excluded.last_main_wipe,
                    sec_wipe_hour = excluded.sec_wipe_hour,
                    sec_wipe_dow = excluded.sec_wipe_dow,
                    last_sec_wipe = excluded.last_sec_wipe,
                    bp_wipe_hour = excluded.bp_wipe_hour,
                    bp_wipe_dow = excluded.bp_wipe_dow,
                    last_bp_wipe = excluded.last_bp_wipe,
                    updated_at = datetime('now')",
                SERVER_COLUMNS
            ),
            params![
                r.bm_id,
                r.rank,
                r.ip,
                r.title,
                r.region,
                r.players,
                r.max_players,
                attrs.wipe_schedule,
                attrs.game_mode,
                attrs.resource_rate,
                attrs.group_limit,
                r.last_wipe.map(format_timestamp),
                r.next_wipe.map(format_timestamp),
                r.next_wipe_full.map(format_timestamp),
                r.next_wipe_is_bp,
                r.next_wipe_hour,
                r.next_wipe_dow,
                r.next_wipe_week,
                schedule.main_hour,
                schedule.main_dow,
                schedule.last_main.map(format_timestamp),
                schedule.secondary_hour,
                schedule.secondary_dow,
                schedule.last_secondary.map(format_timestamp),
                schedule.blueprint_hour,
                schedule.blueprint_dow,
                schedule.last_blueprint.map(format_timestamp),
            ],
        )?;
        Ok(())
    }
}

impl Reporter for SqliteStore {
    fn report(&self, stats: &RunStats) {
        if let Err(e) = self.insert_run_stats(stats) {
            warn!("Failed to record run stats: {}", e);
        }
    }
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<ServerRecord> {
    let ts = |idx: usize| -> rusqlite::Result<_> {
        Ok(row.get::<_, Option<String>>(idx)?.as_deref().and_then(parse_timestamp))
    };

    let attributes = ClassifiedAttributes {
        wipe_schedule: row.get(7)?,
        game_mode: row.get(8)?,
        resource_rate: row.get(9)?,
        group_limit: row.get(10)?,
    };
    let schedule = WipeScheduleInference {
        main_hour: row.get(18)?,
        main_dow: row.get(19)?,
        last_main: ts(20)?,
        secondary_hour: row.get(21)?,
        secondary_dow: row.get(22)?,
        last_secondary: ts(23)?,
        blueprint_hour: row.get(24)?,
        blueprint_dow: row.get(25)?,
        last_blueprint: ts(26)?,
    };

    Ok(ServerRecord {
        bm_id: row.get(0)?,
        rank: row.get(1)?,
        ip: row.get(2)?,
        title: row.get(3)?,
        region: row.get(4)?,
        players: row.get(5)?,
        max_players: row.get(6)?,
        attributes: (!attributes.is_empty()).then_some(attributes),
        schedule: (!schedule.is_empty()).then_some(schedule),
        last_wipe: ts(11)?,
        next_wipe: ts(12)?,
        next_wipe_full: ts(13)?,
        next_wipe_is_bp: row.get(14)?,
        next_wipe_hour: row.get(15)?,
        next_wipe_dow: row.get(16)?,
        next_wipe_week: row.get(17)?,
    })
}
