use chrono::{DateTime, SecondsFormat, Utc};
use mctl_core::{
    normalize_mission_ref, Mission, MissionFilter, MissionPatch, NewMission, StoredStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const REGISTRY_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_PREFIX_LEN: usize = 4;

const MISSION_COLUMNS: &str = "id, status, name, repo, description, workspace, pane_id, \
     cron_job, config_snapshot, created_at, updated_at, last_heartbeat";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("corrupt mission row: {0}")]
    Corrupt(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("no mission matches '{reference}'")]
    NotFound { reference: String },
    #[error("'{reference}' matches {count} missions; use more of the id")]
    Ambiguous { reference: String, count: usize },
    #[error("mission {id} is archived")]
    Archived { id: String },
    #[error("invalid mission reference '{reference}'")]
    InvalidReference { reference: String },
}

/// The mission registry. Every mutation runs inside its own `BEGIN IMMEDIATE`
/// transaction, so concurrent writers queue on SQLite's lock.
pub struct MissionStore {
    conn: Connection,
}

impl MissionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > REGISTRY_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: REGISTRY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_missions.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn create(
        &mut self,
        id: &str,
        new: &NewMission,
        workspace: &Path,
    ) -> Result<Mission, StorageError> {
        let now = timestamp(Utc::now());
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "
            INSERT INTO missions (
                id,
                status,
                name,
                repo,
                description,
                workspace,
                cron_job,
                config_snapshot,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ",
            params![
                id,
                StoredStatus::Active.as_str(),
                non_blank(&new.name),
                non_blank(&new.repo),
                non_blank(&new.description),
                workspace.to_string_lossy(),
                non_blank(&new.cron_job),
                non_blank(&new.config_snapshot),
                now,
            ],
        )?;
        let mission = load(&tx, id)?;
        tx.commit()?;
        debug!(event = "mission_created", id);
        Ok(mission)
    }

    /// Looks a mission up by full id or a unique short prefix.
    pub fn get(&self, reference: &str) -> Result<Mission, StorageError> {
        let id = resolve_id(&self.conn, reference)?;
        load(&self.conn, &id)
    }

    /// Newest first.
    pub fn list(&self, filter: &MissionFilter) -> Result<Vec<Mission>, StorageError> {
        let sql = format!(
            "
            SELECT {MISSION_COLUMNS}
            FROM missions
            WHERE (?1 OR status != 'archived')
              AND (?2 IS NULL OR cron_job = ?2)
            ORDER BY created_at DESC, id ASC
            "
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![filter.include_archived, non_blank(&filter.cron_job)],
            MissionRow::from_row,
        )?;

        let mut missions = Vec::new();
        for row in rows {
            missions.push(row?.into_mission()?);
        }
        Ok(missions)
    }

    pub fn update(&mut self, reference: &str, patch: &MissionPatch) -> Result<Mission, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = resolve_id(&tx, reference)?;
        if !patch.is_empty() {
            tx.execute(
                "
                UPDATE missions SET
                    description = COALESCE(?2, description),
                    config_snapshot = COALESCE(?3, config_snapshot),
                    updated_at = ?4
                WHERE id = ?1
                ",
                params![
                    id,
                    patch.description.as_deref().map(str::trim),
                    patch.config_snapshot.as_deref().map(str::trim),
                    timestamp(Utc::now()),
                ],
            )?;
        }
        let mission = load(&tx, &id)?;
        tx.commit()?;
        Ok(mission)
    }

    /// Records the pane hosting the mission's wrapper and counts as a heartbeat.
    /// `None` clears a stale binding (wrapper running outside the multiplexer).
    pub fn bind(&mut self, reference: &str, pane: Option<u64>) -> Result<Mission, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = resolve_active_id(&tx, reference)?;
        let now = timestamp(Utc::now());
        let pane = pane.map(|pane| pane as i64);
        tx.execute(
            "
            UPDATE missions SET pane_id = ?2, last_heartbeat = ?3, updated_at = ?3
            WHERE id = ?1
            ",
            params![id, pane, now],
        )?;
        let mission = load(&tx, &id)?;
        tx.commit()?;
        debug!(event = "mission_bound", id = %mission.id, pane = ?mission.pane_id);
        Ok(mission)
    }

    pub fn heartbeat(&mut self, reference: &str) -> Result<Mission, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = resolve_active_id(&tx, reference)?;
        tx.execute(
            "UPDATE missions SET last_heartbeat = ?2 WHERE id = ?1",
            params![id, timestamp(Utc::now())],
        )?;
        let mission = load(&tx, &id)?;
        tx.commit()?;
        Ok(mission)
    }

    /// Terminal and idempotent: archiving an archived mission changes nothing.
    pub fn archive(&mut self, reference: &str) -> Result<Mission, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = resolve_id(&tx, reference)?;
        let changed = tx.execute(
            "
            UPDATE missions SET status = ?2, pane_id = NULL, updated_at = ?3
            WHERE id = ?1 AND status != ?2
            ",
            params![id, StoredStatus::Archived.as_str(), timestamp(Utc::now())],
        )?;
        let mission = load(&tx, &id)?;
        tx.commit()?;
        if changed > 0 {
            debug!(event = "mission_archived", id = %id);
        }
        Ok(mission)
    }

    /// Deletes every record. Only the explicit reset path calls this.
    pub fn purge(&mut self) -> Result<usize, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM missions", [])?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }
}

struct MissionRow {
    id: String,
    status: String,
    name: Option<String>,
    repo: Option<String>,
    description: Option<String>,
    workspace: String,
    pane_id: Option<i64>,
    cron_job: Option<String>,
    config_snapshot: Option<String>,
    created_at: String,
    updated_at: String,
    last_heartbeat: Option<String>,
}

impl MissionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            name: row.get(2)?,
            repo: row.get(3)?,
            description: row.get(4)?,
            workspace: row.get(5)?,
            pane_id: row.get(6)?,
            cron_job: row.get(7)?,
            config_snapshot: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            last_heartbeat: row.get(11)?,
        })
    }

    fn into_mission(self) -> Result<Mission, StorageError> {
        let status = self
            .status
            .parse::<StoredStatus>()
            .map_err(StorageError::Corrupt)?;
        Ok(Mission {
            id: self.id,
            status,
            name: self.name,
            repo: self.repo,
            description: self.description,
            workspace: PathBuf::from(self.workspace),
            pane_id: self.pane_id.and_then(|pane| u64::try_from(pane).ok()),
            cron_job: self.cron_job,
            config_snapshot: self.config_snapshot,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            last_heartbeat: self
                .last_heartbeat
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

fn load(conn: &Connection, id: &str) -> Result<Mission, StorageError> {
    let sql = format!("SELECT {MISSION_COLUMNS} FROM missions WHERE id = ?1");
    conn.query_row(&sql, [id], MissionRow::from_row)
        .optional()?
        .ok_or_else(|| StorageError::NotFound {
            reference: id.to_string(),
        })?
        .into_mission()
}

fn resolve_id(conn: &Connection, reference: &str) -> Result<String, StorageError> {
    let normalized = normalize_mission_ref(reference);
    if normalized.len() < MIN_PREFIX_LEN || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StorageError::InvalidReference {
            reference: reference.to_string(),
        });
    }

    let mut stmt = conn.prepare(
        "SELECT id FROM missions WHERE substr(id, 1, ?2) = ?1 ORDER BY id LIMIT 2",
    )?;
    let ids = stmt
        .query_map(params![normalized, normalized.len() as i64], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    match ids.as_slice() {
        [] => Err(StorageError::NotFound {
            reference: reference.to_string(),
        }),
        [id] => Ok(id.clone()),
        _ => {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM missions WHERE substr(id, 1, ?2) = ?1",
                params![normalized, normalized.len() as i64],
                |row| row.get(0),
            )?;
            Err(StorageError::Ambiguous {
                reference: reference.to_string(),
                count: count as usize,
            })
        }
    }
}

fn resolve_active_id(conn: &Connection, reference: &str) -> Result<String, StorageError> {
    let id = resolve_id(conn, reference)?;
    let status: String = conn.query_row("SELECT status FROM missions WHERE id = ?1", [&id], |row| {
        row.get(0)
    })?;
    if status == StoredStatus::Archived.as_str() {
        return Err(StorageError::Archived { id });
    }
    Ok(id)
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mctl_core::new_mission_id;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn create(store: &mut MissionStore, id: &str, name: &str) -> Mission {
        let new = NewMission {
            name: Some(name.to_string()),
            repo: Some("acme/widgets".to_string()),
            ..NewMission::default()
        };
        store
            .create(id, &new, Path::new("/tmp/missions").join(id).as_path())
            .expect("create mission")
    }

    #[test]
    fn migration_creates_missions_table() {
        let store = MissionStore::open_in_memory().expect("open db");
        assert!(store.table_exists("missions").expect("table check"));
        assert_eq!(
            store.schema_version().expect("schema version"),
            REGISTRY_SCHEMA_VERSION
        );
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("registry.db");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute("PRAGMA user_version = 9", []).expect("bump");
        }
        assert!(matches!(
            MissionStore::open(&path),
            Err(StorageError::UnsupportedSchemaVersion { found: 9, .. })
        ));
    }

    #[test]
    fn create_then_get_by_full_and_short_id() {
        let mut store = MissionStore::open_in_memory().expect("open db");
        let id = new_mission_id();
        let created = create(&mut store, &id, "triage");
        assert_eq!(created.status, StoredStatus::Active);
        assert_eq!(created.pane_id, None);
        assert_eq!(created.repo.as_deref(), Some("acme/widgets"));

        assert_eq!(store.get(&id).expect("full id"), created);
        assert_eq!(store.get(created.short_id()).expect("short id"), created);
        assert_eq!(
            store.get(&created.short_id().to_uppercase()).expect("upper"),
            created
        );
    }

    #[test]
    fn shared_prefix_is_ambiguous() {
        let mut store = MissionStore::open_in_memory().expect("open db");
        create(&mut store, "abcd1234000000000000000000000001", "one");
        create(&mut store, "abcd1234000000000000000000000002", "two");

        assert!(matches!(
            store.get("abcd1234"),
            Err(StorageError::Ambiguous { count: 2, .. })
        ));
        assert_eq!(
            store
                .get("abcd1234000000000000000000000002")
                .expect("exact")
                .label(),
            "two"
        );
        assert!(matches!(
            store.get("ffff0000"),
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            store.get("not-hex"),
            Err(StorageError::InvalidReference { .. })
        ));
    }

    #[test]
    fn list_filters_archived_and_cron() {
        let mut store = MissionStore::open_in_memory().expect("open db");
        let first = create(&mut store, &new_mission_id(), "manual");
        let cron = store
            .create(
                &new_mission_id(),
                &NewMission {
                    cron_job: Some("nightly".to_string()),
                    ..NewMission::default()
                },
                Path::new("/tmp/cron"),
            )
            .expect("create cron mission");
        store.archive(&first.id).expect("archive");

        let active = store.list(&MissionFilter::default()).expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, cron.id);

        let all = store
            .list(&MissionFilter {
                include_archived: true,
                cron_job: None,
            })
            .expect("list all");
        assert_eq!(all.len(), 2);

        let nightly = store
            .list(&MissionFilter {
                include_archived: true,
                cron_job: Some("nightly".to_string()),
            })
            .expect("list cron");
        assert_eq!(nightly.len(), 1);
        assert_eq!(nightly[0].cron_job.as_deref(), Some("nightly"));
    }

    #[test]
    fn update_patches_only_given_fields() {
        let mut store = MissionStore::open_in_memory().expect("open db");
        let mission = create(&mut store, &new_mission_id(), "patch");
        store
            .update(
                &mission.id,
                &MissionPatch {
                    description: Some("first".to_string()),
                    config_snapshot: Some("snap-1".to_string()),
                },
            )
            .expect("update both");
        let updated = store
            .update(
                mission.short_id(),
                &MissionPatch {
                    description: Some("second".to_string()),
                    config_snapshot: None,
                },
            )
            .expect("update description");
        assert_eq!(updated.description.as_deref(), Some("second"));
        assert_eq!(updated.config_snapshot.as_deref(), Some("snap-1"));
        assert!(updated.updated_at >= mission.updated_at);
    }

    #[test]
    fn archive_is_terminal_and_idempotent() {
        let mut store = MissionStore::open_in_memory().expect("open db");
        let mission = create(&mut store, &new_mission_id(), "done");
        store.bind(&mission.id, Some(7)).expect("bind");

        let archived = store.archive(&mission.id).expect("archive");
        assert_eq!(archived.status, StoredStatus::Archived);
        assert_eq!(archived.pane_id, None);
        let again = store.archive(&mission.id).expect("archive again");
        assert_eq!(again, archived);

        assert!(matches!(
            store.bind(&mission.id, Some(8)),
            Err(StorageError::Archived { .. })
        ));
        assert!(matches!(
            store.heartbeat(&mission.id),
            Err(StorageError::Archived { .. })
        ));
    }

    #[test]
    fn bind_records_pane_and_heartbeat() {
        let mut store = MissionStore::open_in_memory().expect("open db");
        let mission = create(&mut store, &new_mission_id(), "bound");
        assert!(mission.last_heartbeat.is_none());

        let bound = store.bind(&mission.id, Some(42)).expect("bind");
        assert_eq!(bound.pane_id, Some(42));
        assert!(bound.last_heartbeat.is_some());

        let unbound = store.bind(&mission.id, None).expect("unbind");
        assert_eq!(unbound.pane_id, None);
        let beat = store.heartbeat(&mission.id).expect("heartbeat");
        assert!(beat.last_heartbeat >= bound.last_heartbeat);
    }

    #[test]
    fn purge_removes_everything() {
        let mut store = MissionStore::open_in_memory().expect("open db");
        create(&mut store, &new_mission_id(), "a");
        create(&mut store, &new_mission_id(), "b");
        assert_eq!(store.purge().expect("purge"), 2);
        assert!(store
            .list(&MissionFilter {
                include_archived: true,
                cron_job: None,
            })
            .expect("list")
            .is_empty());
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("registry.db");
        let id = {
            let mut store = MissionStore::open(&path).expect("open");
            create(&mut store, &new_mission_id(), "shared").id
        };

        let barrier = Arc::new(Barrier::new(4));
        let handles = (0..4)
            .map(|worker| {
                let path = path.clone();
                let id = id.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let mut store = MissionStore::open(&path).expect("open worker");
                    barrier.wait();
                    for round in 0..10 {
                        store
                            .update(
                                &id,
                                &MissionPatch {
                                    description: Some(format!("w{worker}-r{round}")),
                                    config_snapshot: None,
                                },
                            )
                            .expect("update");
                        store.heartbeat(&id).expect("heartbeat");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("worker");
        }

        let store = MissionStore::open(&path).expect("reopen");
        let mission = store.get(&id).expect("get");
        assert!(mission
            .description
            .as_deref()
            .is_some_and(|text| text.ends_with("-r9")));
        assert!(mission.last_heartbeat.is_some());
    }
}
