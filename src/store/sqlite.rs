//! SQLite-backed [`InventoryStore`].

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use camino::Utf8Path;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::debug;

use super::schema::{SCHEMA_SQL, SCHEMA_VERSION};
use super::{InventoryStore, StoreError};
use crate::instance::{Instance, TERMINATED};

/// Source of the timestamps written to `last_seen`.
pub type Clock = fn() -> DateTime<Utc>;

const COLUMNS: &str = "id, account, region, cloud_provider, ami, name, keypair_name, \
     launch_time, size, subnet, vpc, state, os, private_ip, public_ip, ssh_key, ssh_port, \
     user, env, notes, skip, last_seen";

/// Inventory store persisted in a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Clock,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and ensures the
    /// schema is present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] when the file cannot be opened and
    /// [`StoreError::SchemaMismatch`] when it holds another schema version.
    pub fn open_and_init(path: &Utf8Path) -> Result<Self, StoreError> {
        let open_err = |message: String| StoreError::Open {
            path: path.to_string(),
            message,
        };
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| open_err(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|err| open_err(err.to_string()))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))
            .map_err(|err| open_err(format!("cannot set WAL mode: {err}")))?;
        debug!(%path, journal_mode = %mode, "opened inventory database");
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database with the schema applied.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] when SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|err| StoreError::Open {
            path: String::from(":memory:"),
            message: err.to_string(),
        })?;
        Self::from_connection(conn)
    }

    /// Replaces the clock used to stamp `last_seen`.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        init_schema(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock: Utc::now,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn now(&self) -> String {
        format_timestamp((self.clock)())
    }
}

fn query_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |err| StoreError::Query {
        operation,
        message: err.to_string(),
    }
}

fn init_schema(conn: &mut Connection) -> Result<(), StoreError> {
    let has_meta: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta'",
            [],
            |row| row.get(0),
        )
        .map_err(query_err("schema check"))?;

    if has_meta {
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_err("schema check"))?;
        let found = stored.and_then(|value| value.parse().ok()).unwrap_or(0);
        if found != SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found,
            });
        }
        return Ok(());
    }

    let tx = conn.transaction().map_err(query_err("schema init"))?;
    tx.execute_batch(SCHEMA_SQL)
        .map_err(query_err("schema init"))?;
    tx.execute(
        "INSERT INTO schema_meta (key, value) VALUES ('version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )
    .map_err(query_err("schema init"))?;
    tx.commit().map_err(query_err("schema init"))
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt {
            id: id.to_owned(),
            message: format!("invalid timestamp {value:?}: {err}"),
        })
}

fn active_exists(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM instances WHERE id = ?1 AND state != ?2",
        params![id, TERMINATED],
        |row| row.get(0),
    )
    .map_err(query_err("exists"))
}

fn update_active(tx: &Transaction<'_>, instance: &Instance, now: &str) -> Result<usize, StoreError> {
    tx.execute(
        "UPDATE instances SET env = ?1, name = ?2, os = ?3, private_ip = ?4, public_ip = ?5, \
         size = ?6, skip = ?7, ssh_key = ?8, ssh_port = ?9, state = ?10, subnet = ?11, \
         user = ?12, last_seen = ?13 \
         WHERE id = ?14 AND state != ?15",
        params![
            instance.env,
            instance.name,
            instance.os,
            instance.private_ip,
            instance.public_ip,
            instance.size,
            instance.skip,
            instance.ssh_key,
            instance.ssh_port,
            instance.state,
            instance.subnet,
            instance.user,
            now,
            instance.id,
            TERMINATED,
        ],
    )
    .map_err(query_err("upsert"))
}

fn insert_row(tx: &Transaction<'_>, instance: &Instance, now: &str) -> Result<(), StoreError> {
    tx.execute(
        &format!(
            "INSERT INTO instances ({COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
              ?19, ?20, ?21, ?22)"
        ),
        params![
            instance.id,
            instance.account,
            instance.region,
            instance.cloud_provider,
            instance.ami,
            instance.name,
            instance.keypair_name,
            format_timestamp(instance.launch_time),
            instance.size,
            instance.subnet,
            instance.vpc,
            instance.state,
            instance.os,
            instance.private_ip,
            instance.public_ip,
            instance.ssh_key,
            instance.ssh_port,
            instance.user,
            instance.env,
            instance.notes,
            instance.skip,
            now,
        ],
    )
    .map_err(query_err("upsert"))?;
    Ok(())
}

fn any_row_exists(tx: &Transaction<'_>, id: &str) -> Result<bool, StoreError> {
    tx.query_row(
        "SELECT COUNT(*) > 0 FROM instances WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .map_err(query_err("upsert"))
}

/// Raw column values of one `instances` row.
struct StoredRow {
    id: String,
    account: String,
    region: String,
    cloud_provider: String,
    ami: String,
    name: String,
    keypair_name: String,
    launch_time: String,
    size: String,
    subnet: String,
    vpc: String,
    state: String,
    os: String,
    private_ip: String,
    public_ip: String,
    ssh_key: String,
    ssh_port: Option<u16>,
    user: String,
    env: String,
    notes: String,
    skip: bool,
    last_seen: Option<String>,
}

impl StoredRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account: row.get(1)?,
            region: row.get(2)?,
            cloud_provider: row.get(3)?,
            ami: row.get(4)?,
            name: row.get(5)?,
            keypair_name: row.get(6)?,
            launch_time: row.get(7)?,
            size: row.get(8)?,
            subnet: row.get(9)?,
            vpc: row.get(10)?,
            state: row.get(11)?,
            os: row.get(12)?,
            private_ip: row.get(13)?,
            public_ip: row.get(14)?,
            ssh_key: row.get(15)?,
            ssh_port: row.get(16)?,
            user: row.get(17)?,
            env: row.get(18)?,
            notes: row.get(19)?,
            skip: row.get(20)?,
            last_seen: row.get(21)?,
        })
    }

    fn into_instance(self, tags: BTreeMap<String, String>) -> Result<Instance, StoreError> {
        let launch_time = parse_timestamp(&self.id, &self.launch_time)?;
        let last_seen = self
            .last_seen
            .as_deref()
            .map(|value| parse_timestamp(&self.id, value))
            .transpose()?;
        Ok(Instance {
            id: self.id,
            account: self.account,
            region: self.region,
            cloud_provider: self.cloud_provider,
            ami: self.ami,
            name: self.name,
            keypair_name: self.keypair_name,
            launch_time,
            size: self.size,
            subnet: self.subnet,
            vpc: self.vpc,
            state: self.state,
            os: self.os,
            private_ip: self.private_ip,
            public_ip: self.public_ip,
            ssh_key: self.ssh_key,
            ssh_port: self.ssh_port,
            user: self.user,
            env: self.env,
            notes: self.notes,
            skip: self.skip,
            tags,
            last_seen,
        })
    }
}

fn load_tags(conn: &Connection, id: &str) -> Result<BTreeMap<String, String>, StoreError> {
    let mut stmt = conn
        .prepare_cached("SELECT key, value FROM tags WHERE instance_id = ?1")
        .map_err(query_err("load tags"))?;
    let rows = stmt
        .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(query_err("load tags"))?;
    rows.collect::<rusqlite::Result<BTreeMap<String, String>>>()
        .map_err(query_err("load tags"))
}

fn hydrate(conn: &Connection, rows: Vec<StoredRow>) -> Result<Vec<Instance>, StoreError> {
    rows.into_iter()
        .map(|row| {
            let tags = load_tags(conn, &row.id)?;
            row.into_instance(tags)
        })
        .collect()
}

impl InventoryStore for SqliteStore {
    fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        active_exists(&conn, id)
    }

    fn upsert(&self, instance: &Instance) -> Result<(), StoreError> {
        let now = self.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(query_err("upsert"))?;

        if update_active(&tx, instance, &now)? == 0 {
            // A provider may keep listing an instance after it terminated;
            // only the first sighting of such an id earns a row.
            if instance.is_terminated() && any_row_exists(&tx, &instance.id)? {
                debug!(instance_id = %instance.id, "ignoring repeat sighting of terminated instance");
            } else {
                insert_row(&tx, instance, &now)?;
                debug!(instance_id = %instance.id, "inserted instance");
            }
        }
        tx.commit().map_err(query_err("upsert"))
    }

    fn replace_tags(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(query_err("replace tags"))?;
        tx.execute(
            "DELETE FROM tags WHERE instance_id = ?1",
            params![instance.id],
        )
        .map_err(query_err("replace tags"))?;
        {
            let mut insert = tx
                .prepare_cached("INSERT INTO tags (instance_id, key, value) VALUES (?1, ?2, ?3)")
                .map_err(query_err("replace tags"))?;
            for (key, value) in &instance.tags {
                insert
                    .execute(params![instance.id, key, value])
                    .map_err(query_err("replace tags"))?;
            }
        }
        tx.commit().map_err(query_err("replace tags"))
    }

    fn active_instance_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT id FROM instances WHERE state != ?1")
            .map_err(query_err("active ids"))?;
        let rows = stmt
            .query_map(params![TERMINATED], |row| row.get(0))
            .map_err(query_err("active ids"))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(query_err("active ids"))
    }

    fn mark_terminated(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(query_err("mark terminated"))?;
        let mut changed = 0_usize;
        {
            let mut update = tx
                .prepare_cached("UPDATE instances SET state = ?1 WHERE id = ?2 AND state != ?1")
                .map_err(query_err("mark terminated"))?;
            for id in ids {
                changed += update
                    .execute(params![TERMINATED, id])
                    .map_err(query_err("mark terminated"))?;
            }
        }
        tx.commit().map_err(query_err("mark terminated"))?;
        debug!(requested = ids.len(), changed, "marked instances terminated");
        Ok(())
    }

    fn instance(&self, id: &str) -> Result<Option<Instance>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM instances WHERE id = ?1 AND state != ?2 \
                     ORDER BY row_id DESC LIMIT 1"
                ),
                params![id, TERMINATED],
                StoredRow::read,
            )
            .optional()
            .map_err(query_err("load instance"))?;
        row.map(|stored| {
            let tags = load_tags(&conn, &stored.id)?;
            stored.into_instance(tags)
        })
        .transpose()
    }

    fn list_instances(&self, include_terminated: bool) -> Result<Vec<Instance>, StoreError> {
        let conn = self.lock()?;
        let filter = if include_terminated {
            ""
        } else {
            "WHERE state != ?1"
        };
        let sql = format!("SELECT {COLUMNS} FROM instances {filter} ORDER BY id, row_id");
        let mut stmt = conn.prepare(&sql).map_err(query_err("list instances"))?;
        let rows = if include_terminated {
            stmt.query_map([], StoredRow::read)
        } else {
            stmt.query_map(params![TERMINATED], StoredRow::read)
        }
        .map_err(query_err("list instances"))?
        .collect::<rusqlite::Result<Vec<StoredRow>>>()
        .map_err(query_err("list instances"))?;
        hydrate(&conn, rows)
    }
}
