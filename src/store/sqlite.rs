use std::{
    path::Path,
    thread::{self, ThreadId},
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{DataKey, DataKeyStore, StoreError, StoreResult, StoreTransaction};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS data_keys (
        namespace      TEXT    NOT NULL,
        uid            TEXT    NOT NULL,
        label          TEXT    NOT NULL,
        active         INTEGER NOT NULL,
        provider       TEXT    NOT NULL,
        encrypted_data BLOB    NOT NULL,
        created        TEXT    NOT NULL,
        updated        TEXT    NOT NULL,
        PRIMARY KEY (namespace, uid)
    );

    CREATE INDEX IF NOT EXISTS idx_data_keys_label
        ON data_keys (namespace, label, active);
"#;

const COLUMNS: &str = "uid, namespace, label, active, provider, encrypted_data, created, updated";

/// SQLite-backed store. One connection, serialized behind a mutex; a
/// transaction holds the connection until it commits or rolls back.
///
/// Other threads wait for an open transaction to finish. The thread that
/// opened it gets [`StoreError::TransactionInProgress`] instead.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    tx_owner: Mutex<Option<ThreadId>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            tx_owner: Mutex::new(None),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        if *self.tx_owner.lock() == Some(thread::current().id()) {
            return Err(StoreError::TransactionInProgress);
        }
        Ok(self.conn.lock())
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<DataKey> {
    Ok(DataKey {
        uid: row.get(0)?,
        namespace: row.get(1)?,
        label: row.get(2)?,
        active: row.get(3)?,
        provider: row.get(4)?,
        encrypted_data: row.get(5)?,
        created: row.get(6)?,
        updated: row.get(7)?,
    })
}

fn get_data_key(conn: &Connection, namespace: &str, uid: &str) -> StoreResult<DataKey> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM data_keys WHERE namespace = ?1 AND uid = ?2"),
        params![namespace, uid],
        from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound)
}

fn get_current_data_key(conn: &Connection, namespace: &str, label: &str) -> StoreResult<DataKey> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM data_keys
             WHERE namespace = ?1 AND label = ?2 AND active = 1
             ORDER BY created DESC LIMIT 1"
        ),
        params![namespace, label],
        from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound)
}

fn create_data_key(conn: &Connection, key: &DataKey) -> StoreResult<()> {
    if !key.active {
        return Err(StoreError::InactiveKey);
    }
    let inserted = conn.execute(
        &format!(
            "INSERT INTO data_keys ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (namespace, uid) DO NOTHING"
        ),
        params![
            key.uid,
            key.namespace,
            key.label,
            key.active,
            key.provider,
            key.encrypted_data,
            key.created,
            key.updated,
        ],
    )?;
    if inserted == 0 {
        return Err(StoreError::Duplicate(key.uid.clone()));
    }
    Ok(())
}

impl DataKeyStore for SqliteStore {
    fn get_data_key(&self, namespace: &str, uid: &str) -> StoreResult<DataKey> {
        get_data_key(&*self.conn()?, namespace, uid)
    }

    fn get_current_data_key(&self, namespace: &str, label: &str) -> StoreResult<DataKey> {
        get_current_data_key(&*self.conn()?, namespace, label)
    }

    fn list_data_keys(&self, namespace: &str) -> StoreResult<Vec<DataKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM data_keys WHERE namespace = ?1 ORDER BY created"
        ))?;
        let keys = stmt
            .query_map(params![namespace], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn create_data_key(&self, key: &DataKey) -> StoreResult<()> {
        create_data_key(&*self.conn()?, key)
    }

    fn disable_data_keys(&self, namespace: &str, updated: DateTime<Utc>) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE data_keys SET active = 0, updated = ?2 WHERE namespace = ?1 AND active = 1",
            params![namespace, updated],
        )?;
        Ok(())
    }

    fn delete_data_key(&self, namespace: &str, uid: &str) -> StoreResult<()> {
        let deleted = self.conn()?.execute(
            "DELETE FROM data_keys WHERE namespace = ?1 AND uid = ?2",
            params![namespace, uid],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn update_data_key(
        &self,
        namespace: &str,
        uid: &str,
        provider: &str,
        encrypted_data: &[u8],
        updated: DateTime<Utc>,
    ) -> StoreResult<()> {
        let changed = self.conn()?.execute(
            "UPDATE data_keys SET provider = ?3, encrypted_data = ?4, updated = ?5
             WHERE namespace = ?1 AND uid = ?2",
            params![namespace, uid, provider, encrypted_data, updated],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        *self.tx_owner.lock() = Some(thread::current().id());
        Ok(Box::new(SqliteTransaction {
            conn,
            owner: &self.tx_owner,
            done: false,
        }))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    owner: &'a Mutex<Option<ThreadId>>,
    done: bool,
}

impl SqliteTransaction<'_> {
    fn finish(mut self: Box<Self>, sql: &str) -> StoreResult<()> {
        self.conn.execute_batch(sql)?;
        self.done = true;
        Ok(())
    }
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn get_data_key(&self, namespace: &str, uid: &str) -> StoreResult<DataKey> {
        get_data_key(&self.conn, namespace, uid)
    }

    fn get_current_data_key(&self, namespace: &str, label: &str) -> StoreResult<DataKey> {
        get_current_data_key(&self.conn, namespace, label)
    }

    fn create_data_key(&mut self, key: &DataKey) -> StoreResult<()> {
        create_data_key(&self.conn, key)
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        self.finish("COMMIT")
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                log::warn!("rollback of abandoned data key transaction failed: {e}");
            }
        }
        *self.owner.lock() = None;
    }
}
