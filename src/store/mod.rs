use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Field name → value map for one key.
pub type FieldMap = HashMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid namespace {0:?}: must be an identifier")]
    InvalidNamespace(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Options for [`KeyFieldStore::get_ordered_by`].
#[derive(Debug, Clone, Default)]
pub struct OrderQuery<'a> {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub descending: bool,
    /// SQL `LIKE` pattern applied to the key column (`%` wildcard).
    pub key_pattern: Option<&'a str>,
    /// Restrict to keys whose `field` holds exactly `value`.
    pub filter: Option<(&'a str, &'a str)>,
}

/// Durable `(namespace, key, field) → value` persistence on SQLite.
///
/// One table per namespace, created lazily on first access. Writes are
/// upserts on the `(key, field)` primary key. A single connection behind a
/// mutex gives the single-writer, multi-reader discipline the rest of the
/// bot assumes; multi-field updates are not atomic as a group and callers
/// must tolerate partial state after a crash.
pub struct KeyFieldStore {
    conn: Arc<Mutex<Connection>>,
}

impl KeyFieldStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::tune(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests and the dry-run tooling.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::tune(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn tune(conn: &Connection) -> StoreResult<()> {
        // WAL + NORMAL sync: concurrent reads during writes, still durable.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;",
        )?;
        Ok(())
    }

    /// Namespace names are interpolated into SQL as table names, so they
    /// must be plain identifiers.
    fn check_namespace(ns: &str) -> StoreResult<()> {
        let mut chars = ns.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if head_ok && ns.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            Ok(())
        } else {
            Err(StoreError::InvalidNamespace(ns.to_string()))
        }
    }

    fn ensure_namespace(conn: &Connection, ns: &str) -> StoreResult<()> {
        Self::check_namespace(ns)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {ns} (
                key   TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT,
                PRIMARY KEY (key, field)
            )"
        ))?;
        Ok(())
    }

    pub fn set(&self, ns: &str, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::ensure_namespace(&conn, ns)?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO {ns} (key, field, value) VALUES (?1, ?2, ?3)"),
            params![key, field, value],
        )?;
        Ok(())
    }

    pub fn get(&self, ns: &str, key: &str, field: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        Self::ensure_namespace(&conn, ns)?;
        let mut stmt =
            conn.prepare(&format!("SELECT value FROM {ns} WHERE key = ?1 AND field = ?2"))?;
        let mut rows = stmt.query(params![key, field])?;
        match rows.next()? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(None),
        }
    }

    /// `get` with a fallback for absent values, mirroring how most call
    /// sites consume the store.
    pub fn get_or(&self, ns: &str, key: &str, field: &str, fallback: &str) -> StoreResult<String> {
        Ok(self
            .get(ns, key, field)?
            .unwrap_or_else(|| fallback.to_string()))
    }

    pub fn get_all_fields(&self, ns: &str, key: &str) -> StoreResult<FieldMap> {
        let conn = self.conn.lock();
        Self::ensure_namespace(&conn, ns)?;
        let mut stmt = conn.prepare(&format!("SELECT field, value FROM {ns} WHERE key = ?1"))?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = FieldMap::new();
        for row in rows {
            let (field, value) = row?;
            map.insert(field, value);
        }
        Ok(map)
    }

    pub fn get_all_keys(&self, ns: &str) -> StoreResult<HashMap<String, FieldMap>> {
        let conn = self.conn.lock();
        Self::ensure_namespace(&conn, ns)?;
        let mut stmt = conn.prepare(&format!("SELECT key, field, value FROM {ns}"))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out: HashMap<String, FieldMap> = HashMap::new();
        for row in rows {
            let (key, field, value) = row?;
            out.entry(key).or_default().insert(field, value);
        }
        Ok(out)
    }

    /// Keys ordered by the numeric value of `order_field`, returned as one
    /// field-map per key.
    ///
    /// Ordering casts the stored text to REAL. Non-numeric values cast to
    /// 0.0 and therefore sort last under `descending` — callers that order
    /// by timestamps never hit this, but it is the documented policy rather
    /// than an error.
    pub fn get_ordered_by(
        &self,
        ns: &str,
        order_field: &str,
        query: &OrderQuery<'_>,
    ) -> StoreResult<Vec<FieldMap>> {
        let keys = {
            let conn = self.conn.lock();
            Self::ensure_namespace(&conn, ns)?;

            let mut sql = format!("SELECT key FROM {ns} WHERE field = ?1");
            let mut params: Vec<String> = vec![order_field.to_string()];
            if let Some(pattern) = query.key_pattern {
                sql.push_str(" AND key LIKE ?");
                sql.push_str(&(params.len() + 1).to_string());
                params.push(pattern.to_string());
            }
            if let Some((field, value)) = query.filter {
                let n = params.len();
                sql.push_str(&format!(
                    " AND key IN (SELECT key FROM {ns} WHERE field = ?{} AND value = ?{})",
                    n + 1,
                    n + 2
                ));
                params.push(field.to_string());
                params.push(value.to_string());
            }
            sql.push_str(" ORDER BY CAST(value AS REAL) ");
            sql.push_str(if query.descending { "DESC" } else { "ASC" });
            // SQLite only accepts OFFSET after LIMIT; -1 means unbounded.
            let limit = query.limit.map_or(-1, |n| n as i64);
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = query.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(params.iter()),
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get_all_fields(ns, &key)?);
        }
        Ok(out)
    }

    /// Delete one field of a key, or the whole key when `field` is `None`.
    pub fn delete(&self, ns: &str, key: &str, field: Option<&str>) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::ensure_namespace(&conn, ns)?;
        match field {
            Some(field) => conn.execute(
                &format!("DELETE FROM {ns} WHERE key = ?1 AND field = ?2"),
                params![key, field],
            )?,
            None => conn.execute(&format!("DELETE FROM {ns} WHERE key = ?1"), params![key])?,
        };
        Ok(())
    }

    pub fn delete_by_pattern(&self, ns: &str, key_pattern: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::ensure_namespace(&conn, ns)?;
        conn.execute(
            &format!("DELETE FROM {ns} WHERE key LIKE ?1"),
            params![key_pattern],
        )?;
        Ok(())
    }

    pub fn delete_all(&self, ns: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::ensure_namespace(&conn, ns)?;
        conn.execute(&format!("DELETE FROM {ns}"), [])?;
        Ok(())
    }
}
