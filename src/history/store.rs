use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{ImageHistory, ImageHistoryEntry};
use crate::error::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS image (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS image_name ON image(name);
CREATE TABLE IF NOT EXISTS image_history_entry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL,
    hash TEXT NOT NULL,
    tags TEXT NOT NULL,
    contents TEXT NOT NULL,
    inspect_info TEXT NOT NULL,
    FOREIGN KEY(image_id) REFERENCES image(id),
    UNIQUE(image_id, hash)
);
"#;

/// SQLite-backed persistence for image histories.
///
/// Every public operation runs in its own transaction and either applies
/// completely or not at all.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "opening history database");
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new image and all of its entries. Ids on the input are
    /// ignored; the returned copy carries the assigned ones.
    pub fn create(&self, history: &ImageHistory) -> Result<ImageHistory> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let created = create_image(&tx, history)?;
        tx.commit()?;
        Ok(created)
    }

    /// Make the stored image identical to `history`: rename it, delete
    /// entries whose digest is gone, update the ones still present and
    /// insert the new ones.
    pub fn update(&self, history: &ImageHistory) -> Result<ImageHistory> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = update_image(&tx, history)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Delete the single image called `name` together with its entries.
    pub fn delete_by_name(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let image_id = single_image(&tx, name)?
            .ok_or_else(|| Error::NotFound(format!("image {name:?}")))?;

        tx.execute(
            "DELETE FROM image_history_entry WHERE image_id = ?1",
            params![image_id],
        )?;
        expect_one(
            tx.execute("DELETE FROM image WHERE id = ?1", params![image_id])?,
            "delete image",
            image_id,
        )?;

        tx.commit()?;
        debug!(image_id, name, "image deleted");
        Ok(())
    }

    /// All images called `name`. Empty if there are none.
    pub fn read_by_name(&self, name: &str) -> Result<Vec<ImageHistory>> {
        let conn = self.conn.lock();
        read_images(
            &conn,
            "SELECT id, name FROM image WHERE name = ?1 ORDER BY id",
            params![name],
        )
    }

    pub fn read_by_id(&self, id: i64) -> Result<ImageHistory> {
        let conn = self.conn.lock();
        let name: Option<String> = conn
            .query_row(
                "SELECT name FROM image WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let name = name.ok_or_else(|| Error::NotFound(format!("image with id {id}")))?;

        Ok(ImageHistory {
            id: Some(id),
            name,
            history: read_entries(&conn, id)?,
        })
    }

    pub fn read_all(&self) -> Result<Vec<ImageHistory>> {
        let conn = self.conn.lock();
        read_images(&conn, "SELECT id, name FROM image ORDER BY id", params![])
    }

    /// Add or replace the entry for `digest` on the single image called
    /// `name`, creating the image if it does not exist yet.
    pub fn record(
        &self,
        name: &str,
        digest: &str,
        entry: ImageHistoryEntry,
    ) -> Result<ImageHistory> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let recorded = match single_image(&tx, name)? {
            None => create_image(&tx, &ImageHistory::new(name).with_entry(digest, entry))?,
            Some(image_id) => {
                let mut history = ImageHistory {
                    id: Some(image_id),
                    name: name.to_string(),
                    history: read_entries(&tx, image_id)?,
                };
                history.history.insert(digest.to_string(), entry);
                update_image(&tx, &history)?
            }
        };

        tx.commit()?;
        Ok(recorded)
    }

    #[cfg(test)]
    fn execute_batch(&self, sql: &str) {
        self.conn.lock().execute_batch(sql).unwrap();
    }
}

fn create_image(conn: &Connection, history: &ImageHistory) -> Result<ImageHistory> {
    conn.execute("INSERT INTO image (name) VALUES (?1)", params![history.name])?;
    let image_id = conn.last_insert_rowid();

    let mut persisted = BTreeMap::new();
    for (hash, entry) in &history.history {
        let entry_id = insert_entry(conn, image_id, hash, entry)?;
        persisted.insert(hash.clone(), with_id(entry, entry_id));
    }

    debug!(image_id, name = %history.name, entries = persisted.len(), "image created");
    Ok(ImageHistory {
        id: Some(image_id),
        name: history.name.clone(),
        history: persisted,
    })
}

fn update_image(conn: &Connection, history: &ImageHistory) -> Result<ImageHistory> {
    let image_id = history
        .id
        .ok_or_else(|| Error::Storage("cannot update an image without an id".to_string()))?;

    let renamed = conn.execute(
        "UPDATE image SET name = ?1 WHERE id = ?2",
        params![history.name, image_id],
    )?;
    if renamed == 0 {
        return Err(Error::NotFound(format!("image with id {image_id}")));
    }

    let stored = read_entries(conn, image_id)?;
    let mut persisted = BTreeMap::new();

    for (hash, old) in &stored {
        let entry_id = old.id.unwrap_or_default();
        match history.history.get(hash) {
            None => {
                expect_one(
                    conn.execute(
                        "DELETE FROM image_history_entry WHERE id = ?1",
                        params![entry_id],
                    )?,
                    "delete",
                    entry_id,
                )?;
            }
            Some(new) => {
                expect_one(
                    conn.execute(
                        "UPDATE image_history_entry
                         SET tags = ?1, contents = ?2, inspect_info = ?3
                         WHERE id = ?4",
                        params![
                            encode(&new.tags)?,
                            encode(&new.contents)?,
                            encode(&new.inspect_info)?,
                            entry_id
                        ],
                    )?,
                    "update",
                    entry_id,
                )?;
                persisted.insert(hash.clone(), with_id(new, entry_id));
            }
        }
    }

    for (hash, new) in &history.history {
        if !stored.contains_key(hash) {
            let entry_id = insert_entry(conn, image_id, hash, new)?;
            persisted.insert(hash.clone(), with_id(new, entry_id));
        }
    }

    debug!(image_id, name = %history.name, entries = persisted.len(), "image updated");
    Ok(ImageHistory {
        id: Some(image_id),
        name: history.name.clone(),
        history: persisted,
    })
}

/// Id of the image called `name`, if there is one. More than one is an error.
fn single_image(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM image WHERE name = ?1")?;
    let ids = stmt
        .query_map(params![name], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    match ids.as_slice() {
        [] => Ok(None),
        [id] => Ok(Some(*id)),
        _ => Err(Error::Ambiguous {
            name: name.to_string(),
            count: ids.len(),
        }),
    }
}

fn with_id(entry: &ImageHistoryEntry, id: i64) -> ImageHistoryEntry {
    ImageHistoryEntry {
        id: Some(id),
        ..entry.clone()
    }
}

fn expect_one(changed: usize, action: &str, id: i64) -> Result<()> {
    if changed == 1 {
        Ok(())
    } else {
        Err(Error::Storage(format!(
            "{action} of row {id} affected {changed} rows"
        )))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Storage(format!("failed to encode column: {e}")))
}

fn decode<T: DeserializeOwned>(column: &str, data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| Error::Storage(format!("corrupt {column} column: {e}")))
}

fn insert_entry(
    conn: &Connection,
    image_id: i64,
    hash: &str,
    entry: &ImageHistoryEntry,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO image_history_entry (image_id, hash, tags, contents, inspect_info)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            image_id,
            hash,
            encode(&entry.tags)?,
            encode(&entry.contents)?,
            encode(&entry.inspect_info)?
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn read_entries(conn: &Connection, image_id: i64) -> Result<BTreeMap<String, ImageHistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, hash, tags, contents, inspect_info
         FROM image_history_entry WHERE image_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![image_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, hash, tags, contents, inspect_info)| {
            let entry = ImageHistoryEntry {
                id: Some(id),
                tags: decode("tags", &tags)?,
                contents: decode("contents", &contents)?,
                inspect_info: decode("inspect_info", &inspect_info)?,
            };
            Ok((hash, entry))
        })
        .collect()
}

fn read_images(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ImageHistory>> {
    let images = {
        let mut stmt = conn.prepare(sql)?;
        stmt.query_map(params, |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    images
        .into_iter()
        .map(|(id, name)| {
            Ok(ImageHistory {
                id: Some(id),
                name,
                history: read_entries(conn, id)?,
            })
        })
        .collect()
}
