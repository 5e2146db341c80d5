use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::{Connection, OptionalExtension, params};

use super::{CatalogStore, ImageId, ImageRecord, SearchResult, check_dims};
use crate::vector::{cosine_distance, pack, sanitize, unpack};
use crate::{Result, VaultError};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    embedding BLOB NOT NULL,
    dims INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS catalog_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const RANK_SQL: &str = "
SELECT id, path, vector_distance_cos(embedding, ?1) AS distance
FROM images
ORDER BY distance ASC, id ASC
LIMIT ?2";

/// SQLite-backed catalog. Embeddings are stored as packed little-endian
/// `f32` blobs and ranked with the `vector_distance_cos` SQL function.
///
/// A catalog file is bound to the model that first wrote to it; reopening
/// with a different model or dimension fails with
/// [`VaultError::ModelMismatch`].
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
    dims: usize,
    path: Option<PathBuf>,
}

impl SqliteCatalog {
    /// Open or create a catalog file.
    pub fn open(path: &Path, model: &str, dims: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::io_at(e, parent))?;
        }
        let conn = Connection::open(path)?;
        let catalog = Self::init(conn, model, dims, Some(path.to_path_buf()))?;
        tracing::debug!(path = %path.display(), model, dims, "catalog opened");
        Ok(catalog)
    }

    /// Catalog that lives only as long as this value.
    pub fn open_in_memory(model: &str, dims: usize) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, model, dims, None)
    }

    fn init(conn: Connection, model: &str, dims: usize, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA cache_size = -8000;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        register_distance_function(&conn)?;
        bind_model(&conn, model, dims)?;
        Ok(Self {
            conn: Mutex::new(conn),
            dims,
            path,
        })
    }

    /// Backing file, `None` for in-memory catalogs.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::Lock("catalog connection poisoned".into()))
    }

    fn decode(&self, id: i64, image_ref: String, blob: &[u8]) -> Result<ImageRecord> {
        let embedding = unpack(blob)?;
        // A record of the wrong length can only come from a torn write.
        if embedding.len() != self.dims {
            return Err(VaultError::Storage {
                reason: format!(
                    "record {id} has {} dims, catalog expects {}",
                    embedding.len(),
                    self.dims
                ),
            });
        }
        Ok(ImageRecord {
            id: to_image_id(id)?,
            image_ref,
            embedding,
        })
    }
}

fn to_image_id(id: i64) -> Result<ImageId> {
    ImageId::try_from(id).map_err(|_| VaultError::Storage {
        reason: format!("invalid record id {id}"),
    })
}

fn from_image_id(id: ImageId) -> Result<i64> {
    i64::try_from(id).map_err(|_| VaultError::ImageNotFound { id })
}

fn register_distance_function(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "vector_distance_cos",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx: &Context<'_>| {
            let blob = |idx: usize| -> rusqlite::Result<Vec<f32>> {
                let bytes = ctx
                    .get_raw(idx)
                    .as_blob()
                    .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                unpack(bytes).map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
            };
            let a = blob(0)?;
            let b = blob(1)?;
            Ok(f64::from(cosine_distance(&a, &b)))
        },
    )?;
    Ok(())
}

fn bind_model(conn: &Connection, model: &str, dims: usize) -> Result<()> {
    let read = |key: &str| -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT value FROM catalog_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    };

    match (read("model")?, read("dims")?) {
        (Some(bound_model), Some(bound_dims)) => {
            if bound_model != model || bound_dims != dims.to_string() {
                return Err(VaultError::ModelMismatch {
                    expected: format!("{bound_model} ({bound_dims} dims)"),
                    actual: format!("{model} ({dims} dims)"),
                });
            }
        }
        _ => {
            conn.execute(
                "INSERT OR REPLACE INTO catalog_meta (key, value) VALUES ('model', ?1), ('dims', ?2)",
                params![model, dims.to_string()],
            )?;
        }
    }
    Ok(())
}

impl CatalogStore for SqliteCatalog {
    fn dims(&self) -> usize {
        self.dims
    }

    fn insert(&self, image_ref: &str, embedding: &[f32]) -> Result<ImageId> {
        check_dims(self.dims, embedding)?;
        let blob = pack(&sanitize(embedding));
        let dims = i64::try_from(self.dims).map_err(|_| VaultError::Storage {
            reason: format!("dimension {} out of range", self.dims),
        })?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO images (path, embedding, dims, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![image_ref, blob, dims, chrono::Utc::now().timestamp()],
        )?;
        let id = to_image_id(conn.last_insert_rowid())?;
        tracing::debug!(id, image_ref, "image record inserted");
        Ok(id)
    }

    fn get(&self, id: ImageId) -> Result<ImageRecord> {
        let key = from_image_id(id)?;
        let row = self
            .conn()?
            .query_row(
                "SELECT id, path, embedding FROM images WHERE id = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;
        let (id_raw, image_ref, blob) = row.ok_or(VaultError::ImageNotFound { id })?;
        self.decode(id_raw, image_ref, &blob)
    }

    fn list(&self) -> Result<Vec<ImageRecord>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT id, path, embedding FROM images ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter()
            .map(|(id, image_ref, blob)| self.decode(id, image_ref, &blob))
            .collect()
    }

    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        check_dims(self.dims, embedding)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(k).unwrap_or(i64::MAX);
        let target = pack(&sanitize(embedding));

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(RANK_SQL)?;
        let rows = stmt
            .query_map(params![target, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, image_ref, distance)| {
                Ok(SearchResult {
                    id: to_image_id(id)?,
                    image_ref,
                    distance: distance as f32,
                })
            })
            .collect()
    }

    fn delete_all(&self) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM images", [])?;
        tx.commit()?;
        tracing::info!(removed, "catalog cleared");
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
