use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use deadpool::managed::{self, Object, Pool, RecycleError, RecycleResult};
use libsql::Error;

use super::writer::open_connection;

/// How many pooled read connections the SP-facing API gets. Listing and
/// eligibility queries are correlated-subquery heavy, so one connection per
/// core is the useful ceiling; more would just queue inside SQLite.
const MAX_READ_CONNECTIONS: usize = 8;

pub struct Manager {
    data_dir: PathBuf,
    filename: String,
}

impl managed::Manager for Manager {
    type Type = libsql::Connection;
    type Error = Error;

    async fn create(&self) -> Result<Self::Type, Error> {
        open_connection(&self.data_dir, &self.filename).await
    }

    /// A connection is handed back out only while it can still see the
    /// global metadata singleton; anything else means the file was swapped
    /// or the handle has gone bad, and the pool should reconnect.
    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &managed::Metrics,
    ) -> RecycleResult<Error> {
        let n: i64 = conn
            .query("SELECT COUNT(*) FROM global", ())
            .await
            .map_err(|e| RecycleError::Message(format!("{}", e).into()))?
            .next()
            .await
            .map_err(|e| RecycleError::Message(format!("{}", e).into()))?
            .ok_or_else(|| RecycleError::Message("No rows returned".into()))?
            .get(0)
            .map_err(|e| RecycleError::Message(format!("{}", e).into()))?;

        if n == 1 {
            Ok(())
        } else {
            Err(RecycleError::Message(
                "global metadata row missing, reconnecting".into(),
            ))
        }
    }
}

/// Read-side pool backing the HTTP surface. All mutation goes through
/// [`super::Writer`] instead.
#[derive(Clone)]
pub struct Reader {
    pool: Pool<Manager>,
}

impl Reader {
    pub async fn new(data_dir: &Path, filename: &str) -> Result<Self> {
        let manager = Manager {
            data_dir: data_dir.to_path_buf(),
            filename: filename.to_string(),
        };
        let size = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
            .min(MAX_READ_CONNECTIONS);
        let pool = Pool::builder(manager)
            .max_size(size)
            .build()
            .context("Failed to build database read pool")?;
        Ok(Self { pool })
    }

    pub async fn connection(&self) -> Result<Object<Manager>> {
        self.pool
            .get()
            .await
            .context("Failed to get connection from database read pool")
    }
}
