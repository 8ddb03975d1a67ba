use std::path::Path;

use anyhow::Result;
use libsql::{Builder, Connection, Error};

use super::tables::initialize_database;

/// Opens a connection to the broker database with the schema and pragmas
/// applied. Both the writer and the read pool come through here, so every
/// connection sees the same setup.
pub(super) async fn open_connection(data_dir: &Path, filename: &str) -> Result<Connection, Error> {
    let db = Builder::new_local(data_dir.join(filename)).build().await?;
    let conn = db.connect()?;
    initialize_database(&conn).await?;
    Ok(conn)
}

/// The one mutating connection. Admission, the pipeline workers and the
/// tracker all funnel their writes through it; reservation serialization
/// happens above this layer, on the context's reservation lock.
#[derive(Clone)]
pub struct Writer {
    conn: Connection,
}

impl Writer {
    pub async fn new(data_dir: &Path, filename: &str) -> Result<Self> {
        let conn = open_connection(data_dir, filename).await?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }
}
