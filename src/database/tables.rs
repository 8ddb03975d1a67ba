pub const CREATE_SCHEMA: &str = include_str!("sql/schema.sql");

pub async fn initialize_database(conn: &libsql::Connection) -> Result<(), libsql::Error> {
    conn.query("PRAGMA foreign_keys = ON;", ()).await?;
    conn.execute_batch(CREATE_SCHEMA).await?;
    conn.query("PRAGMA journal_mode = WAL;", ()).await?;
    conn.query("PRAGMA synchronous = NORMAL;", ()).await?;
    // the read pool and the single writer share one file; readers wait out
    // short write bursts instead of surfacing SQLITE_BUSY to the API
    conn.query("PRAGMA busy_timeout = 5000;", ()).await?;
    Ok(())
}
