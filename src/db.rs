use anyhow::{Context, Result, anyhow};
use duckdb::{Connection, params};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Durable set of finished thread ids for one scrape tag.
///
/// Every `mark_done` is its own auto-committed statement, so once it returns the id
/// is in DuckDB's write-ahead log and survives a kill.
pub struct CheckpointStore {
    conn: Option<Connection>,
    path: PathBuf,
    tag: String,
}

impl CheckpointStore {
    /// Open (or create) the store. A file that already belongs to another tag is refused.
    pub fn open(path: impl AsRef<Path>, tag: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("opening checkpoint store {}", path.display()))?;
        conn.execute_batch(
            r#"
            -- Plain tables, no PRIMARY KEY: inserts guard with NOT EXISTS instead
            CREATE TABLE IF NOT EXISTS store_meta (
                key VARCHAR,
                value VARCHAR
            );

            CREATE TABLE IF NOT EXISTS done (
                id VARCHAR,
                done_at BIGINT
            );

            CREATE INDEX IF NOT EXISTS idx_done_id ON done(id);
            "#,
        )?;

        let existing: Option<String> = {
            let mut stmt = conn.prepare("SELECT value FROM store_meta WHERE key = 'tag' LIMIT 1")?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        match existing {
            Some(t) if t != tag => {
                return Err(anyhow!(
                    "checkpoint store {} belongs to tag {t:?}, not {tag:?}",
                    path.display()
                ));
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO store_meta(key, value) VALUES ('tag', ?)",
                    params![tag],
                )?;
            }
        }

        tracing::debug!(path = %path.display(), tag, "Checkpoint store open");
        Ok(Self {
            conn: Some(conn),
            path,
            tag: tag.to_string(),
        })
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| anyhow!("checkpoint store {} is closed", self.path.display()))
    }

    pub fn is_done(&self, id: &str) -> Result<bool> {
        let n: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM done WHERE id = ?",
            params![id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Idempotent: marking an id twice leaves a single entry.
    pub fn mark_done(&self, id: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO done(id, done_at) SELECT ?, ? WHERE NOT EXISTS (SELECT 1 FROM done WHERE id = ?)",
                params![id, now_secs(), id],
            )
            .with_context(|| format!("recording checkpoint for {id}"))?;
        Ok(())
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM done", [], |r| r.get(0))?)
    }

    /// Flush and release the file. Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.execute_batch("CHECKPOINT;")?;
        conn.close()
            .map_err(|(_, e)| anyhow!("closing checkpoint store {}: {e}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), tag = %self.tag, "Checkpoint store closed");
        Ok(())
    }
}

impl Drop for CheckpointStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Checkpoint store did not close cleanly");
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
