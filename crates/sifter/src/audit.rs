//! Append-only audit log of outbound call attempts.
//!
//! Every attempt made through [`RateLimitedClient`](crate::client::RateLimitedClient) lands here
//! as one row: which target and operation, the attempt number, and the outcome. The log lives in
//! its own SQLite database, separate from run checkpoints, and the schema rejects updates and
//! deletes.

use rusqlite::params;
use tokio_rusqlite::Connection;

use super::*;

/// One logged call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
  /// When the attempt finished.
  pub at:          DateTime<Utc>,
  /// Downstream service, e.g. `llm` or a provider name.
  pub target:      String,
  /// Operation within the target, e.g. `screen` or `lookup`.
  pub operation:   String,
  /// 1-based attempt number within the call.
  pub attempt:     u32,
  /// `success`, `rate_limited`, `transient` or `permanent`.
  pub outcome:     String,
  /// Error message or other detail.
  pub detail:      Option<String>,
  /// Wall time of the attempt.
  pub duration_ms: u64,
}

/// Handle to the audit database.
#[derive(Clone)]
pub struct AuditLog {
  conn: Connection,
}

impl AuditLog {
  /// Opens (creating if needed) the audit database at `path`.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    if let Some(parent) = path.as_ref().parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    let conn = Connection::open(path.as_ref()).await?;
    Self::init(conn).await
  }

  /// An audit log that lives only as long as the handle.
  pub async fn in_memory() -> Result<Self> { Self::init(Connection::open_in_memory().await?).await }

  async fn init(conn: Connection) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch(include_str!(concat!(
          env!("CARGO_MANIFEST_DIR"),
          "/migrations/audit.sql"
        )))?;
        Ok(())
      })
      .await?;
    Ok(Self { conn })
  }

  /// Appends one entry and returns its row id.
  pub async fn append(&self, entry: AuditEntry) -> Result<i64> {
    let id = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "INSERT INTO call_attempts (at, target, operation, attempt, outcome, detail, duration_ms)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.execute(params![
          entry.at.to_rfc3339(),
          entry.target,
          entry.operation,
          entry.attempt,
          entry.outcome,
          entry.detail,
          entry.duration_ms as i64,
        ])?;
        Ok(conn.last_insert_rowid())
      })
      .await?;
    Ok(id)
  }

  /// Closes the database. Clones of this handle fail from then on.
  #[cfg(test)]
  pub(crate) async fn close(self) -> Result<()> {
    self.conn.close().await?;
    Ok(())
  }

  /// All entries for `target` (or every target), oldest first.
  pub async fn entries(&self, target: Option<&str>) -> Result<Vec<AuditEntry>> {
    let target = target.map(str::to_string);
    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT at, target, operation, attempt, outcome, detail, duration_ms
           FROM call_attempts
           WHERE ?1 IS NULL OR target = ?1
           ORDER BY id",
        )?;
        let rows = stmt
          .query_map(params![target], |row| {
            Ok((
              row.get::<_, String>(0)?,
              row.get::<_, String>(1)?,
              row.get::<_, String>(2)?,
              row.get::<_, u32>(3)?,
              row.get::<_, String>(4)?,
              row.get::<_, Option<String>>(5)?,
              row.get::<_, i64>(6)?,
            ))
          })?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(at, target, operation, attempt, outcome, detail, duration_ms)| {
        let at = DateTime::parse_from_rfc3339(&at)
          .map_err(|e| SifterError::DataValidation(format!("bad audit timestamp '{at}': {e}")))?
          .with_timezone(&Utc);
        Ok(AuditEntry {
          at,
          target,
          operation,
          attempt,
          outcome,
          detail,
          duration_ms: duration_ms.max(0) as u64,
        })
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(target: &str, attempt: u32, outcome: &str) -> AuditEntry {
    AuditEntry {
      at: Utc::now(),
      target: target.into(),
      operation: "lookup".into(),
      attempt,
      outcome: outcome.into(),
      detail: None,
      duration_ms: 12,
    }
  }

  #[tokio::test]
  async fn appends_in_order() {
    let log = AuditLog::in_memory().await.unwrap();
    log.append(entry("crossref", 1, "rate_limited")).await.unwrap();
    log.append(entry("crossref", 2, "success")).await.unwrap();
    log.append(entry("llm", 1, "success")).await.unwrap();

    let crossref = log.entries(Some("crossref")).await.unwrap();
    assert_eq!(crossref.len(), 2);
    assert_eq!(crossref[0].outcome, "rate_limited");
    assert_eq!(crossref[1].attempt, 2);
    assert_eq!(log.entries(None).await.unwrap().len(), 3);
  }

  #[tokio::test]
  async fn rows_cannot_be_rewritten() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("audit.db");
    let log = AuditLog::open(&path).await.unwrap();
    log.append(entry("llm", 1, "success")).await.unwrap();

    let result = log
      .conn
      .call(|conn| {
        conn.execute("DELETE FROM call_attempts", [])?;
        Ok(())
      })
      .await;
    assert!(result.is_err());

    // Reopening keeps existing rows.
    drop(log);
    let log = AuditLog::open(&path).await.unwrap();
    assert_eq!(log.entries(None).await.unwrap().len(), 1);
  }
}
