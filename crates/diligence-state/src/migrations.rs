//! SurrealDB schema migrations and initialization

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Initialize all session tables.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing session store schema");
    init_sessions_table(db).await?;
    Ok(())
}

/// Initialize `sessions` table
///
/// Schema:
/// ```text
/// TABLE sessions {
///   session_id:  STRING (unique)
///   status:      STRING (running | completed | partial | failed | cancelled)
///   document:    STRING (JSON-encoded SessionRecord)
///   created_at:  STRING (RFC 3339)
///   updated_at:  STRING (RFC 3339)
/// }
/// ```
///
/// The session document is written whole on every update; task-level
/// atomicity and the state machine are enforced by the application.
async fn init_sessions_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing sessions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS sessions SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_session_id ON TABLE sessions COLUMNS session_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_session_status ON TABLE sessions COLUMNS status;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StorageError::Backend(format!("schema setup failed: {e}")))?
        .check()
        .map_err(|e| StorageError::Backend(format!("schema setup failed: {e}")))?;

    Ok(())
}
