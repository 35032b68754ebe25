//! Database module
//!
//! Durable storage for the one active conversation state per user, with
//! epoch-checked writes.

mod schema;

pub use schema::FlowCount;
use schema::{StateRow, SCHEMA};

use crate::state_machine::{ConversationState, FlowContext, FlowId, Step};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Concurrent modification of state for user {user_id}: expected epoch {expected}, found {found:?}")]
    ConcurrentModification {
        user_id: String,
        expected: u64,
        found: Option<u64>,
    },
    #[error("Corrupt state row for user {user_id}: {detail}")]
    Corrupt { user_id: String, detail: String },
    #[error("Database lock poisoned")]
    LockPoisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== State Operations ====================

    /// Load the active state for a user; `None` means no active flow
    pub fn load_state(&self, user_id: &str) -> DbResult<Option<ConversationState>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversation_states WHERE user_id = ?1",
                    StateRow::COLUMNS
                ),
                params![user_id],
                StateRow::from_row,
            )
            .optional()?;
        row.map(decode_row).transpose()
    }

    /// Epoch-checked upsert.
    ///
    /// The write only happens when the stored epoch equals `state.epoch`
    /// (0 meaning "no row"). Returns the new epoch, which is strictly
    /// greater than any epoch previously issued to this user.
    pub fn save_state(&self, state: &ConversationState) -> DbResult<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let stored: Option<i64> = tx
            .query_row(
                "SELECT epoch FROM conversation_states WHERE user_id = ?1",
                params![state.user_id],
                |row| row.get(0),
            )
            .optional()?;
        let stored = stored.map(|e| to_epoch(&state.user_id, e)).transpose()?;

        if stored.unwrap_or(0) != state.epoch {
            return Err(DbError::ConcurrentModification {
                user_id: state.user_id.clone(),
                expected: state.epoch,
                found: stored,
            });
        }

        let watermark: Option<i64> = tx
            .query_row(
                "SELECT epoch FROM epoch_watermarks WHERE user_id = ?1",
                params![state.user_id],
                |row| row.get(0),
            )
            .optional()?;
        let watermark = watermark
            .map(|e| to_epoch(&state.user_id, e))
            .transpose()?
            .unwrap_or(0);

        let new_epoch = stored.unwrap_or(0).max(watermark) + 1;
        let new_epoch_sql = from_epoch(&state.user_id, new_epoch)?;
        let context = serde_json::to_string(&state.context).map_err(|e| DbError::Corrupt {
            user_id: state.user_id.clone(),
            detail: format!("context not serializable: {e}"),
        })?;

        tx.execute(
            "INSERT INTO conversation_states
                (user_id, channel_id, flow, step, context, epoch, updated_at, last_event_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                flow = excluded.flow,
                step = excluded.step,
                context = excluded.context,
                epoch = excluded.epoch,
                updated_at = excluded.updated_at,
                last_event_id = excluded.last_event_id",
            params![
                state.user_id,
                state.channel_id,
                state.flow.as_str(),
                state.step.as_str(),
                context,
                new_epoch_sql,
                format_datetime(state.updated_at),
                state.last_event_id,
            ],
        )?;
        tx.execute(
            "INSERT INTO epoch_watermarks (user_id, epoch) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET epoch = excluded.epoch",
            params![state.user_id, new_epoch_sql],
        )?;
        tx.commit()?;

        Ok(new_epoch)
    }

    /// Delete the user's state; idempotent
    pub fn clear_state(&self, user_id: &str) -> DbResult<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM conversation_states WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(deleted > 0)
    }

    /// Delete states not updated since `cutoff`; returns how many
    pub fn sweep_stale(&self, cutoff: DateTime<Utc>) -> DbResult<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM conversation_states WHERE updated_at < ?1",
            params![format_datetime(cutoff)],
        )?;
        Ok(deleted)
    }

    /// Active conversations grouped by flow
    pub fn count_active_by_flow(&self) -> DbResult<Vec<FlowCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT flow, COUNT(*) FROM conversation_states GROUP BY flow ORDER BY flow",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (flow, count) = row?;
            match flow.parse::<FlowId>() {
                Ok(flow) => counts.push(FlowCount {
                    flow,
                    active: u64::try_from(count).unwrap_or(0),
                }),
                Err(e) => tracing::warn!(flow = %flow, error = %e, "Skipping unknown flow in stats"),
            }
        }
        Ok(counts)
    }

    /// Every stored state, oldest first; corrupt rows are logged and skipped
    pub fn list_states(&self) -> DbResult<Vec<ConversationState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversation_states ORDER BY updated_at",
            StateRow::COLUMNS
        ))?;
        let rows = stmt
            .query_map([], StateRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match decode_row(row) {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::error!(error = %e, "Skipping corrupt state row");
                    None
                }
            })
            .collect())
    }
}

fn decode_row(row: StateRow) -> DbResult<ConversationState> {
    let corrupt = |detail: String| DbError::Corrupt {
        user_id: row.user_id.clone(),
        detail,
    };

    let flow: FlowId = row.flow.parse().map_err(corrupt)?;
    let step: Step = row.step.parse().map_err(corrupt)?;
    let context: FlowContext = serde_json::from_str(&row.context)
        .map_err(|e| corrupt(format!("context: {e}")))?;
    if context.flow() != flow {
        return Err(corrupt(format!(
            "context belongs to {} but row names {flow}",
            context.flow()
        )));
    }
    let epoch = to_epoch(&row.user_id, row.epoch)?;
    let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
        .map_err(|e| corrupt(format!("updated_at: {e}")))?
        .with_timezone(&Utc);

    Ok(ConversationState {
        user_id: row.user_id,
        channel_id: row.channel_id,
        flow,
        step,
        context,
        epoch,
        updated_at,
        last_event_id: row.last_event_id,
    })
}

fn to_epoch(user_id: &str, raw: i64) -> DbResult<u64> {
    u64::try_from(raw).map_err(|_| DbError::Corrupt {
        user_id: user_id.to_string(),
        detail: format!("negative epoch {raw}"),
    })
}

fn from_epoch(user_id: &str, epoch: u64) -> DbResult<i64> {
    i64::try_from(epoch).map_err(|_| DbError::Corrupt {
        user_id: user_id.to_string(),
        detail: format!("epoch {epoch} out of range"),
    })
}

/// Fixed-precision UTC so lexical order equals time order
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}
