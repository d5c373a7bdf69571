//! Conversation history, one append-only log per peer.
//!
//! Writes go through a single `history_writer` thread that owns the write
//! connection; reads open their own connection on the blocking pool so a
//! long scroll-back never queues behind an append.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[cfg(feature = "native")]
use std::{
    sync::mpsc::{self, Receiver, Sender},
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
#[cfg(feature = "native")]
use rusqlite::{Connection, params};
use tern_core::event::EventPayload;
#[cfg(feature = "native")]
use tokio::{sync::oneshot, task};
#[cfg(feature = "native")]
use tracing::{debug, info};

pub const WRITE_ERROR_TITLE: &str = "Disk Write Error";
pub const READ_ERROR_TITLE: &str = "Database Error";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open history at {path}: {reason}")]
    ConnectionFailed { path: PathBuf, reason: String },

    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("malformed history line {line} for {peer}: {reason}")]
    Malformed {
        peer: String,
        line: u64,
        reason: String,
    },
}

impl StorageError {
    /// Event published when appending to the history failed.
    pub fn write_event(&self) -> EventPayload {
        EventPayload::DbError {
            title: WRITE_ERROR_TITLE.to_string(),
            message: self.to_string(),
        }
    }

    /// Event published when the history could not be read back.
    pub fn read_event(&self) -> EventPayload {
        EventPayload::DbError {
            title: READ_ERROR_TITLE.to_string(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Recv,
    Sent,
    /// A contact's status change, text prefixed with the show value.
    Status,
    Error,
    Gc,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recv => "recv",
            Self::Sent => "sent",
            Self::Status => "status",
            Self::Error => "error",
            Self::Gc => "gc",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "recv" => Ok(Self::Recv),
            "sent" => Ok(Self::Sent),
            "status" => Ok(Self::Status),
            "error" => Ok(Self::Error),
            "gc" => Ok(Self::Gc),
            other => Err(format!("unknown log kind {other:?}")),
        }
    }
}

/// One line of a peer's history. `line_number` counts from zero per peer.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub line_number: u64,
    pub kind: LogKind,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[cfg(feature = "native")]
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    writer: Sender<WriteCommand>,
}

#[cfg(feature = "native")]
enum WriteCommand {
    Append {
        peer: String,
        kind: LogKind,
        text: String,
        timestamp: DateTime<Utc>,
        response: oneshot::Sender<Result<(), StorageError>>,
    },
}

#[cfg(feature = "native")]
enum WriterState {
    Ready(Connection),
    Failed(String),
}

#[cfg(feature = "native")]
fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    let failed = |reason: String| StorageError::ConnectionFailed {
        path: path.to_path_buf(),
        reason,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| failed(error.to_string()))?;
    }

    let connection = Connection::open(path).map_err(|error| failed(error.to_string()))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|error| failed(error.to_string()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .map_err(|error| failed(error.to_string()))?;
    Ok(connection)
}

#[cfg(feature = "native")]
struct Migration {
    version: u32,
    sql: &'static str,
}

#[cfg(feature = "native")]
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/001_history.sql"),
}];

#[cfg(feature = "native")]
fn run_migrations(connection: &Connection) -> Result<(), StorageError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|error| StorageError::MigrationFailed {
            version: 0,
            reason: format!("failed to create _migrations table: {error}"),
        })?;

    for migration in MIGRATIONS {
        let failed = |reason: String| StorageError::MigrationFailed {
            version: migration.version,
            reason,
        };

        let is_applied: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                params![migration.version],
                |row| row.get(0),
            )
            .map_err(|error| failed(format!("failed to query migration state: {error}")))?;
        if is_applied != 0 {
            continue;
        }

        let tx = connection
            .unchecked_transaction()
            .map_err(|error| failed(format!("failed to begin transaction: {error}")))?;
        tx.execute_batch(migration.sql)
            .map_err(|error| failed(error.to_string()))?;
        tx.execute(
            "INSERT INTO _migrations (version) VALUES (?1)",
            params![migration.version],
        )
        .map_err(|error| failed(format!("failed to record migration: {error}")))?;
        tx.commit()
            .map_err(|error| failed(format!("failed to commit migration: {error}")))?;

        info!(version = migration.version, "applied history migration");
    }

    Ok(())
}

#[cfg(feature = "native")]
fn append_line(
    connection: &Connection,
    peer: &str,
    kind: LogKind,
    text: &str,
    timestamp: DateTime<Utc>,
) -> Result<(), StorageError> {
    connection
        .execute(
            "INSERT INTO history (peer, kind, timestamp, text) VALUES (?1, ?2, ?3, ?4)",
            params![peer, kind.as_str(), timestamp.to_rfc3339(), text],
        )
        .map(|_| ())
        .map_err(|error| StorageError::QueryFailed(error.to_string()))
}

#[cfg(feature = "native")]
fn select_lines(
    connection: &Connection,
    peer: &str,
    start: u64,
    end: u64,
) -> Result<Vec<LogLine>, StorageError> {
    let query_failed = |error: rusqlite::Error| StorageError::QueryFailed(error.to_string());
    let mut statement = connection
        .prepare(
            "SELECT kind, timestamp, text FROM history
             WHERE peer = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
        )
        .map_err(query_failed)?;

    let limit = i64::try_from(end - start).unwrap_or(i64::MAX);
    let offset = i64::try_from(start).unwrap_or(i64::MAX);
    let mut rows = statement
        .query(params![peer, limit, offset])
        .map_err(query_failed)?;

    let mut lines = Vec::new();
    let mut line_number = start;
    while let Some(row) = rows.next().map_err(query_failed)? {
        let kind: String = row.get(0).map_err(query_failed)?;
        let timestamp: String = row.get(1).map_err(query_failed)?;
        let text: String = row.get(2).map_err(query_failed)?;

        let malformed = |reason: String| StorageError::Malformed {
            peer: peer.to_string(),
            line: line_number,
            reason,
        };
        lines.push(LogLine {
            line_number,
            kind: kind.parse().map_err(malformed)?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|error| malformed(error.to_string()))?
                .with_timezone(&Utc),
            text,
        });
        line_number += 1;
    }

    Ok(lines)
}

#[cfg(feature = "native")]
fn run_writer(path: PathBuf, receiver: Receiver<WriteCommand>) {
    let state = match open_connection(&path) {
        Ok(connection) => WriterState::Ready(connection),
        Err(error) => WriterState::Failed(error.to_string()),
    };

    while let Ok(command) = receiver.recv() {
        match command {
            WriteCommand::Append {
                peer,
                kind,
                text,
                timestamp,
                response,
            } => {
                let result = match &state {
                    WriterState::Ready(connection) => {
                        append_line(connection, &peer, kind, &text, timestamp)
                    }
                    WriterState::Failed(reason) => Err(StorageError::ConnectionFailed {
                        path: path.clone(),
                        reason: reason.clone(),
                    }),
                };

                let _ = response.send(result);
            }
        }
    }
    debug!("history writer stopped");
}

#[cfg(feature = "native")]
impl HistoryStore {
    /// Open (or create) the history database at `path` and apply pending
    /// migrations.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let setup_path = path.clone();

        task::spawn_blocking(move || {
            let connection = open_connection(&setup_path)?;
            run_migrations(&connection)
        })
        .await
        .map_err(|error| StorageError::ConnectionFailed {
            path: path.clone(),
            reason: format!("failed to join history setup task: {error}"),
        })??;

        let (writer, receiver) = mpsc::channel();
        let writer_path = path.clone();

        thread::Builder::new()
            .name("history_writer".to_string())
            .spawn(move || run_writer(writer_path, receiver))
            .map_err(|error| StorageError::ConnectionFailed {
                path: path.clone(),
                reason: format!("failed to spawn history_writer thread: {error}"),
            })?;

        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line to `peer`'s history.
    pub async fn write(
        &self,
        kind: LogKind,
        peer: &str,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        let command = WriteCommand::Append {
            peer: peer.to_string(),
            kind,
            text: text.to_string(),
            timestamp,
            response: response_tx,
        };

        self.writer.send(command).map_err(|_| {
            StorageError::QueryFailed("history writer is unavailable".to_string())
        })?;

        response_rx.await.map_err(|_| {
            StorageError::QueryFailed("history writer stopped before responding".to_string())
        })?
    }

    /// Lines `start..end` of `peer`'s history, oldest first. An empty or
    /// inverted range yields nothing.
    pub async fn read_range(
        &self,
        peer: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<LogLine>, StorageError> {
        if end <= start {
            return Ok(Vec::new());
        }

        let peer = peer.to_string();
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let connection = open_connection(&path)?;
            select_lines(&connection, &peer, start, end)
        })
        .await
        .map_err(|error| StorageError::QueryFailed(format!("failed to join read task: {error}")))?
    }

    pub async fn count_lines(&self, peer: &str) -> Result<u64, StorageError> {
        let peer = peer.to_string();
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let connection = open_connection(&path)?;
            connection
                .query_row(
                    "SELECT COUNT(*) FROM history WHERE peer = ?1",
                    params![peer],
                    |row| row.get::<_, i64>(0),
                )
                .map(|count| u64::try_from(count).unwrap_or(0))
                .map_err(|error| StorageError::QueryFailed(error.to_string()))
        })
        .await
        .map_err(|error| StorageError::QueryFailed(format!("failed to join count task: {error}")))?
    }
}

#[cfg(not(feature = "native"))]
compile_error!("tern-storage requires the `native` feature.");
