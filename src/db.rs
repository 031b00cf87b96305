use std::path::Path;
use std::time::Duration;

use mongodb::{options::ClientOptions, Client, Collection};
use rusqlite::{params, Connection};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::info;

use crate::models::domain::PacketObservation;
use crate::models::dto::PacketRecord;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("mongodb: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("sink already closed")]
    Closed,
    #[error("{0}")]
    Unavailable(String),
}

/// Append-only store for raw packet records.
pub trait PacketSink: Send {
    fn append_batch(&mut self, batch: &[PacketObservation]) -> Result<(), SinkError>;

    fn append(&mut self, obs: &PacketObservation) -> Result<(), SinkError> {
        self.append_batch(std::slice::from_ref(obs))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: PacketSink + ?Sized> PacketSink for Box<S> {
    fn append_batch(&mut self, batch: &[PacketObservation]) -> Result<(), SinkError> {
        (**self).append_batch(batch)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        (**self).close()
    }
}

/// Discards everything, for runs without persistence.
#[derive(Debug, Default)]
pub struct NullSink;

impl PacketSink for NullSink {
    fn append_batch(&mut self, _batch: &[PacketObservation]) -> Result<(), SinkError> {
        Ok(())
    }
}

pub struct SqliteSink {
    conn: Option<Connection>,
}

impl SqliteSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let conn = Connection::open(path.as_ref())?;
        info!("Opened packet database {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, SinkError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    pub fn with_connection(mut conn: Connection) -> Result<Self, SinkError> {
        init_schema(&mut conn)?;
        Ok(Self { conn: Some(conn) })
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }
}

fn init_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        CREATE TABLE IF NOT EXISTS packets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip_src TEXT,
            ip_dst TEXT,
            protocol INTEGER,
            length INTEGER,
            captured_at TEXT
        );
        ",
    )?;
    // older databases may predate these columns
    ensure_column(conn, "packets", "length", "INTEGER")?;
    ensure_column(conn, "packets", "captured_at", "TEXT")?;
    Ok(())
}

fn ensure_column(conn: &mut Connection, table: &str, column: &str, col_type: &str) -> rusqlite::Result<()> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(());
        }
    }
    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, col_type);
    conn.execute(&sql, [])?;
    Ok(())
}

impl PacketSink for SqliteSink {
    fn append_batch(&mut self, batch: &[PacketObservation]) -> Result<(), SinkError> {
        let conn = self.conn.as_mut().ok_or(SinkError::Closed)?;
        if batch.is_empty() {
            return Ok(());
        }
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO packets (ip_src, ip_dst, protocol, length, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for obs in batch {
                let record = PacketRecord::from(obs);
                stmt.execute(params![
                    record.ip_src,
                    record.ip_dst,
                    record.protocol,
                    record.length,
                    record.captured_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        match self.conn.take() {
            Some(conn) => conn.close().map_err(|(_, e)| SinkError::Sqlite(e)),
            None => Ok(()),
        }
    }
}

/// MongoDB-backed sink. Writes block on the runtime handle it was opened from,
/// so `append_batch` must be called from outside that runtime's worker threads.
#[derive(Clone)]
pub struct MongoSink {
    handle: Handle,
    packets: Collection<PacketRecord>,
}

impl MongoSink {
    pub async fn connect(uri: &str, database: &str, timeout: Duration) -> Result<Self, SinkError> {
        let mut client_options = ClientOptions::parse(uri).await?;
        client_options.app_name = Some("traffic-analyzer".to_string());
        client_options.server_selection_timeout = Some(timeout);
        client_options.connect_timeout = Some(timeout);
        let client = Client::with_options(client_options)?;
        let db = client.database(database);
        info!("Using MongoDB database {}", database);

        Ok(Self {
            handle: Handle::current(),
            packets: db.collection("packets"),
        })
    }
}

impl PacketSink for MongoSink {
    fn append_batch(&mut self, batch: &[PacketObservation]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let records: Vec<PacketRecord> = batch.iter().map(PacketRecord::from).collect();
        let packets = self.packets.clone();
        self.handle
            .block_on(async move { packets.insert_many(records).await })?;
        Ok(())
    }
}
