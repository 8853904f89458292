//! Tether persistence: SQLite store for canonical state, keyed by the caller's
//! local address. Keeps a short history per address; small and synchronous.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tether_core::CanonicalState;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub address: String,
    pub kind: String,
    /// Milliseconds since epoch.
    pub ts: i64,
    pub state: CanonicalState,
}

pub trait Store {
    fn put_state(&self, address: &str, kind: &str, state: &CanonicalState) -> Result<()>;
    /// Newest first.
    fn get_state(&self, address: &str, limit: Option<usize>) -> Result<Vec<StoredState>>;
    /// Drop every row for `address`; returns how many were removed.
    fn forget(&self, address: &str) -> Result<usize>;
    /// `(address, kind)` of every stored resource, sorted by address.
    fn addresses(&self) -> Result<Vec<(String, String)>>;

    fn latest(&self, address: &str) -> Result<Option<StoredState>> {
        Ok(self.get_state(address, Some(1))?.into_iter().next())
    }
}

/// SQLite-backed store. The CLI isn't latency sensitive here.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
    history: usize,
}

fn history_from_env() -> usize {
    std::env::var("TETHER_STATE_HISTORY").ok().and_then(|s| s.parse().ok()).filter(|n| *n > 0).unwrap_or(3)
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("TETHER_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_history(path, history_from_env())
    }

    pub fn open_with_history(path: &str, history: usize) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS canonical_state (
                address TEXT NOT NULL,
                kind    TEXT NOT NULL,
                token   TEXT NOT NULL,
                ts      INTEGER NOT NULL,
                state   BLOB NOT NULL
            )",
            [],
        ).context("creating canonical_state table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_canonical_state_addr_ts ON canonical_state(address, ts DESC)",
            [],
        ).ok();
        let me = Self { db: std::sync::Mutex::new(db), history: history.max(1) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, history = me.history, "persist: opened");
        Ok(me)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for SqliteStore {
    fn put_state(&self, address: &str, kind: &str, state: &CanonicalState) -> Result<()> {
        let started = std::time::Instant::now();
        let blob = maybe_compress(&serde_json::to_string(state).context("serializing canonical state")?);
        let mut db = self.conn();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO canonical_state(address, kind, token, ts, state) VALUES (?1, ?2, ?3, ?4, ?5)",
            (address, kind, state.identity.as_str(), now_ts_ms(), &blob),
        )?;
        // Keep the newest `history` rows per address
        tx.execute(
            "DELETE FROM canonical_state
             WHERE address = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM canonical_state WHERE address = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (address, self.history as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn get_state(&self, address: &str, limit: Option<usize>) -> Result<Vec<StoredState>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(self.history);
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT kind, ts, state FROM canonical_state WHERE address = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((address, cap as i64))?;
        let mut out: Vec<StoredState> = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let ts: i64 = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            let state: CanonicalState = serde_json::from_str(&maybe_decompress(&blob))
                .with_context(|| format!("decoding stored state for {}", address))?;
            out.push(StoredState { address: address.to_string(), kind, ts, state });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn forget(&self, address: &str) -> Result<usize> {
        let n = self.conn().execute("DELETE FROM canonical_state WHERE address = ?1", [address])?;
        counter!("persist_forget_total", 1u64);
        Ok(n)
    }

    fn addresses(&self) -> Result<Vec<(String, String)>> {
        let db = self.conn();
        // Kind of the newest row wins if an address was reused for another kind.
        let mut stmt = db.prepare(
            "SELECT address, kind FROM canonical_state c
             WHERE rowid = (SELECT rowid FROM canonical_state WHERE address = c.address ORDER BY ts DESC, rowid DESC LIMIT 1)
             ORDER BY address",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".tether");
        let _ = std::fs::create_dir_all(&p);
        p.push("tether.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "tether.db".to_string()
}

pub fn now_ts_ms() -> i64 { chrono::Utc::now().timestamp_millis() }

pub fn maybe_compress(json: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("TETHER_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(json.as_bytes(), lvl).unwrap_or_else(|_| json.as_bytes().to_vec());
    }
    json.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
