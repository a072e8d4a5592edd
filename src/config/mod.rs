//! Key-value settings storage backed by SQLite.
//!
//! Settings resolve in order: command-line flag, stored value, built-in
//! default. See [`Config::resolve`].

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use rusqlite::Connection;

use crate::consts::{DEFAULT_CATALOG, DEFAULT_ENDPOINT};

/// Settings the CLI knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    Backend,
    Model,
    Endpoint,
    Catalog,
}

impl Setting {
    pub const ALL: [Setting; 4] = [Setting::Backend, Setting::Model, Setting::Endpoint, Setting::Catalog];

    pub fn key(self) -> &'static str {
        match self {
            Setting::Backend => "backend",
            Setting::Model => "model",
            Setting::Endpoint => "endpoint",
            Setting::Catalog => "catalog",
        }
    }

    /// Built-in default, if the setting has one. The model default depends
    /// on the backend and is chosen by the caller.
    pub fn default_value(self) -> Option<&'static str> {
        match self {
            Setting::Backend => Some("engine"),
            Setting::Model => None,
            Setting::Endpoint => Some(DEFAULT_ENDPOINT),
            Setting::Catalog => Some(DEFAULT_CATALOG),
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Setting {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match Setting::ALL.into_iter().find(|setting| setting.key() == s) {
            Some(setting) => Ok(setting),
            None => {
                let known: Vec<&str> = Setting::ALL.iter().map(|s| s.key()).collect();
                bail!("unknown setting '{s}' (known: {})", known.join(", "))
            }
        }
    }
}

/// Persistent key-value settings store.
pub struct Config {
    conn: Mutex<Connection>,
}

impl Config {
    /// Open or create the config table in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open config database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .context("failed to create config table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get a config value by key.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM config WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a config value (upsert).
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Remove a config key.
    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(())
    }

    /// Every stored key and value, sorted by key.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read settings")
    }

    /// Flag value if given, else the stored value, else the default.
    pub fn resolve(&self, setting: Setting, flag: Option<&str>) -> Result<Option<String>> {
        if let Some(value) = flag {
            return Ok(Some(value.to_string()));
        }
        if let Some(value) = self.get(setting.key())? {
            return Ok(Some(value));
        }
        Ok(setting.default_value().map(String::from))
    }
}
