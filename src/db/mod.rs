pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Database connection wrapper for the offline mutation queue
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection. Never hold the guard across an `.await`.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}
