pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the cache database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
  File(PathBuf),
  /// Private in-memory database; destroyed with its connection
  Memory,
}

impl Location {
  /// The default database file inside a data directory.
  pub fn in_dir(data_dir: &Path) -> Self {
    Location::File(data_dir.join("cache.db"))
  }
}

/// Database connection wrapper for caching
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database and bring the schema up to date.
  pub fn open(location: &Location) -> Result<Self> {
    let conn = match location {
      Location::File(path) => {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
          std::fs::create_dir_all(parent)
            .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
        }

        let conn = Connection::open(path)
          .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

        conn
          .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
          .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;
        conn
      }
      Location::Memory => Connection::open_in_memory()
        .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?,
    };

    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    conn
      .pragma_update(None, "synchronous", "NORMAL")
      .map_err(|e| eyre!("Failed to set synchronous mode: {}", e))?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Get a reference to the connection
  pub fn conn(&self) -> &Connection {
    &self.conn
  }
}

/// Delete a database file together with its WAL and shared-memory companions.
pub fn remove_files(path: &Path) -> Result<()> {
  let mut companions = vec![path.to_path_buf()];
  for suffix in ["-wal", "-shm"] {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    companions.push(PathBuf::from(name));
  }

  for file in companions {
    match std::fs::remove_file(&file) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(eyre!("Failed to remove {}: {}", file.display(), e)),
    }
  }
  Ok(())
}
