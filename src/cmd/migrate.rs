//! `conductor migrate` — opens the database, which runs any pending
//! migrations in its constructor, then exits.

use anyhow::Result;

use conductor::storage::Db;

pub fn cmd_migrate(db_path: &std::path::Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Db::open(db_path)?;
    println!("Database at {} is up to date.", db_path.display());
    Ok(())
}
