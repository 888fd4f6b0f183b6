//! SQLite persistence for Weft.
//!
//! [`SqliteCheckpointer`] implements the [`Checkpointer`](weft_graph::Checkpointer)
//! trait on a local database file, so threads survive process restarts.
//!
//! ```rust,no_run
//! use weft_sqlite::SqliteCheckpointer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cp = SqliteCheckpointer::new("/var/lib/weft/checkpoints.db")?;
//! # Ok(())
//! # }
//! ```

mod checkpointer;

pub use checkpointer::SqliteCheckpointer;
pub use weft_graph::Checkpointer;
