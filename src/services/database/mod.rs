pub mod adapter;
pub mod sqlite;

pub use adapter::{DatabaseAdapter, DbError, QueryOutput};
pub use sqlite::SqliteAdapter;
