pub mod approvals;
pub mod database;
pub mod error;
pub mod journal;
pub mod row_helpers;
pub mod runs;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
