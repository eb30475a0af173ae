// PostgreSQL plumbing used by `Database`:
// - config: connection/pool settings and where they come from
// - manager: bb8 connection manager (plain or TLS)
// - params: native wire values and their `ToSql` binding
// - query: statement execution on a client and row value extraction

pub mod config;
pub mod manager;
pub mod params;
pub mod query;

pub use config::{ConfigSource, PostgresConfig, SslMode};
pub use manager::{PgConnection, PgManager};
pub use params::SqlValue;
pub use query::extract_value;
