pub mod engine;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod server;
pub mod sql;
pub mod validation;
pub mod wal;
pub mod wire;
