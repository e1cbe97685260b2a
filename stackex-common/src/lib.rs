pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod partition;
pub mod record;
pub mod schema;
pub mod time;
