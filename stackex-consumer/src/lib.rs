pub mod api;
pub mod columnar;
pub mod config;
pub mod delivery;
pub mod offsets;
pub mod pipeline;
pub mod pull;
pub mod push;
pub mod storage;
pub mod warehouse;
