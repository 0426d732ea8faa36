pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod redis_pool;
pub mod types;
