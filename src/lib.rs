pub mod app;
pub mod cache;
pub mod clock;
pub mod configure;
pub mod error;
pub mod filter;
pub mod id_gen;
pub mod lock;
pub mod logger;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod seckill;
pub mod store;
