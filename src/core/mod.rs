pub mod config;
pub mod optimizer;
pub mod tls;
