pub mod core;
pub mod logging;
