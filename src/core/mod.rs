pub mod cancel;
pub mod config;
pub mod errors;
pub mod logging;
