//! Structured logging for the scheduler crate.
//!
//! Histogram/metrics emission is a product-surface concern this crate
//! does not expose; only the logging subscriber setup lives here.

mod logging;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
