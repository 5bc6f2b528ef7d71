//! Internal helpers re-exported for integration tests.

mod logging;

pub use logging::{capture_debug_logs, capture_logs, capture_warn_logs};
