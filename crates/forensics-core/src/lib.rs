pub mod config;
pub mod error;
pub mod stats;
pub mod types;

pub use config::*;
pub use error::*;
pub use types::*;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
