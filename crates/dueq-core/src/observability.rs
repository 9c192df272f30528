//! Tracing/logging initialization.
//!
//! `RUST_LOG` で出力レベルを変更できます（デフォルト `info`）。

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// `json = true` for structured logs (collectors), otherwise human-readable.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
