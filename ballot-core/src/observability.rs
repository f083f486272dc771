//! Tracing setup and span helpers
//!
//! The library only emits `tracing` events. Binaries and tests choose the
//! subscriber; [`init_tracing`] is the stock one.

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::DEFAULT_LOG_FILTER;

/// Initialize tracing. `RUST_LOG` wins over `default_filter` when set.
pub fn init_tracing(default_filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.unwrap_or(DEFAULT_LOG_FILTER)));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // A second call (e.g. from several tests) keeps the first subscriber
    let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
}

/// Create a span for a Raft operation
#[inline]
pub fn raft_span(operation: &str, node_id: &str) -> Span {
    tracing::debug_span!(
        "raft",
        operation = %operation,
        node_id = %node_id,
        term = tracing::field::Empty,
        index = tracing::field::Empty,
    )
}

/// Create a span for a storage operation
#[inline]
pub fn storage_span(operation: &str, node_id: &str) -> Span {
    tracing::debug_span!(
        "storage",
        operation = %operation,
        node_id = %node_id,
        entries = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_raft_span_records_fields() {
        let span = raft_span("append", "raft-1");
        span.record("term", 3u64);
        let _enter = span.enter();
        tracing::info!("inside raft span");

        assert!(logs_contain("inside raft span"));
        assert!(logs_contain("raft-1"));
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(Some("ballot_core=debug"));
        init_tracing(None);
    }
}
