//! Shared test utilities.

/// Route `log` output through the test harness; honors `RUST_LOG`.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
