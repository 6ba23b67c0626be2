pub use tracing::{self, debug, error, info, trace, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Sets up logging plus a panic hook that records which thread blew up.
///
/// Panics inside a worker thread otherwise die silently with the thread, so
/// the hook logs them before the default unwinding continues.
pub fn setup_log() {
    std::panic::set_hook(Box::new(|info| {
        let thread = std::thread::current();
        error!(
            target: "threadbeam",
            "panic on thread {:?}: {}",
            thread.name().unwrap_or("<unnamed>"),
            info
        );
    }));

    setup_log_no_panic_hook()
}

pub fn setup_log_no_panic_hook() {
    let _ = SubscriberBuilder::default()
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(EnvFilter::from_default_env())
        .finish()
        .try_init();
}
