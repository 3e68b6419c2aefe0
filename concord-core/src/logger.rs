use slog::{Drain, Logger};

/// Builds the process-wide root logger: an async, non-blocking drain over a
/// term decorator. Every node- or role-specific logger is a child of this
/// one via `logger.new(o!(...))`, never a fresh root.
pub fn get_root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_logger() {
        let log = get_root_logger();
        slog::info!(log, "logger smoke test");
    }
}
