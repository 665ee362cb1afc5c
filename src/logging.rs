use tracing::{Dispatch, Level};

/// A formatting subscriber at DEBUG when `debug` is set, INFO otherwise.
///
/// Nothing is installed globally; callers scope it with `tracing::dispatcher::with_default`.
#[inline]
#[must_use]
pub fn dispatch(debug: bool) -> Dispatch {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .finish();
    Dispatch::new(subscriber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_follows_flag() {
        tracing::dispatcher::with_default(&dispatch(false), || {
            assert!(tracing::enabled!(Level::INFO));
            assert!(!tracing::enabled!(Level::DEBUG));
        });
        tracing::dispatcher::with_default(&dispatch(true), || {
            assert!(tracing::enabled!(Level::DEBUG));
            assert!(!tracing::enabled!(Level::TRACE));
        });
    }
}
