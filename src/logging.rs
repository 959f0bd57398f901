//! Log output for test runs.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install a fmt subscriber: DEBUG when `verbose`, INFO otherwise.
///
/// Returns `false` if a global subscriber was already set, which happens
/// when several tests call this; the existing one is kept.
pub fn init(verbose: bool) -> bool {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_test_writer()
        .try_init()
        .is_ok()
}
