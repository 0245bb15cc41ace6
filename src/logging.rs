//! Logging init helper, matching the reference crate's own `init_logger`-style entry point.

/// Initializes `env_logger` with an `info` default filter. Safe to call more than once (from
/// multiple test binaries, for example) — a "logger already initialized" error is swallowed.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}
