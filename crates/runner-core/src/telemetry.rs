//! Tracing subscriber setup (§4.9).
//!
//! A standard `tracing_subscriber` setup: an `EnvFilter`
//! defaulting to `info`, overridable via `RUST_LOG`, with a compact
//! formatter. Library code in this crate never installs a subscriber on
//! its own -- `init_tracing` is meant to be called exactly once, from the
//! binary's `main()`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();
}
