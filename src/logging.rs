//! Log setup for the queue binary: `<ts>  <LEVEL>  <target>  <message>` on stderr,
//! with the crate prefix stripped from targets. stdout is reserved for events.

use std::io::Write;

use log::LevelFilter;

const TARGET_PREFIX: &str = "vidconvert::";

/// Target as printed: `vidconvert::step::runner` -> `step::runner`.
pub fn short_target(target: &str) -> &str {
    target
        .strip_prefix(TARGET_PREFIX)
        .or_else(|| target.strip_prefix("vidconvert_core::"))
        .unwrap_or(target)
}

fn default_level(verbose: bool) -> LevelFilter {
    if verbose {
        return LevelFilter::Trace;
    }
    #[cfg(debug_assertions)]
    {
        LevelFilter::Debug
    }
    #[cfg(not(debug_assertions))]
    {
        LevelFilter::Info
    }
}

/// Installs the global logger. `RUST_LOG` overrides the default level.
/// Calling it twice is harmless.
pub fn init(verbose: bool) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(default_level(verbose))
        .target(env_logger::Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "{ts}  {level:5}  {target}  {message}",
                ts = buf.timestamp_seconds(),
                level = record.level(),
                target = short_target(record.target()),
                message = record.args()
            )
        });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let _ = builder.try_init();
}
