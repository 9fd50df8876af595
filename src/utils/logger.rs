use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::Write;

/// Initialise `env_logger` with the crate's line format.
///
/// `level` is the default filter; `RUST_LOG` still takes precedence for
/// individual modules.
pub fn setup_logging(level: LevelFilter) {
    let mut builder = Builder::new();

    builder
        .target(Target::Stderr)
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] [{}:{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        });

    // A second initialisation (tests, embedding) is not an error for us.
    let _ = builder.try_init();
}
