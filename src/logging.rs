//! Stderr logging for cooperating workers.
//!
//! Progress lines go through the `log` facade. `Job::log` stamps each
//! record's target with its `worker <w> round <r>` tag, and the formatter
//! prints seconds since startup, the level, and that tag, so output from
//! several attached workers stays attributable when stderr interleaves.

use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Target prefix marking records that carry a job tag (see `Job::log`).
pub(crate) const JOB_TARGET_PREFIX: &str = "job::";

/// Initialize the logger. Verbose lifts the level from Info to Debug;
/// `RUST_LOG` still overrides per-module filters.
pub fn init_logger(verbose: bool) {
    START_TIME.set(Instant::now()).ok();

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format(|buf, record| {
            let elapsed = START_TIME
                .get()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            match record.target().strip_prefix(JOB_TARGET_PREFIX) {
                Some(tag) => writeln!(
                    buf,
                    "{:8.1}s {} [{}] {}",
                    elapsed,
                    record.level(),
                    tag,
                    record.args()
                ),
                None => writeln!(buf, "{:8.1}s {} {}", elapsed, record.level(), record.args()),
            }
        })
        .target(env_logger::Target::Stderr)
        .init();
}
