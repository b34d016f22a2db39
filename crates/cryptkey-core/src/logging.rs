//! Diagnostic logging for the keyscript.
//!
//! Everything goes to stderr. Stdout is reserved for the passphrase, which cryptsetup
//! reads verbatim, so nothing in this crate may log to it.

use env_logger::{Builder, Env, Target};
use std::io::Write;

/// Install the global logger with `default_level` unless `RUST_LOG` says otherwise.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_level: &str) {
    let env = Env::default().default_filter_or(default_level);
    let _ = Builder::from_env(env)
        .target(Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "cryptkey: {} {}",
                record.level(),
                record.args()
            )
        })
        .try_init();
}

/// Pick the default filter for the verbose toggle.
pub fn level_for(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}
