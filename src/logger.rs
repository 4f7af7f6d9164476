use std::io;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub verbose: bool,
    pub debug: bool,
    pub json: bool,
}

impl LogOptions {
    /// `RUST_LOG` wins; otherwise warn, info with `--verbose`, debug with `--debug`.
    pub fn directive(&self) -> &'static str {
        if self.debug {
            "testforge=debug"
        } else if self.verbose {
            "testforge=info"
        } else {
            "testforge=warn"
        }
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays clean
/// for run reports.
pub fn init(opts: LogOptions) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.directive()));

    let json = opts
        .json
        .then(|| fmt::layer().json().with_writer(io::stderr));
    let text = (!opts.json).then(|| fmt::layer().with_target(false).with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
}
