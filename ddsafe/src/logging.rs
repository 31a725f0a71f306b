//! Tracing subscriber setup for the `ddsafe` binary.
//!
//! Events go to stderr so they never interleave with the progress bars and
//! the outcome report on stdout. `RUST_LOG` overrides the level chosen here.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct LogConfig {
    /// One JSON object per event, for log collectors.
    pub json: bool,
    /// Debug level instead of warnings only.
    pub verbose: bool,
}

fn default_filter(config: LogConfig) -> String {
    let level = if config.verbose { Level::DEBUG } else { Level::WARN };
    let level = level.as_str().to_lowercase();
    format!("ddsafe={level},ddsafe_core={level}")
}

pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_by_default() {
        assert_eq!(
            default_filter(LogConfig::default()),
            "ddsafe=warn,ddsafe_core=warn"
        );
    }

    #[test]
    fn verbose_enables_debug() {
        let config = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert_eq!(default_filter(config), "ddsafe=debug,ddsafe_core=debug");
    }
}
