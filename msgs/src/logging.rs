use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
    Trace,
}

impl Verbosity {
    /// Maps a repeated `-v` flag count onto a level.
    pub fn from_occurrences(count: u8) -> Verbosity {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Verbose,
            _ => Verbosity::Trace,
        }
    }

    pub fn as_level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::ERROR,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Verbose => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the verbosity.
/// Logs go to stderr so stdout stays free for the console.
pub fn init_logging(verbosity: Verbosity) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(verbosity.as_level_filter().into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .with_writer(std::io::stderr);

    // a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_count_maps_to_levels() {
        assert_eq!(Verbosity::from_occurrences(0).as_level_filter(), LevelFilter::INFO);
        assert_eq!(Verbosity::from_occurrences(1).as_level_filter(), LevelFilter::DEBUG);
        assert_eq!(Verbosity::from_occurrences(7).as_level_filter(), LevelFilter::TRACE);
    }

    #[test]
    fn init_twice_is_harmless() {
        init_logging(Verbosity::Quiet);
        init_logging(Verbosity::Verbose);
    }
}
