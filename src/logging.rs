//! Log setup for embedders and the command line tool

use crate::config::LogLevel;
use tracing::level_filters::LevelFilter;

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Silent => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
        }
    }
}

/// Install a global fmt subscriber at `level`
///
/// `Silent` installs nothing. Returns false when nothing was installed,
/// including when another global subscriber is already in place.
pub fn init(level: LogLevel) -> bool {
    if level == LogLevel::Silent {
        return false;
    }
    tracing_subscriber::fmt()
        .with_max_level(level.as_filter())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filters() {
        assert_eq!(LogLevel::Silent.as_filter(), LevelFilter::OFF);
        assert_eq!(LogLevel::Debug.as_filter(), LevelFilter::DEBUG);
        assert!(LogLevel::Warn.as_filter() < LogLevel::Info.as_filter());
    }

    #[test]
    fn test_silent_and_repeated_init() {
        assert!(!init(LogLevel::Silent));
        init(LogLevel::Info);
        assert!(!init(LogLevel::Debug));
    }
}
