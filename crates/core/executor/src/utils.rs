use std::sync::Once;

use strum_macros::{Display, EnumString};
use tracing_forest::ForestLayer;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

static INIT: Once = Once::new();

/// The filter used when `RUST_LOG` is unset: halts and refused loads only.
const DEFAULT_FILTER: &str = "off,ldc_core_executor=warn,ldc_primitives=warn";

/// How log lines are rendered, selected by `RUST_LOGGER`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LoggerType {
    /// One compact line per event, with span timings on close.
    #[default]
    Flat,
    /// A tree of the spans of each load.
    Forest,
}

/// The filter for the loader's log output: `RUST_LOG` if it is set and valid, otherwise warnings
/// from the loader crates only.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber once.
///
/// Set `RUST_LOG=ldc_core_executor=debug` to follow every load phase, and `RUST_LOGGER=forest`
/// to group them under their `load` span.
pub fn setup_logger() {
    INIT.call_once(|| {
        let logger_type = match std::env::var("RUST_LOGGER") {
            Ok(value) => value
                .parse::<LoggerType>()
                .unwrap_or_else(|_| panic!("Invalid logger type: {value}")),
            Err(_) => LoggerType::default(),
        };

        match logger_type {
            LoggerType::Forest => {
                Registry::default().with(env_filter()).with(ForestLayer::default()).init();
            }
            LoggerType::Flat => {
                tracing_subscriber::fmt::Subscriber::builder()
                    .compact()
                    .with_target(false)
                    .with_env_filter(env_filter())
                    .with_span_events(FmtSpan::CLOSE)
                    .finish()
                    .init();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_type_names() {
        assert_eq!("forest".parse::<LoggerType>(), Ok(LoggerType::Forest));
        assert_eq!("flat".parse::<LoggerType>(), Ok(LoggerType::Flat));
        assert!("tree".parse::<LoggerType>().is_err());
        assert_eq!(LoggerType::default().to_string(), "flat");
    }

    #[test]
    fn test_default_filter_targets_loader_crates() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
        let targets = DEFAULT_FILTER.split(',').filter_map(|d| d.split_once('=')).collect::<Vec<_>>();
        assert_eq!(targets, [("ldc_core_executor", "warn"), ("ldc_primitives", "warn")]);
    }

    #[test]
    fn test_setup_logger_is_idempotent() {
        setup_logger();
        setup_logger();
        tracing::warn!("logger installed");
    }
}
