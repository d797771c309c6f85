//! `tracing` initialization: env-filter plus a pretty or JSON formatter.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogFormat;

pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            fmt().with_env_filter(filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().with_env_filter(filter).json().init();
        }
    }
}
