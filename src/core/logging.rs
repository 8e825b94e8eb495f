//! Diagnostic logging to stderr.

use tracing_subscriber::EnvFilter;

const LOG_LEVEL_ENV: &str = "CREDMETER_LOG";
const LOG_FORMAT_ENV: &str = "CREDMETER_LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    pub fn from_arg(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "text" => Some(Self::Human),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Filter directive for the subscriber. An explicit `CREDMETER_LOG` value wins;
/// otherwise `warn`, or `debug` with `--verbose`.
fn filter_directive(env_value: Option<&str>, verbose: bool) -> String {
    match env_value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value.to_string(),
        None if verbose => "credmeter=debug".to_string(),
        None => "credmeter=warn".to_string(),
    }
}

pub fn init(verbose: bool) {
    let directive = filter_directive(std::env::var(LOG_LEVEL_ENV).ok().as_deref(), verbose);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("credmeter=warn"));
    let format = std::env::var(LOG_FORMAT_ENV)
        .ok()
        .and_then(|v| LogFormat::from_arg(&v))
        .unwrap_or_default();

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(std::io::stderr)
                .try_init()
                .ok();
        }
        LogFormat::Human => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .try_init()
                .ok();
        }
    }
}
