//! Logging configuration with optional file rotation
//!
//! The client itself only emits `tracing` events; hosts that do not install
//! their own subscriber can call [`init_logging`] with a [`LogConfig`].

use crate::error::{LoxoneError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level
    pub level: Level,

    /// Log to file (rotated daily)
    pub file_path: Option<PathBuf>,

    /// Log to stderr
    pub stderr: bool,

    /// Include timestamps
    pub timestamps: bool,

    /// Include thread IDs
    pub thread_ids: bool,

    /// Include spans
    pub spans: FmtSpan,

    /// Emit JSON lines instead of human readable text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_path: None,
            stderr: true,
            timestamps: true,
            thread_ids: false,
            spans: FmtSpan::NONE,
            json: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(rust_log) = std::env::var("RUST_LOG") {
            if rust_log.contains("trace") {
                config.level = Level::TRACE;
            } else if rust_log.contains("debug") {
                config.level = Level::DEBUG;
            } else if rust_log.contains("info") {
                config.level = Level::INFO;
            } else if rust_log.contains("warn") {
                config.level = Level::WARN;
            } else if rust_log.contains("error") {
                config.level = Level::ERROR;
            }
        }

        if let Ok(log_file) = std::env::var("LOXONE_LOG_FILE") {
            config.file_path = Some(PathBuf::from(log_file));
        }

        if let Ok(log_stderr) = std::env::var("LOXONE_LOG_STDERR") {
            config.stderr = log_stderr.to_lowercase() != "false";
        }

        if let Ok(log_json) = std::env::var("LOXONE_LOG_JSON") {
            config.json = log_json.to_lowercase() == "true";
        }

        config
    }
}

fn fmt_layer<W>(writer: W, ansi: bool, config: &LogConfig) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(config.thread_ids)
        .with_span_events(config.spans.clone());

    match (config.json, config.timestamps) {
        (true, true) => layer.json().boxed(),
        (true, false) => layer.json().without_time().boxed(),
        (false, true) => layer.boxed(),
        (false, false) => layer.without_time().boxed(),
    }
}

/// Initialize logging with the given configuration
pub fn init_logging(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.stderr {
        layers.push(fmt_layer(std::io::stderr, true, &config));
    }

    if let Some(file_path) = &config.file_path {
        let directory = file_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(directory)?;

        let file_appender = tracing_appender::rolling::daily(
            directory,
            file_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("loxone-ws.log")),
        );
        layers.push(fmt_layer(file_appender, false, &config));
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(env_filter);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| LoxoneError::config(format!("Failed to install log subscriber: {e}")))
}

static SECRET_SEGMENTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(/?(?:jdev/sys/)?(?:keyexchange|getjwt|gettoken|authwithtoken|refreshjwt|refreshtoken|checktoken|killtoken|enc)/)([^/]+)",
    )
    .expect("secret segment pattern is valid")
});

static SECURED_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/?jdev/sps/ios/)([^/]+)").expect("secured pattern is valid"));

/// Redact hashes, tokens and ciphertexts from a command before it is logged
pub fn sanitize_command(command: &str) -> String {
    let redacted = SECRET_SEGMENTS.replace(command, "${1}***");
    SECURED_COMMAND.replace(&redacted, "${1}***").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serial_test::serial;

    #[rstest]
    #[case("jdev/sys/getjwt/ABCDEF/admin/2/uuid/client", "jdev/sys/getjwt/***/admin/2/uuid/client")]
    #[case("authwithtoken/0011aa/admin", "authwithtoken/***/admin")]
    #[case("jdev/sys/enc/c2VjcmV0", "jdev/sys/enc/***")]
    #[case("jdev/sys/keyexchange/Zm9v", "jdev/sys/keyexchange/***")]
    #[case("jdev/sys/killtoken/tok/admin", "jdev/sys/killtoken/***/admin")]
    #[case("jdev/sps/ios/abcd/0f1e-uuid/On", "jdev/sps/ios/***/0f1e-uuid/On")]
    #[case("jdev/sps/io/0f1e-uuid/On", "jdev/sps/io/0f1e-uuid/On")]
    #[case("keepalive", "keepalive")]
    fn test_sanitize_command(#[case] command: &str, #[case] expected: &str) {
        assert_eq!(sanitize_command(command), expected);
    }

    #[test]
    #[serial]
    fn test_log_config_from_env() {
        temp_env::with_vars(
            [
                ("RUST_LOG", Some("loxone_ws=debug")),
                ("LOXONE_LOG_FILE", Some("/tmp/loxone/ws.log")),
                ("LOXONE_LOG_STDERR", Some("false")),
                ("LOXONE_LOG_JSON", Some("true")),
            ],
            || {
                let config = LogConfig::from_env();
                assert_eq!(config.level, Level::DEBUG);
                assert_eq!(config.file_path, Some(PathBuf::from("/tmp/loxone/ws.log")));
                assert!(!config.stderr);
                assert!(config.json);
            },
        );
    }
}
