use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;

const DEFAULT_LOG_FILE: &str = "chatbot.log";

/// Console layer always; a plain-text file layer when `log_file` is set.
/// RUST_LOG 优先，其次 LOG_LEVEL
pub fn init(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("chatbot_server={level},rocket={level}", level = config.log_level).into()
    });

    let (appender, file_error) = match config.log_file.as_deref().map(open_log_file) {
        Some(Ok(appender)) => (Some(appender), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let file_layer = appender.map(|appender| fmt::layer().with_writer(appender).with_ansi(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    // 文件打不开时只写控制台，不影响启动
    if let Some(e) = file_error {
        warn!(path = ?config.log_file, "cannot open log file, logging to console only: {e}");
    }
}

/// Opens (appending) the log file; it is never rotated.
pub fn open_log_file(path: &Path) -> Result<RollingFileAppender, InitError> {
    let (dir, name) = split_log_path(path);
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
}

/// 拆成目录 + 文件名；裸文件名落在当前目录
fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string());
    (dir, name)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn bare_file_name_goes_to_current_dir() {
        assert_eq!(
            split_log_path(Path::new("chatbot.log")),
            (PathBuf::from("."), "chatbot.log".to_string())
        );
        assert_eq!(
            split_log_path(Path::new("/var/log/bot/server.log")),
            (PathBuf::from("/var/log/bot"), "server.log".to_string())
        );
    }

    #[test]
    fn log_file_is_created_with_the_exact_name() {
        let dir = std::env::temp_dir().join(format!("chatbot-server-logs-{}", std::process::id()));
        let path = dir.join("chatbot.log");

        let mut appender = open_log_file(&path).unwrap();
        appender.write_all(b"line\n").unwrap();
        appender.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
        std::fs::remove_dir_all(dir).ok();
    }
}
