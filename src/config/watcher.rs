//! Hot reload of the config file.
//!
//! # Design Decisions
//! - The parent directory is watched, since editors often replace a file
//!   rather than write it in place
//! - A reload is sent only when the file's text changed and still parses;
//!   a broken edit keeps the running settings

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::parse_config;
use crate::config::schema::ServerConfig;

/// Poll period for backends without native file events.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Sends a fresh [`ServerConfig`] whenever the watched file changes.
///
/// Only the access-log capture toggles are applied to a running component;
/// see [`AccessLogCapture::follow`](crate::config::AccessLogCapture::follow).
pub struct ConfigWatcher {
    reloader: Reloader,
    updates: mpsc::UnboundedSender<ServerConfig>,
}

impl ConfigWatcher {
    /// Watcher for the table at `key` of `path`, and the stream of reloads.
    pub fn new(path: &Path, key: &str) -> (Self, mpsc::UnboundedReceiver<ServerConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            reloader: Reloader::new(path, key),
            updates,
        };
        (watcher, rx)
    }

    /// Start watching. Dropping the returned handle stops it.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { mut reloader, updates } = self;
        let file = reloader.path.clone();
        let dir = watch_dir(&file);
        tracing::info!(path = %file.display(), key = %reloader.key, "Config watcher started");

        let handler = {
            let file = file.clone();
            move |res: notify::Result<Event>| match res {
                Ok(event) if touches(&event, &file) => {
                    if let Some(config) = reloader.reload() {
                        if updates.send(config).is_err() {
                            tracing::debug!("Config reload dropped, nobody follows updates");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "Config watch error"),
            }
        };

        let mut watcher = RecommendedWatcher::new(handler, Config::default().with_poll_interval(POLL_INTERVAL))?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}

fn watch_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Whether `event` writes or replaces `file`.
fn touches(event: &Event, file: &Path) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event.paths.iter().any(|p| p.file_name() == file.file_name())
}

/// Re-reads the file, remembering the last text it saw.
struct Reloader {
    path: PathBuf,
    key: String,
    last: Option<String>,
}

impl Reloader {
    fn new(path: &Path, key: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            key: key.to_string(),
            last: fs::read_to_string(path).ok(),
        }
    }

    fn reload(&mut self) -> Option<ServerConfig> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "Config file unreadable, keeping current settings");
                return None;
            }
        };
        if self.last.as_deref() == Some(text.as_str()) {
            return None;
        }
        let parsed = parse_config(&text, &self.key);
        self.last = Some(text);

        match parsed {
            Ok(config) => {
                tracing::info!(path = %self.path.display(), "Config file changed");
                Some(config)
            }
            Err(err) => {
                tracing::error!(path = %self.path.display(), error = %err, "Config reload rejected, keeping current settings");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, EventKind};

    fn temp_file(name: &str, text: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("rest-server-{}-{name}.toml", std::process::id()));
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn reload_sends_only_changed_valid_text() {
        let path = temp_file("reload", "[server.http]\nport = 9001\n");
        let mut reloader = Reloader::new(&path, "server.http");
        assert!(reloader.reload().is_none(), "unchanged text");

        fs::write(&path, "[server.http]\nport = 9001\nenable_access_interceptor_res = true\n").unwrap();
        let config = reloader.reload().unwrap();
        assert!(config.access_log_capture.load().response_body);

        fs::write(&path, "[server.http]\nnetwork = \"udp\"\n").unwrap();
        assert!(reloader.reload().is_none(), "invalid config is rejected");

        fs::write(&path, "[server.http]\nport = 9002\n").unwrap();
        assert_eq!(reloader.reload().unwrap().port, 9002);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn events_match_by_file_name() {
        let file = Path::new("/etc/app/server.toml");
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/etc/app/server.toml"));
        assert!(touches(&event, file));

        let other = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/etc/app/other.toml"));
        assert!(!touches(&other, file));
        assert_eq!(watch_dir(Path::new("server.toml")), PathBuf::from("."));
    }
}
