//! Clipboard relay
//!
//! Applies remote text locally and forwards local changes as
//! `clipboard.update`, suppressing the echo of what we just applied.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::env;
use std::error::Error;
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardError(pub String);

impl fmt::Display for ClipboardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Clipboard error: {}", self.0)
    }
}

impl Error for ClipboardError {}

/// Local clipboard access
pub trait ClipboardBackend: Send + Sync {
    fn get_text(&self) -> Result<Option<String>, ClipboardError>;
    fn set_text(&self, text: &str) -> Result<(), ClipboardError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Xclip,
    WlClipboard,
}

/// System clipboard through wl-clipboard or xclip
pub struct CommandClipboard {
    tool: Tool,
}

impl CommandClipboard {
    /// Pick the tool matching the session; `None` when neither is installed
    pub fn detect() -> Option<Self> {
        let session = env::var("XDG_SESSION_TYPE").unwrap_or_default().to_ascii_lowercase();
        let wayland_display = env::var("WAYLAND_DISPLAY").unwrap_or_default();
        if (!wayland_display.is_empty() || session == "wayland") && has_command("wl-copy") {
            return Some(Self {
                tool: Tool::WlClipboard,
            });
        }
        if has_command("xclip") {
            return Some(Self { tool: Tool::Xclip });
        }
        None
    }
}

impl ClipboardBackend for CommandClipboard {
    fn get_text(&self) -> Result<Option<String>, ClipboardError> {
        let mut cmd = match self.tool {
            Tool::WlClipboard => {
                let mut cmd = Command::new("wl-paste");
                cmd.args(["--no-newline", "--type", "text/plain"]);
                cmd
            }
            Tool::Xclip => {
                let mut cmd = Command::new("xclip");
                cmd.args(["-selection", "clipboard", "-o", "-t", "UTF8_STRING"]);
                cmd
            }
        };
        let output = cmd
            .stderr(Stdio::null())
            .output()
            .map_err(|e| ClipboardError(e.to_string()))?;
        // Both tools exit non-zero on an empty clipboard
        if !output.status.success() {
            return Ok(None);
        }
        Ok(String::from_utf8(output.stdout).ok())
    }

    fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut cmd = match self.tool {
            Tool::WlClipboard => {
                let mut cmd = Command::new("wl-copy");
                cmd.args(["--type", "text/plain"]);
                cmd
            }
            Tool::Xclip => {
                let mut cmd = Command::new("xclip");
                cmd.args(["-selection", "clipboard", "-i"]);
                cmd
            }
        };
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| ClipboardError(format!("{:?} spawn failed: {}", self.tool, e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| ClipboardError(format!("{:?} write failed: {}", self.tool, e)))?;
        }
        let status = child.wait().map_err(|e| ClipboardError(e.to_string()))?;
        if !status.success() {
            return Err(ClipboardError(format!("{:?} exited with {}", self.tool, status)));
        }
        Ok(())
    }
}

fn has_command(cmd: &str) -> bool {
    Command::new("sh")
        .arg("-lc")
        .arg(format!("command -v {} >/dev/null 2>&1", cmd))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Process-local clipboard, for headless hosts and tests
#[derive(Default)]
pub struct MemoryClipboard {
    text: Mutex<String>,
}

impl MemoryClipboard {
    pub fn contents(&self) -> String {
        self.text.lock().clone()
    }
}

impl ClipboardBackend for MemoryClipboard {
    fn get_text(&self) -> Result<Option<String>, ClipboardError> {
        let text = self.text.lock();
        Ok(if text.is_empty() { None } else { Some(text.clone()) })
    }

    fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        *self.text.lock() = text.to_string();
        Ok(())
    }
}

pub struct ClipboardSync {
    backend: Arc<dyn ClipboardBackend>,
    last_text: Mutex<String>,
}

impl ClipboardSync {
    pub fn new(backend: Arc<dyn ClipboardBackend>) -> Self {
        Self {
            backend,
            last_text: Mutex::new(String::new()),
        }
    }

    /// Apply text received from the viewer
    pub fn apply_remote(&self, text: &str) -> Result<(), ClipboardError> {
        *self.last_text.lock() = text.to_string();
        self.backend.set_text(text)?;
        debug!("Clipboard set from remote ({} chars)", text.chars().count());
        Ok(())
    }

    /// Local text that changed since the last poll or remote apply
    pub fn poll_change(&self) -> Option<String> {
        let current = match self.backend.get_text() {
            Ok(Some(text)) if !text.is_empty() => text,
            Ok(_) => return None,
            Err(e) => {
                debug!("Clipboard read failed: {}", e);
                return None;
            }
        };
        let mut last = self.last_text.lock();
        if *last == current {
            return None;
        }
        *last = current.clone();
        Some(current)
    }

    /// Forward local changes to `updates` every `interval`
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration, updates: mpsc::UnboundedSender<String>) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        info!("Clipboard poller started ({:?})", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let poll = Arc::clone(&sync);
                let change = match tokio::task::spawn_blocking(move || poll.poll_change()).await {
                    Ok(change) => change,
                    Err(e) => {
                        warn!("Clipboard poll task failed: {}", e);
                        continue;
                    }
                };
                if let Some(text) = change {
                    if updates.send(text).is_err() {
                        break;
                    }
                }
            }
            debug!("Clipboard poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_text_is_not_echoed() {
        let backend = Arc::new(MemoryClipboard::default());
        let sync = ClipboardSync::new(backend.clone());
        sync.apply_remote("from viewer").expect("set");
        assert_eq!(backend.contents(), "from viewer");
        assert_eq!(sync.poll_change(), None);
    }

    #[test]
    fn local_changes_are_reported_once() {
        let backend = Arc::new(MemoryClipboard::default());
        let sync = ClipboardSync::new(backend.clone());
        assert_eq!(sync.poll_change(), None);

        backend.set_text("copied").expect("set");
        assert_eq!(sync.poll_change(), Some("copied".to_string()));
        assert_eq!(sync.poll_change(), None);
    }

    #[tokio::test]
    async fn poller_forwards_changes() {
        let backend = Arc::new(MemoryClipboard::default());
        let sync = Arc::new(ClipboardSync::new(backend.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = sync.spawn_poller(Duration::from_millis(10), tx);

        backend.set_text("hello").expect("set");
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("in time");
        assert_eq!(text.as_deref(), Some("hello"));
        poller.abort();
    }
}
