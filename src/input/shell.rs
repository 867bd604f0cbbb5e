//! Shell-command injection tier
//!
//! Drives the device's `input` tool through `sh -c`.

use super::keymap::{self, KEYCODE_PASTE};
use super::{InjectionTier, InputError};
use log::debug;
use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Runs one shell command line and returns its stdout
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> Result<String, InputError>;
}

/// `sh -c` on the local host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

impl CommandRunner for SystemShell {
    fn run(&self, command: &str) -> Result<String, InputError> {
        debug!("sh -c {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    InputError::Unavailable(format!("sh: {}", e))
                }
                _ => InputError::Failed(format!("sh: {}", e)),
            })?;
        if !output.status.success() {
            return Err(InputError::Failed(format!(
                "`{}` exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Whether the `input` tool is on the PATH
pub(crate) fn has_input_tool(runner: &dyn CommandRunner) -> bool {
    runner
        .run("command -v input")
        .map(|out| !out.trim().is_empty())
        .unwrap_or(false)
}

pub struct ShellTier {
    runner: Arc<dyn CommandRunner>,
}

impl ShellTier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn exec(&self, command: String) -> Result<(), InputError> {
        self.runner.run(&command).map(|_| ())
    }
}

impl InjectionTier for ShellTier {
    fn name(&self) -> &str {
        "shell"
    }

    fn probe(&self) -> bool {
        has_input_tool(self.runner.as_ref())
    }

    fn tap(&self, x: i32, y: i32) -> Result<(), InputError> {
        self.exec(format!("input tap {} {}", x, y))
    }

    fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32) -> Result<(), InputError> {
        self.exec(format!("input swipe {} {} {} {} {}", x1, y1, x2, y2, duration_ms))
    }

    fn key(&self, code: i32) -> Result<(), InputError> {
        self.exec(format!("input keyevent {}", code))
    }

    fn key_with_shift(&self, code: i32) -> Result<(), InputError> {
        self.exec(format!("input keyevent --press KEYCODE_SHIFT_LEFT {}", code))
    }

    fn raw_text(&self, text: &str) -> Result<(), InputError> {
        self.exec(format!("input text {}", keymap::escape_text(text)))
    }

    fn paste(&self) -> Result<(), InputError> {
        self.key(KEYCODE_PASTE)
    }

    fn run_command(&self, command: &str) -> Result<(), InputError> {
        self.exec(command.to_string())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records command lines; `input` is reported present unless `missing`
    #[derive(Default)]
    pub struct RecordingRunner {
        pub commands: Mutex<Vec<String>>,
        pub missing: bool,
    }

    impl RecordingRunner {
        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, command: &str) -> Result<String, InputError> {
            if command.starts_with("command -v") {
                return Ok(if self.missing {
                    String::new()
                } else {
                    "/system/bin/input\n".to_string()
                });
            }
            self.commands.lock().push(command.to_string());
            Ok(String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[test]
    fn commands_use_the_input_tool() {
        let runner = Arc::new(RecordingRunner::default());
        let tier = ShellTier::new(runner.clone());
        assert!(tier.probe());

        tier.tap(10, 20).expect("tap");
        tier.swipe(1, 2, 3, 4, 300).expect("swipe");
        tier.key(4).expect("key");
        tier.key_with_shift(29).expect("shift");
        tier.raw_text("it's me").expect("text");
        tier.paste().expect("paste");
        assert_eq!(
            runner.commands(),
            vec![
                "input tap 10 20",
                "input swipe 1 2 3 4 300",
                "input keyevent 4",
                "input keyevent --press KEYCODE_SHIFT_LEFT 29",
                "input text 'it'\\''s%sme'",
                "input keyevent 279",
            ]
        );
    }

    #[test]
    fn probe_fails_without_input_tool() {
        let runner = Arc::new(RecordingRunner {
            missing: true,
            ..Default::default()
        });
        assert!(!ShellTier::new(runner).probe());
    }

    #[test]
    fn no_gesture_emulation_at_this_tier() {
        let tier = ShellTier::new(Arc::new(RecordingRunner::default()));
        assert!(matches!(tier.long_press(1, 1, 800), Err(InputError::Unsupported(_))));
        assert!(matches!(tier.char('a'), Err(InputError::Unsupported(_))));
    }

    #[test]
    fn system_shell_reports_exit_status() {
        assert_eq!(SystemShell.run("printf ok").expect("run"), "ok");
        assert!(matches!(SystemShell.run("exit 3"), Err(InputError::Failed(_))));
    }
}
