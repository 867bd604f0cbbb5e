//! Remote input injection
//!
//! Operations are tried on the highest available tier first and fall back
//! one tier at a time on failure. Tiers are probed once at construction.

pub mod gesture;
pub mod keymap;
pub mod shell;
pub mod xtest;

pub use gesture::GestureTier;
pub use shell::{CommandRunner, ShellTier, SystemShell};
pub use xtest::XTestTier;

use crate::clipboard::ClipboardSync;
use crate::transport::{TouchKind, TouchMessage};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Delay between characters of `input.text`
pub const TEXT_DELAY: Duration = Duration::from_millis(10);

/// Time for the clipboard to settle before pasting
pub const PASTE_SETTLE: Duration = Duration::from_millis(150);

pub const LONG_PRESS_MS: u32 = 800;

/// Input-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// The tier has no way to perform this operation
    Unsupported(String),
    /// The tier tried and failed
    Failed(String),
    /// The tier lost access to its backend
    Unavailable(String),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            InputError::Failed(msg) => write!(f, "Injection failed: {}", msg),
            InputError::Unavailable(msg) => write!(f, "Injection unavailable: {}", msg),
        }
    }
}

impl Error for InputError {}

fn unsupported(op: &str) -> Result<(), InputError> {
    Err(InputError::Unsupported(op.to_string()))
}

/// Navigation commands from `input.command`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    HideKeyboard,
    Back,
    Home,
    Recents,
}

impl SystemCommand {
    pub fn parse(command: &str) -> Option<Self> {
        match command {
            "hide_keyboard" => Some(SystemCommand::HideKeyboard),
            "back" => Some(SystemCommand::Back),
            "home" => Some(SystemCommand::Home),
            "recents" => Some(SystemCommand::Recents),
            _ => None,
        }
    }
}

/// One strategy for delivering synthetic input.
///
/// Every operation defaults to `Unsupported` so a tier only implements
/// what it can actually do.
pub trait InjectionTier: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the tier can be used on this host. Called once.
    fn probe(&self) -> bool;

    fn tap(&self, _x: i32, _y: i32) -> Result<(), InputError> {
        unsupported("tap")
    }

    fn swipe(&self, _x1: i32, _y1: i32, _x2: i32, _y2: i32, _duration_ms: u32) -> Result<(), InputError> {
        unsupported("swipe")
    }

    fn long_press(&self, _x: i32, _y: i32, _duration_ms: u32) -> Result<(), InputError> {
        unsupported("long press")
    }

    fn scroll(&self, _x: i32, _y: i32, _h_scroll: f32, _v_scroll: f32) -> Result<(), InputError> {
        unsupported("scroll")
    }

    fn key(&self, _code: i32) -> Result<(), InputError> {
        unsupported("key")
    }

    fn key_with_shift(&self, _code: i32) -> Result<(), InputError> {
        unsupported("shifted key")
    }

    /// Synthesize the key events for a single character
    fn char(&self, _c: char) -> Result<(), InputError> {
        unsupported("char")
    }

    /// Inject text verbatim
    fn raw_text(&self, _text: &str) -> Result<(), InputError> {
        unsupported("raw text")
    }

    fn paste(&self) -> Result<(), InputError> {
        unsupported("paste")
    }

    /// Run a device command line
    fn run_command(&self, _command: &str) -> Result<(), InputError> {
        unsupported("command")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChainSettings {
    pub text_delay: Duration,
    pub paste_settle: Duration,
    pub long_press_ms: u32,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            text_delay: TEXT_DELAY,
            paste_settle: PASTE_SETTLE,
            long_press_ms: LONG_PRESS_MS,
        }
    }
}

struct Tier {
    inner: Box<dyn InjectionTier>,
    available: AtomicBool,
}

/// Ordered injection tiers, highest first
pub struct InputInjectionChain {
    tiers: Vec<Tier>,
    active: AtomicUsize,
    settings: ChainSettings,
    clipboard: Option<Arc<ClipboardSync>>,
}

impl InputInjectionChain {
    /// Probe every tier once and cache the highest available one
    pub fn new(tiers: Vec<Box<dyn InjectionTier>>, settings: ChainSettings) -> Self {
        let tiers: Vec<Tier> = tiers
            .into_iter()
            .map(|inner| {
                let available = inner.probe();
                info!(
                    "Input tier {}: {}",
                    inner.name(),
                    if available { "available" } else { "unavailable" }
                );
                Tier {
                    inner,
                    available: AtomicBool::new(available),
                }
            })
            .collect();
        let active = tiers
            .iter()
            .position(|t| t.available.load(Ordering::Relaxed))
            .unwrap_or(tiers.len());
        if active == tiers.len() {
            warn!("No input tier available, remote input will be ignored");
        }
        Self {
            tiers,
            active: AtomicUsize::new(active),
            settings,
            clipboard: None,
        }
    }

    pub fn with_clipboard(mut self, clipboard: Arc<ClipboardSync>) -> Self {
        self.clipboard = Some(clipboard);
        self
    }

    /// Name of the tier tried first
    pub fn active_tier(&self) -> Option<&str> {
        self.tiers
            .get(self.active.load(Ordering::Acquire))
            .map(|t| t.inner.name())
    }

    pub fn tap(&self, x: i32, y: i32) -> Result<(), InputError> {
        self.run("tap", |t| t.tap(x, y))
    }

    pub fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32) -> Result<(), InputError> {
        self.run("swipe", |t| t.swipe(x1, y1, x2, y2, duration_ms))
    }

    pub fn long_press(&self, x: i32, y: i32) -> Result<(), InputError> {
        let duration = self.settings.long_press_ms;
        self.run("long press", |t| t.long_press(x, y, duration))
    }

    pub fn scroll(&self, x: i32, y: i32, h_scroll: f32, v_scroll: f32) -> Result<(), InputError> {
        self.run("scroll", |t| t.scroll(x, y, h_scroll, v_scroll))
    }

    pub fn key(&self, code: i32) -> Result<(), InputError> {
        self.run("key", |t| t.key(code))
    }

    pub fn touch(&self, touch: &TouchMessage) -> Result<(), InputError> {
        let point = |v: f64| v.round() as i32;
        match touch.action {
            TouchKind::Tap => self.tap(point(touch.x), point(touch.y)),
            TouchKind::LongPress => self.long_press(point(touch.x), point(touch.y)),
            TouchKind::Swipe => self.swipe(
                point(touch.start_x),
                point(touch.start_y),
                point(touch.end_x),
                point(touch.end_y),
                touch.duration,
            ),
            TouchKind::Scroll => self.scroll(point(touch.x), point(touch.y), touch.h_scroll, touch.v_scroll),
        }
    }

    /// Type `text` one character at a time, in order.
    ///
    /// A character no tier can deliver is logged and skipped; the rest of
    /// the text still goes through.
    pub fn text(&self, text: &str) {
        for (i, c) in text.chars().enumerate() {
            if i > 0 && !self.settings.text_delay.is_zero() {
                thread::sleep(self.settings.text_delay);
            }
            if let Err(e) = self.deliver_char(c) {
                error!("Could not deliver {:?}: {}", c, e);
            }
        }
    }

    /// Put `text` on the clipboard and paste it
    pub fn paste_text(&self, text: &str) -> Result<(), InputError> {
        let clipboard = self
            .clipboard
            .as_ref()
            .ok_or_else(|| InputError::Unavailable("no clipboard".to_string()))?;
        clipboard
            .apply_remote(text)
            .map_err(|e| InputError::Failed(e.to_string()))?;
        thread::sleep(self.settings.paste_settle);
        self.run("paste", |t| t.paste())
    }

    pub fn command(&self, command: SystemCommand) -> Result<(), InputError> {
        match command {
            SystemCommand::HideKeyboard => {
                self.key(keymap::KEYCODE_ESCAPE)?;
                if let Err(e) = self.dispatch("collapse", |t| t.run_command("cmd statusbar collapse")) {
                    debug!("Status bar collapse skipped: {}", e);
                }
                Ok(())
            }
            SystemCommand::Back => self.key(keymap::KEYCODE_BACK),
            SystemCommand::Home => self.key(keymap::KEYCODE_HOME),
            SystemCommand::Recents => self.key(keymap::KEYCODE_APP_SWITCH),
        }
    }

    fn deliver_char(&self, c: char) -> Result<(), InputError> {
        if self.dispatch("char", |t| t.char(c)).is_ok() {
            return Ok(());
        }
        if let Some(stroke) = keymap::lookup(c) {
            let keyed = if stroke.shift {
                self.dispatch("shifted key", |t| t.key_with_shift(stroke.code))
            } else {
                self.dispatch("key", |t| t.key(stroke.code))
            };
            if keyed.is_ok() {
                return Ok(());
            }
        }
        let mut buf = [0u8; 4];
        let text: &str = c.encode_utf8(&mut buf);
        self.dispatch("raw text", |t| t.raw_text(text))
    }

    /// `dispatch` plus the error log for an operation no tier could perform
    fn run<F>(&self, op: &str, f: F) -> Result<(), InputError>
    where
        F: Fn(&dyn InjectionTier) -> Result<(), InputError>,
    {
        let result = self.dispatch(op, f);
        if let Err(e) = &result {
            error!("{} failed on every input tier: {}", op, e);
        }
        result
    }

    fn dispatch<F>(&self, op: &str, f: F) -> Result<(), InputError>
    where
        F: Fn(&dyn InjectionTier) -> Result<(), InputError>,
    {
        let start = self.active.load(Ordering::Acquire);
        let mut last = InputError::Unavailable("no input tier available".to_string());
        for (index, tier) in self.tiers.iter().enumerate().skip(start) {
            if !tier.available.load(Ordering::Acquire) {
                continue;
            }
            match f(tier.inner.as_ref()) {
                Ok(()) => return Ok(()),
                Err(InputError::Unavailable(msg)) => {
                    warn!("Input tier {} became unavailable: {}", tier.inner.name(), msg);
                    tier.available.store(false, Ordering::Release);
                    self.demote(index);
                    last = InputError::Unavailable(msg);
                }
                Err(e) => {
                    debug!("{} via {} failed: {}", op, tier.inner.name(), e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn demote(&self, from: usize) {
        let next = self
            .tiers
            .iter()
            .enumerate()
            .skip(from + 1)
            .find(|(_, t)| t.available.load(Ordering::Acquire))
            .map(|(i, _)| i)
            .unwrap_or(self.tiers.len());
        let _ = self
            .active
            .compare_exchange(from, next, Ordering::AcqRel, Ordering::Acquire);
        if let Some(tier) = self.tiers.get(next) {
            info!("Input now starts at tier {}", tier.inner.name());
        }
    }
}
