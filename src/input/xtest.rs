//! Direct injection tier using the XTest extension

use super::keymap::{
    self, KEYCODE_BACK, KEYCODE_DEL, KEYCODE_DPAD_DOWN, KEYCODE_DPAD_LEFT, KEYCODE_DPAD_RIGHT, KEYCODE_DPAD_UP,
    KEYCODE_ESCAPE, KEYCODE_FORWARD_DEL, KEYCODE_HOME, KEYCODE_PASTE,
};
use super::{InjectionTier, InputError};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt, Window};
use x11rb::protocol::xtest;
use x11rb::rust_connection::RustConnection;

/// XTest input constants
const INPUT_KEY_PRESS: u8 = 2;
const INPUT_KEY_RELEASE: u8 = 3;
const INPUT_BUTTON_PRESS: u8 = 4;
const INPUT_BUTTON_RELEASE: u8 = 5;
const INPUT_MOTION: u8 = 6;

const BUTTON_LEFT: u8 = 1;
const TAP_HOLD: Duration = Duration::from_millis(50);
const SWIPE_STEPS: u32 = 20;
const MAX_SCROLL_CLICKS: u32 = 10;

const XK_SHIFT_L: u32 = 0xffe1;
const XK_BACKSPACE: u32 = 0xff08;
const XK_TAB: u32 = 0xff09;
const XK_RETURN: u32 = 0xff0d;
const XK_ESCAPE: u32 = 0xff1b;
const XK_HOME: u32 = 0xff50;
const XK_LEFT: u32 = 0xff51;
const XK_UP: u32 = 0xff52;
const XK_RIGHT: u32 = 0xff53;
const XK_DOWN: u32 = 0xff54;
const XK_DELETE: u32 = 0xffff;
const XF86XK_PASTE: u32 = 0x1008ff6d;

/// X keysym for a device key code
pub fn keysym_for_code(code: i32) -> Option<u32> {
    match code {
        KEYCODE_DEL => Some(XK_BACKSPACE),
        KEYCODE_FORWARD_DEL => Some(XK_DELETE),
        KEYCODE_DPAD_UP => Some(XK_UP),
        KEYCODE_DPAD_DOWN => Some(XK_DOWN),
        KEYCODE_DPAD_LEFT => Some(XK_LEFT),
        KEYCODE_DPAD_RIGHT => Some(XK_RIGHT),
        KEYCODE_ESCAPE | KEYCODE_BACK => Some(XK_ESCAPE),
        KEYCODE_HOME => Some(XK_HOME),
        KEYCODE_PASTE => Some(XF86XK_PASTE),
        _ => match keymap::base_char(code)? {
            '\n' => Some(XK_RETURN),
            '\t' => Some(XK_TAB),
            c => Some(c as u32),
        },
    }
}

/// Wheel button and click count per axis: 4/5 vertical, 6/7 horizontal
pub fn scroll_clicks(h_scroll: f32, v_scroll: f32) -> Vec<(u8, u32)> {
    let clicks = |amount: f32| (amount.abs().ceil() as u32).min(MAX_SCROLL_CLICKS);
    let mut out = Vec::new();
    if v_scroll != 0.0 {
        out.push((if v_scroll > 0.0 { 4 } else { 5 }, clicks(v_scroll)));
    }
    if h_scroll != 0.0 {
        out.push((if h_scroll > 0.0 { 7 } else { 6 }, clicks(h_scroll)));
    }
    out
}

struct XState {
    conn: RustConnection,
    root: Window,
    keysym_cache: HashMap<u32, u8>,
}

impl XState {
    fn fail<E: std::fmt::Display>(e: E) -> InputError {
        InputError::Unavailable(format!("X11: {}", e))
    }

    fn fake(&self, kind: u8, detail: u8, x: i16, y: i16) -> Result<(), InputError> {
        xtest::fake_input(&self.conn, kind, detail, 0, self.root, x, y, 0).map_err(Self::fail)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), InputError> {
        self.conn.flush().map_err(Self::fail)
    }

    fn move_to(&self, x: i32, y: i32) -> Result<(), InputError> {
        let (x, y) = clamp_point(x, y);
        self.conn
            .warp_pointer(0u32, self.root, 0, 0, 0, 0, x, y)
            .map_err(Self::fail)?;
        self.flush()
    }

    fn button(&self, button: u8, pressed: bool) -> Result<(), InputError> {
        let kind = if pressed { INPUT_BUTTON_PRESS } else { INPUT_BUTTON_RELEASE };
        self.fake(kind, button, 0, 0)?;
        self.flush()
    }

    fn keycode(&self, keysym: u32) -> Result<u8, InputError> {
        self.keysym_cache
            .get(&keysym)
            .copied()
            .ok_or_else(|| InputError::Failed(format!("no keycode for keysym 0x{:x}", keysym)))
    }

    fn key(&self, keysym: u32, shift: bool) -> Result<(), InputError> {
        let keycode = self.keycode(keysym)?;
        let shift_code = if shift { Some(self.keycode(XK_SHIFT_L)?) } else { None };
        if let Some(sc) = shift_code {
            self.fake(INPUT_KEY_PRESS, sc, 0, 0)?;
        }
        self.fake(INPUT_KEY_PRESS, keycode, 0, 0)?;
        self.fake(INPUT_KEY_RELEASE, keycode, 0, 0)?;
        if let Some(sc) = shift_code {
            self.fake(INPUT_KEY_RELEASE, sc, 0, 0)?;
        }
        self.flush()
    }
}

fn clamp_point(x: i32, y: i32) -> (i16, i16) {
    (
        x.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        y.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
    )
}

/// XTest fake input on the local X server
pub struct XTestTier {
    state: Mutex<XState>,
}

impl XTestTier {
    /// Connect to `display` and build the keysym cache
    pub fn connect(display: Option<&str>) -> Result<Self, InputError> {
        let (conn, screen_num) = x11rb::connect(display).map_err(XState::fail)?;
        let setup = conn.setup();
        let root = setup
            .roots
            .get(screen_num)
            .map(|s| s.root)
            .ok_or_else(|| InputError::Unavailable(format!("X11 screen {} missing", screen_num)))?;

        let mut keysym_cache = HashMap::new();
        let min_keycode = setup.min_keycode;
        let max_keycode = setup.max_keycode;
        if let Ok(cookie) = conn.get_keyboard_mapping(min_keycode, max_keycode - min_keycode + 1) {
            if let Ok(mapping) = cookie.reply() {
                let per_keycode = mapping.keysyms_per_keycode as usize;
                for i in 0..=(max_keycode - min_keycode) as usize {
                    let offset = i * per_keycode;
                    if offset < mapping.keysyms.len() && mapping.keysyms[offset] != 0 {
                        keysym_cache
                            .entry(mapping.keysyms[offset])
                            .or_insert((min_keycode as usize + i) as u8);
                    }
                }
            }
        }
        debug!("XTest keysym cache: {} entries", keysym_cache.len());

        Ok(Self {
            state: Mutex::new(XState {
                conn,
                root,
                keysym_cache,
            }),
        })
    }
}

impl InjectionTier for XTestTier {
    fn name(&self) -> &str {
        "xtest"
    }

    fn probe(&self) -> bool {
        let state = self.state.lock();
        let version = xtest::get_version(&state.conn, 2, 2)
            .ok()
            .and_then(|cookie| cookie.reply().ok());
        match version {
            Some(v) => {
                debug!("XTest {}.{}", v.major_version, v.minor_version);
                true
            }
            None => false,
        }
    }

    fn tap(&self, x: i32, y: i32) -> Result<(), InputError> {
        let state = self.state.lock();
        state.move_to(x, y)?;
        state.button(BUTTON_LEFT, true)?;
        thread::sleep(TAP_HOLD);
        state.button(BUTTON_LEFT, false)
    }

    fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32) -> Result<(), InputError> {
        let state = self.state.lock();
        let step_delay = Duration::from_millis((duration_ms / SWIPE_STEPS) as u64);
        state.move_to(x1, y1)?;
        state.button(BUTTON_LEFT, true)?;
        for step in 1..=SWIPE_STEPS {
            let t = step as f32 / SWIPE_STEPS as f32;
            let x = x1 + ((x2 - x1) as f32 * t) as i32;
            let y = y1 + ((y2 - y1) as f32 * t) as i32;
            let (x, y) = clamp_point(x, y);
            state.fake(INPUT_MOTION, 0, x, y)?;
            state.flush()?;
            thread::sleep(step_delay);
        }
        state.button(BUTTON_LEFT, false)
    }

    fn long_press(&self, x: i32, y: i32, duration_ms: u32) -> Result<(), InputError> {
        let state = self.state.lock();
        state.move_to(x, y)?;
        state.button(BUTTON_LEFT, true)?;
        thread::sleep(Duration::from_millis(duration_ms as u64));
        state.button(BUTTON_LEFT, false)
    }

    fn scroll(&self, x: i32, y: i32, h_scroll: f32, v_scroll: f32) -> Result<(), InputError> {
        let state = self.state.lock();
        state.move_to(x, y)?;
        for (button, clicks) in scroll_clicks(h_scroll, v_scroll) {
            for _ in 0..clicks {
                state.button(button, true)?;
                state.button(button, false)?;
            }
        }
        Ok(())
    }

    fn key(&self, code: i32) -> Result<(), InputError> {
        let keysym = keysym_for_code(code).ok_or_else(|| InputError::Unsupported(format!("key code {}", code)))?;
        self.state.lock().key(keysym, false)
    }

    fn key_with_shift(&self, code: i32) -> Result<(), InputError> {
        let keysym = keysym_for_code(code).ok_or_else(|| InputError::Unsupported(format!("key code {}", code)))?;
        self.state.lock().key(keysym, true)
    }

    fn char(&self, c: char) -> Result<(), InputError> {
        if let Some(stroke) = keymap::lookup(c) {
            let keysym = keysym_for_code(stroke.code)
                .ok_or_else(|| InputError::Unsupported(format!("char {:?}", c)))?;
            return self.state.lock().key(keysym, stroke.shift);
        }
        // Latin-1 keysyms equal their code points
        match c as u32 {
            cp @ 0xa0..=0xff => self.state.lock().key(cp, false),
            _ => Err(InputError::Unsupported(format!("char {:?}", c))),
        }
    }

    fn paste(&self) -> Result<(), InputError> {
        self.key(KEYCODE_PASTE)
    }
}
