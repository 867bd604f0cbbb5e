//! Coarse gesture tier
//!
//! Emulates gestures that have no direct shell command with timed swipes.

use super::shell::{has_input_tool, CommandRunner};
use super::{InjectionTier, InputError};
use std::sync::Arc;

/// Swipe distance per scroll unit, in pixels
const SCROLL_STEP: f32 = 100.0;
const SCROLL_DURATION_MS: u32 = 100;

pub struct GestureTier {
    runner: Arc<dyn CommandRunner>,
}

impl GestureTier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl InjectionTier for GestureTier {
    fn name(&self) -> &str {
        "gesture"
    }

    fn probe(&self) -> bool {
        has_input_tool(self.runner.as_ref())
    }

    /// Zero-distance swipe held for `duration_ms`
    fn long_press(&self, x: i32, y: i32, duration_ms: u32) -> Result<(), InputError> {
        self.runner
            .run(&format!("input swipe {} {} {} {} {}", x, y, x, y, duration_ms))
            .map(|_| ())
    }

    /// Swipe against the scroll direction, like a finger drag
    fn scroll(&self, x: i32, y: i32, h_scroll: f32, v_scroll: f32) -> Result<(), InputError> {
        let end_x = x - (h_scroll * SCROLL_STEP) as i32;
        let end_y = y - (v_scroll * SCROLL_STEP) as i32;
        self.runner
            .run(&format!(
                "input swipe {} {} {} {} {}",
                x, y, end_x, end_y, SCROLL_DURATION_MS
            ))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::shell::testing::RecordingRunner;

    #[test]
    fn long_press_and_scroll_become_swipes() {
        let runner = Arc::new(RecordingRunner::default());
        let tier = GestureTier::new(runner.clone());
        assert!(tier.probe());

        tier.long_press(100, 200, 800).expect("long press");
        tier.scroll(500, 500, 0.0, -1.5).expect("scroll");
        tier.scroll(500, 500, 1.0, 0.0).expect("scroll");
        assert_eq!(
            runner.commands(),
            vec![
                "input swipe 100 200 100 200 800",
                "input swipe 500 500 500 650 100",
                "input swipe 500 500 400 500 100",
            ]
        );
        assert!(matches!(tier.tap(1, 1), Err(InputError::Unsupported(_))));
    }
}
