//! Keyboard inspector for the K-Buffer settings.
//!
//! | Key   | Action                     |
//! |-------|----------------------------|
//! | `]`   | K + 1                      |
//! | `[`   | K - 1                      |
//! | `T`   | toggle tone mapping        |
//! | `E`   | exposure + 0.05            |
//! | `D`   | exposure - 0.05            |
//! | `G`   | toggle gamma correction    |
//! | `=`   | gamma + 0.05               |
//! | `-`   | gamma - 0.05               |
//! | `F1`  | log the property sheet     |

use std::collections::HashSet;
use std::fmt::Write as _;

use winit::event::{ElementState, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

use crate::kbuffer::KBufferSettings;

pub const EXPOSURE_STEP: f32 = 0.05;
pub const GAMMA_STEP: f32 = 0.05;

/// Keyboard state with per-frame edge detection.
#[derive(Debug, Default)]
pub struct Input {
    keys_down: HashSet<KeyCode>,
    keys_pressed: HashSet<KeyCode>,
}

impl Input {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets last frame's presses. Call once per frame before handling events.
    pub fn begin_frame(&mut self) {
        self.keys_pressed.clear();
    }

    pub fn handle_event(&mut self, event: &WindowEvent) {
        if let WindowEvent::KeyboardInput { event, .. } = event {
            if let PhysicalKey::Code(key) = event.physical_key {
                match event.state {
                    ElementState::Pressed => self.press(key),
                    ElementState::Released => self.release(key),
                }
            }
        }
    }

    pub fn press(&mut self, key: KeyCode) {
        // Key repeat does not count as a new press.
        if self.keys_down.insert(key) {
            self.keys_pressed.insert(key);
        }
    }

    pub fn release(&mut self, key: KeyCode) {
        self.keys_down.remove(&key);
    }

    pub fn key_down(&self, key: KeyCode) -> bool {
        self.keys_down.contains(&key)
    }

    pub fn key_pressed(&self, key: KeyCode) -> bool {
        self.keys_pressed.contains(&key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditorAction {
    IncreaseK,
    DecreaseK,
    ToggleToneMapping,
    IncreaseExposure,
    DecreaseExposure,
    ToggleGammaCorrection,
    IncreaseGamma,
    DecreaseGamma,
    ShowProperties,
}

impl EditorAction {
    pub fn from_key(key: KeyCode) -> Option<Self> {
        Some(match key {
            KeyCode::BracketRight => EditorAction::IncreaseK,
            KeyCode::BracketLeft => EditorAction::DecreaseK,
            KeyCode::KeyT => EditorAction::ToggleToneMapping,
            KeyCode::KeyE => EditorAction::IncreaseExposure,
            KeyCode::KeyD => EditorAction::DecreaseExposure,
            KeyCode::KeyG => EditorAction::ToggleGammaCorrection,
            KeyCode::Equal => EditorAction::IncreaseGamma,
            KeyCode::Minus => EditorAction::DecreaseGamma,
            KeyCode::F1 => EditorAction::ShowProperties,
            _ => return None,
        })
    }
}

/// Applies editor actions to any K-Buffer backend.
#[derive(Debug, Default)]
pub struct KBufferEditor;

impl KBufferEditor {
    pub fn new() -> Self {
        Self
    }

    /// Handles this frame's key presses. Returns whether a setting changed.
    pub fn update(&self, input: &Input, settings: &mut dyn KBufferSettings) -> bool {
        const KEYS: [KeyCode; 9] = [
            KeyCode::BracketRight,
            KeyCode::BracketLeft,
            KeyCode::KeyT,
            KeyCode::KeyE,
            KeyCode::KeyD,
            KeyCode::KeyG,
            KeyCode::Equal,
            KeyCode::Minus,
            KeyCode::F1,
        ];
        let mut changed = false;
        for key in KEYS.into_iter().filter(|&k| input.key_pressed(k)) {
            if let Some(action) = EditorAction::from_key(key) {
                changed |= self.apply(action, settings);
            }
        }
        if changed {
            log::info!("{}", Self::summary(settings));
        }
        changed
    }

    pub fn apply(&self, action: EditorAction, settings: &mut dyn KBufferSettings) -> bool {
        match action {
            EditorAction::IncreaseK => settings.set_k(settings.k().saturating_add(1)),
            EditorAction::DecreaseK => settings.set_k(settings.k().saturating_sub(1)),
            EditorAction::ToggleToneMapping => settings.set_tone_mapped(!settings.is_tone_mapped()),
            EditorAction::IncreaseExposure => settings.set_exposure(settings.exposure() + EXPOSURE_STEP),
            EditorAction::DecreaseExposure => settings.set_exposure(settings.exposure() - EXPOSURE_STEP),
            EditorAction::ToggleGammaCorrection => {
                settings.set_gamma_corrected(!settings.is_gamma_corrected())
            }
            EditorAction::IncreaseGamma => settings.set_gamma(settings.gamma() + GAMMA_STEP),
            EditorAction::DecreaseGamma => settings.set_gamma(settings.gamma() - GAMMA_STEP),
            EditorAction::ShowProperties => {
                log::info!("\n{}", Self::property_sheet(settings));
                return false;
            }
        }
        true
    }

    fn summary(settings: &dyn KBufferSettings) -> String {
        format!(
            "K = {}, tone mapped = {}, exposure = {:.2}, gamma corrected = {}, gamma = {:.2}",
            settings.k(),
            settings.is_tone_mapped(),
            settings.exposure(),
            settings.is_gamma_corrected(),
            settings.gamma()
        )
    }

    /// The settings as an aligned two-column table.
    pub fn property_sheet(settings: &dyn KBufferSettings) -> String {
        let rows = [
            ("K", settings.k().to_string()),
            ("Tone mapping", settings.is_tone_mapped().to_string()),
            ("Exposure", format!("{:.2}", settings.exposure())),
            ("Gamma correction", settings.is_gamma_corrected().to_string()),
            ("Gamma", format!("{:.2}", settings.gamma())),
        ];
        let mut sheet = String::from("K-Buffer\n");
        for (name, value) in rows {
            let _ = writeln!(sheet, "  {:<18}{}", name, value);
        }
        sheet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kbuffer::KBuffer;

    #[test]
    fn held_key_presses_once() {
        let mut input = Input::new();
        input.press(KeyCode::KeyT);
        input.press(KeyCode::KeyT);
        assert!(input.key_pressed(KeyCode::KeyT));

        input.begin_frame();
        input.press(KeyCode::KeyT);
        assert!(input.key_down(KeyCode::KeyT));
        assert!(!input.key_pressed(KeyCode::KeyT));
    }

    #[test]
    fn k_steps_stay_in_range() {
        let editor = KBufferEditor::new();
        let mut kbuffer = KBuffer::new(2, 2, 16);
        editor.apply(EditorAction::IncreaseK, &mut kbuffer);
        assert_eq!(kbuffer.k(), 16);

        let mut kbuffer = KBuffer::new(2, 2, 1);
        editor.apply(EditorAction::DecreaseK, &mut kbuffer);
        assert_eq!(kbuffer.k(), 1);
        editor.apply(EditorAction::IncreaseK, &mut kbuffer);
        assert_eq!(kbuffer.k(), 2);
    }

    #[test]
    fn pressed_keys_drive_the_settings() {
        let editor = KBufferEditor::new();
        let mut kbuffer = KBuffer::new(2, 2, 4);
        let mut input = Input::new();
        input.press(KeyCode::KeyT);
        input.press(KeyCode::KeyD);

        assert!(editor.update(&input, &mut kbuffer));
        assert!(kbuffer.is_tone_mapped());
        assert!((kbuffer.exposure() - 0.95).abs() < 1e-6);
    }

    #[test]
    fn exposure_never_goes_negative() {
        let editor = KBufferEditor::new();
        let mut kbuffer = KBuffer::new(2, 2, 4);
        kbuffer.set_exposure(0.01);
        editor.apply(EditorAction::DecreaseExposure, &mut kbuffer);
        assert_eq!(kbuffer.exposure(), 0.0);
    }

    #[test]
    fn property_sheet_lists_every_setting() {
        let kbuffer = KBuffer::new(2, 2, 8);
        let sheet = KBufferEditor::property_sheet(&kbuffer);
        assert!(sheet.contains("K                 8"));
        assert!(sheet.contains("Gamma             2.20"));
        assert_eq!(sheet.lines().count(), 6);
    }

    #[test]
    fn unbound_keys_do_nothing() {
        assert_eq!(EditorAction::from_key(KeyCode::KeyQ), None);
    }
}
