//! Input device bindings
//!
//! Capturing keyboard, mouse, touch and gamepad input is up to the host.
//! The controller only switches bindings on once media is flowing and off
//! again on disconnect.

use std::sync::Arc;
use tracing::debug;

use crate::config::InputConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Keyboard,
    Mouse,
    Touch,
    Gamepad,
}

impl InputKind {
    fn enabled_in(&self, config: &InputConfig) -> bool {
        match self {
            Self::Keyboard => config.keyboard,
            Self::Mouse => config.mouse,
            Self::Touch => config.touch,
            Self::Gamepad => config.gamepad,
        }
    }
}

/// Host-side input device handle
pub trait InputBinding: Send + Sync {
    fn kind(&self) -> InputKind;

    fn set_enabled(&self, enabled: bool);
}

#[derive(Default, Clone)]
pub struct InputBindings {
    bindings: Vec<Arc<dyn InputBinding>>,
}

impl InputBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, binding: Arc<dyn InputBinding>) {
        self.bindings.push(binding);
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Enable the bindings switched on in `config`, disable the rest
    pub fn apply(&self, config: &InputConfig) {
        for binding in &self.bindings {
            let enabled = binding.kind().enabled_in(config);
            debug!("Input {:?} enabled: {}", binding.kind(), enabled);
            binding.set_enabled(enabled);
        }
    }

    pub fn disable_all(&self) {
        for binding in &self.bindings {
            binding.set_enabled(false);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) struct FlagBinding {
        pub kind: InputKind,
        pub enabled: AtomicBool,
    }

    impl FlagBinding {
        pub fn new(kind: InputKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                enabled: AtomicBool::new(false),
            })
        }

        pub fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }
    }

    impl InputBinding for FlagBinding {
        fn kind(&self) -> InputKind {
            self.kind
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_apply_and_disable() {
        let keyboard = FlagBinding::new(InputKind::Keyboard);
        let gamepad = FlagBinding::new(InputKind::Gamepad);

        let mut bindings = InputBindings::new();
        bindings.add(keyboard.clone());
        bindings.add(gamepad.clone());

        let config = InputConfig {
            gamepad: false,
            ..Default::default()
        };
        bindings.apply(&config);
        assert!(keyboard.is_enabled());
        assert!(!gamepad.is_enabled());

        bindings.disable_all();
        assert!(!keyboard.is_enabled());
    }
}
