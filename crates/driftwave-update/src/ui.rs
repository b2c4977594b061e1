//! Declarative UI state for the update prompt and indicator.

use serde::{Deserialize, Serialize};

/// What the presentation layer should currently render.
///
/// The prompt (update available, accept/defer) and the indicator (applying
/// update) are mutually exclusive; the coordinator never sets both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiState {
    /// Whether the "new version available" prompt is visible.
    pub prompt_visible: bool,

    /// Whether the transient "applying update" indicator is visible.
    pub indicator_visible: bool,
}

impl UiState {
    /// Nothing visible.
    pub fn hidden() -> Self {
        Self::default()
    }

    /// Only the prompt visible.
    pub fn prompt() -> Self {
        Self {
            prompt_visible: true,
            indicator_visible: false,
        }
    }

    /// Only the indicator visible.
    pub fn indicator() -> Self {
        Self {
            prompt_visible: false,
            indicator_visible: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_are_mutually_exclusive() {
        for state in [UiState::hidden(), UiState::prompt(), UiState::indicator()] {
            assert!(!(state.prompt_visible && state.indicator_visible));
        }
    }
}
