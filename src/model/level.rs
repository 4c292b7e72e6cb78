//! Severity levels for derived events.
//!
//! Levels are wire-encoded as small integers. `Normal` (0) is the implicit
//! "no event" state and `Cleared` (6) is the synthetic back-to-normal
//! transition; 1..=5 are the active severities, ordered worst-first.

use serde::{Deserialize, Serialize};

/// Display locale for event titles and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    /// Simplified Chinese (the upstream default).
    #[default]
    ZhCn,
    /// English.
    EnUs,
}

/// Event severity level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Level {
    /// No event. Never emitted, only stored as transition state.
    #[default]
    Normal = 0,
    Critical = 1,
    Major = 2,
    Minor = 3,
    Warning = 4,
    Indeterminate = 5,
    /// Synthetic "back to normal" transition.
    Cleared = 6,
}

/// Active severities plus `Cleared`, in aggregation priority order.
pub const SEVERITY_PRIORITY: [Level; 6] = [
    Level::Critical,
    Level::Major,
    Level::Minor,
    Level::Warning,
    Level::Indeterminate,
    Level::Cleared,
];

impl Level {
    /// Numeric wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// English display name. `Normal` renders empty.
    pub fn name_en(self) -> &'static str {
        match self {
            Level::Normal => "",
            Level::Critical => "Critical",
            Level::Major => "Major",
            Level::Minor => "Minor",
            Level::Warning => "Warning",
            Level::Indeterminate => "Indeterminate",
            Level::Cleared => "Cleared",
        }
    }

    /// Chinese display name. `Normal` renders empty.
    pub fn name_zh(self) -> &'static str {
        match self {
            Level::Normal => "",
            Level::Critical => "紧急",
            Level::Major => "主要",
            Level::Minor => "次要",
            Level::Warning => "提示",
            Level::Indeterminate => "不明确",
            Level::Cleared => "清除",
        }
    }

    /// Display name in the given locale.
    pub fn name(self, locale: Locale) -> &'static str {
        match locale {
            Locale::ZhCn => self.name_zh(),
            Locale::EnUs => self.name_en(),
        }
    }

    /// True for the active severities 1..=5.
    ///
    /// A cleared hit against a stored level that is not active is
    /// suppressed; an active stored level justifies emitting the clear.
    pub fn is_active(self) -> bool {
        !matches!(self, Level::Normal | Level::Cleared)
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> Self {
        level.code()
    }
}

impl TryFrom<u8> for Level {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Level::Normal),
            1 => Ok(Level::Critical),
            2 => Ok(Level::Major),
            3 => Ok(Level::Minor),
            4 => Ok(Level::Warning),
            5 => Ok(Level::Indeterminate),
            6 => Ok(Level::Cleared),
            other => Err(format!("invalid severity level code: {other}")),
        }
    }
}
