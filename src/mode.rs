use std::fmt::Display;

use crate::sync::RenderedEntry;

pub const DELETE_MODE_NOTICE: &str =
    "Delete mode is on. Click an entry in the menu to remove its key, then choose \"Done removing\" to leave delete mode.";

/// What activating an entry in the list does.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PresentationMode {
    #[default]
    Copy,
    Delete,
}

impl PresentationMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Copy => Self::Delete,
            Self::Delete => Self::Copy,
        }
    }

    pub fn decoration(self) -> Decoration {
        match self {
            Self::Copy => Decoration::Copyable,
            Self::Delete => Decoration::Deletable,
        }
    }

    /// Applies this mode's decoration to `entry`.
    pub fn decorate(self, entry: &mut RenderedEntry) {
        entry.decoration = self.decoration();
    }

    /// Title of the menu item that flips the mode.
    pub fn toggle_title(self) -> &'static str {
        match self {
            Self::Copy => "Remove…",
            Self::Delete => "Done removing",
        }
    }
}

impl Display for PresentationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copy => write!(f, "copy"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoration {
    Copyable,
    Deletable,
}

impl Decoration {
    pub fn icon(self) -> &'static str {
        match self {
            Self::Copyable => "copy",
            Self::Deletable => "remove",
        }
    }

    pub fn tooltip(self) -> &'static str {
        match self {
            Self::Copyable => "Copy the code",
            Self::Deletable => "Delete this key",
        }
    }
}

/// Outcome of flipping the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSwitch {
    pub mode: PresentationMode,
    /// Shown once each time delete mode is entered; never on the way back.
    pub notice: Option<&'static str>,
}

impl ModeSwitch {
    pub(crate) fn to(mode: PresentationMode) -> Self {
        let notice = match mode {
            PresentationMode::Delete => Some(DELETE_MODE_NOTICE),
            PresentationMode::Copy => None,
        };

        Self { mode, notice }
    }
}
