//! Terminal color themes. Selected once at startup from `settings.theme`
//! (or `COOP_THEME`) and read everywhere through [`current`].

use std::sync::OnceLock;

use console::{Color, Style, StyledObject};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Theme {
    pub name: &'static str,
    pub description: &'static str,
    accent: Color,
    ok: Color,
    warn: Color,
    error: Color,
}

pub const THEMES: &[Theme] = &[
    Theme {
        name: "default",
        description: "cyan accents on the terminal background",
        accent: Color::Cyan,
        ok: Color::Green,
        warn: Color::Yellow,
        error: Color::Red,
    },
    Theme {
        name: "ocean",
        description: "blue and teal",
        accent: Color::Blue,
        ok: Color::Cyan,
        warn: Color::Color256(214),
        error: Color::Color256(203),
    },
    Theme {
        name: "forest",
        description: "greens with amber warnings",
        accent: Color::Color256(71),
        ok: Color::Green,
        warn: Color::Color256(178),
        error: Color::Color256(167),
    },
    Theme {
        name: "mono",
        description: "no colors, bold and dim only",
        accent: Color::White,
        ok: Color::White,
        warn: Color::White,
        error: Color::White,
    },
];

static CURRENT: OnceLock<Theme> = OnceLock::new();

pub fn find(name: &str) -> Option<Theme> {
    THEMES.iter().copied().find(|t| t.name == name)
}

/// Set the process theme. Unknown names fall back to `default`; later calls
/// are ignored.
pub fn init(name: Option<&str>) {
    let theme = match name {
        None => THEMES[0],
        Some(n) => find(n).unwrap_or_else(|| {
            warn!(theme = n, "theme:unknown, using default");
            THEMES[0]
        }),
    };
    let _ = CURRENT.set(theme);
}

pub fn current() -> Theme {
    CURRENT.get().copied().unwrap_or(THEMES[0])
}

impl Theme {
    fn paint(&self, color: Color, text: impl Into<String>) -> StyledObject<String> {
        let style = if self.name == "mono" {
            Style::new()
        } else {
            Style::new().fg(color)
        };
        style.apply_to(text.into())
    }

    pub fn accent(&self, text: impl Into<String>) -> StyledObject<String> {
        self.paint(self.accent, text).bold()
    }

    pub fn ok(&self, text: impl Into<String>) -> StyledObject<String> {
        self.paint(self.ok, text)
    }

    pub fn warn(&self, text: impl Into<String>) -> StyledObject<String> {
        self.paint(self.warn, text)
    }

    pub fn error(&self, text: impl Into<String>) -> StyledObject<String> {
        self.paint(self.error, text).bold()
    }

    pub fn muted(&self, text: impl Into<String>) -> StyledObject<String> {
        Style::new().dim().apply_to(text.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = THEMES.iter().map(|t| t.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), THEMES.len());
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(find("ocean").unwrap().name, "ocean");
        assert!(find("neon").is_none());
    }

    #[test]
    fn styled_text_keeps_content() {
        let theme = find("mono").unwrap();
        let plain = console::strip_ansi_codes(&theme.accent("hello").to_string()).into_owned();
        assert_eq!(plain, "hello");
    }
}
