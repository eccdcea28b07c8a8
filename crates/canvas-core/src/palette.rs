use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CanvasError;

/// The fixed set of colors a pixel can take. Clients address colors by their
/// lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    LightGray,
    Gray,
    Black,
    Pink,
    Red,
    Orange,
    Brown,
    Yellow,
    Lime,
    Green,
    Cyan,
    LightBlue,
    Blue,
    Magenta,
    Purple,
}

impl Color {
    pub const BACKGROUND: Color = Color::White;

    pub const COUNT: usize = 16;

    pub const ALL: [Color; Color::COUNT] = [
        Color::White,
        Color::LightGray,
        Color::Gray,
        Color::Black,
        Color::Pink,
        Color::Red,
        Color::Orange,
        Color::Brown,
        Color::Yellow,
        Color::Lime,
        Color::Green,
        Color::Cyan,
        Color::LightBlue,
        Color::Blue,
        Color::Magenta,
        Color::Purple,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Color::White => "white",
            Color::LightGray => "lightgray",
            Color::Gray => "gray",
            Color::Black => "black",
            Color::Pink => "pink",
            Color::Red => "red",
            Color::Orange => "orange",
            Color::Brown => "brown",
            Color::Yellow => "yellow",
            Color::Lime => "lime",
            Color::Green => "green",
            Color::Cyan => "cyan",
            Color::LightBlue => "lightblue",
            Color::Blue => "blue",
            Color::Magenta => "magenta",
            Color::Purple => "purple",
        }
    }

    /// Position in [`Color::ALL`]; used as a dense array index by the counters.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::BACKGROUND
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Color {
    type Err = CanvasError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let needle = raw.trim();
        Color::ALL
            .iter()
            .copied()
            .find(|color| color.name().eq_ignore_ascii_case(needle))
            .ok_or_else(|| CanvasError::UnknownColor(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_has_sixteen_distinct_names() {
        let mut names: Vec<&str> = Color::ALL.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 16);
    }

    #[test]
    fn index_matches_position_in_all() {
        for (pos, color) in Color::ALL.iter().enumerate() {
            assert_eq!(color.index(), pos);
        }
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("red".parse::<Color>().unwrap(), Color::Red);
        assert_eq!("LightBlue".parse::<Color>().unwrap(), Color::LightBlue);
        assert_eq!(
            "chartreuse".parse::<Color>(),
            Err(CanvasError::UnknownColor("chartreuse".into()))
        );
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Color::LightGray).unwrap();
        assert_eq!(json, "\"lightgray\"");
        let back: Color = serde_json::from_str("\"magenta\"").unwrap();
        assert_eq!(back, Color::Magenta);
    }
}
