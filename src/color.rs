//! Status colors and color sets
//!
//! Colors are ordered by severity. The declaration order below is the
//! ordering used everywhere a "worse" color has to be picked:
//!
//! ```text
//! green < clear < blue < purple < yellow < red
//! ```
//!
//! `clear` and `blue` rank just above green because they mean "no data" and
//! "disabled"; purple (stale) ranks below the real problem colors so a
//! yellow or red report always wins over staleness.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BoardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Green,
    Clear,
    Blue,
    Purple,
    Yellow,
    Red,
}

impl Color {
    pub const ALL: [Color; 6] = [
        Color::Green,
        Color::Clear,
        Color::Blue,
        Color::Purple,
        Color::Yellow,
        Color::Red,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Color::Green => "green",
            Color::Clear => "clear",
            Color::Blue => "blue",
            Color::Purple => "purple",
            Color::Yellow => "yellow",
            Color::Red => "red",
        }
    }

    /// Parse a color name, ignoring case. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Color> {
        Color::ALL
            .into_iter()
            .find(|color| color.name().eq_ignore_ascii_case(name.trim()))
    }

    /// The more severe of two colors.
    pub fn worst(self, other: Color) -> Color {
        self.max(other)
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Color {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Color::parse(s).ok_or_else(|| BoardError::UnknownColor(s.to_string()))
    }
}

/// A set of colors stored as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Color>", into = "Vec<Color>")]
pub struct ColorSet(u8);

impl ColorSet {
    /// Colors that put a status into alert state unless configured otherwise.
    pub const DEFAULT_ALERT: ColorSet = ColorSet(
        (1 << Color::Red as u8) | (1 << Color::Yellow as u8) | (1 << Color::Purple as u8),
    );

    /// Colors that count as recovered.
    pub const DEFAULT_OK: ColorSet =
        ColorSet((1 << Color::Green as u8) | (1 << Color::Clear as u8) | (1 << Color::Blue as u8));

    pub const fn empty() -> Self {
        ColorSet(0)
    }

    pub fn of(colors: &[Color]) -> Self {
        colors.iter().copied().collect()
    }

    pub fn contains(self, color: Color) -> bool {
        self.0 & color.bit() != 0
    }

    pub fn insert(&mut self, color: Color) {
        self.0 |= color.bit();
    }

    pub fn remove(&mut self, color: Color) {
        self.0 &= !color.bit();
    }

    pub fn union(self, other: ColorSet) -> ColorSet {
        ColorSet(self.0 | other.0)
    }

    pub fn intersection(self, other: ColorSet) -> ColorSet {
        ColorSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Color> {
        Color::ALL.into_iter().filter(move |c| self.contains(*c))
    }

    /// Parse a comma-separated color list such as `red,yellow`.
    pub fn parse_list(list: &str) -> Result<ColorSet, BoardError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Color::from_str)
            .collect()
    }
}

impl FromIterator<Color> for ColorSet {
    fn from_iter<I: IntoIterator<Item = Color>>(iter: I) -> Self {
        let mut set = ColorSet::empty();
        for color in iter {
            set.insert(color);
        }
        set
    }
}

impl From<Vec<Color>> for ColorSet {
    fn from(colors: Vec<Color>) -> Self {
        colors.into_iter().collect()
    }
}

impl From<ColorSet> for Vec<Color> {
    fn from(set: ColorSet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Debug for ColorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for ColorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Color::name).collect();
        f.write_str(&names.join(","))
    }
}
