//! GPIO header label to logical line mapping.
//!
//! Single source of truth for the 40-pin header: every settings field that
//! names a line (lamp drive, LED1/LED2, scale DAT/CLK) is resolved through
//! [`PIN_TABLE`]. The labels are the exact strings stored in settings files,
//! so the table must not be reworded.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Selection value meaning "no line chosen".
pub const NO_SELECTION: &str = "None";
/// Lamp selection meaning the lamp is switched by something other than a GPIO line.
pub const EXTERNAL_SOURCE: &str = "External source";

/// Header label → logical (BCM) line number. 26 entries, lines 2 through 27.
pub static PIN_TABLE: [(&str, u8); 26] = [
    ("GPIO2 (Pin 3)", 2),
    ("GPIO3 (Pin 5)", 3),
    ("GPIO4 (Pin 7)", 4),
    ("GPIO5 (Pin 29)", 5),
    ("GPIO6 (Pin 31)", 6),
    ("GPIO7 (Pin 26)", 7),
    ("GPIO8 (Pin 24)", 8),
    ("GPIO9 (Pin 21)", 9),
    ("GPIO10 (Pin 19)", 10),
    ("GPIO11 (Pin 23)", 11),
    ("GPIO12 (Pin 32)", 12),
    ("GPIO13 (Pin 33)", 13),
    ("GPIO14 (Pin 8)", 14),
    ("GPIO15 (Pin 10)", 15),
    ("GPIO16 (Pin 36)", 16),
    ("GPIO17 (Pin 11)", 17),
    ("GPIO18 (Pin 12)", 18),
    ("GPIO19 (Pin 35)", 19),
    ("GPIO20 (Pin 38)", 20),
    ("GPIO21 (Pin 40)", 21),
    ("GPIO22 (Pin 15)", 22),
    ("GPIO23 (Pin 16)", 23),
    ("GPIO24 (Pin 18)", 24),
    ("GPIO25 (Pin 22)", 25),
    ("GPIO26 (Pin 37)", 26),
    ("GPIO27 (Pin 13)", 27),
];

/// A logical GPIO line resolved from the pin table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinePin(u8);

impl LinePin {
    /// Resolves a header label such as `"GPIO17 (Pin 11)"`.
    pub fn from_label(label: &str) -> Option<Self> {
        PIN_TABLE
            .iter()
            .find(|(name, _)| *name == label)
            .map(|&(_, line)| LinePin(line))
    }

    /// Wraps a raw line number if it appears in the table.
    pub fn from_line(line: u8) -> Option<Self> {
        PIN_TABLE
            .iter()
            .any(|&(_, l)| l == line)
            .then_some(LinePin(line))
    }

    /// Logical line number.
    pub fn line(self) -> u8 {
        self.0
    }

    /// Header label for this line.
    pub fn label(self) -> &'static str {
        PIN_TABLE
            .iter()
            .find(|&&(_, l)| l == self.0)
            .map(|&(name, _)| name)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for LinePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Outcome of reading a pin selection field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinSelection {
    /// `"None"`, `"External source"` or blank.
    NotChosen,
    /// A label found in the table.
    Line(LinePin),
    /// Anything else.
    Unknown,
}

/// Classifies a selection string from a settings file.
pub fn select(label: &str) -> PinSelection {
    let label = label.trim();
    if label.is_empty() || label == NO_SELECTION || label == EXTERNAL_SOURCE {
        return PinSelection::NotChosen;
    }
    match LinePin::from_label(label) {
        Some(pin) => PinSelection::Line(pin),
        None => PinSelection::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_covers_lines_2_to_27_once() {
        let lines: HashSet<u8> = PIN_TABLE.iter().map(|&(_, l)| l).collect();
        assert_eq!(PIN_TABLE.len(), 26);
        assert_eq!(lines, (2..=27).collect::<HashSet<u8>>());
    }

    #[test]
    fn labels_resolve() {
        assert_eq!(LinePin::from_label("GPIO2 (Pin 3)").map(LinePin::line), Some(2));
        assert_eq!(LinePin::from_label("GPIO27 (Pin 13)").map(LinePin::line), Some(27));
        assert_eq!(LinePin::from_label("GPIO17 (Pin 11)").map(LinePin::line), Some(17));
        assert!(LinePin::from_label("GPIO28 (Pin 99)").is_none());
    }

    #[test]
    fn label_round_trip() {
        for &(label, line) in PIN_TABLE.iter() {
            let pin = LinePin::from_line(line).unwrap();
            assert_eq!(pin.label(), label);
        }
        assert!(LinePin::from_line(1).is_none());
    }

    #[test]
    fn selection_sentinels() {
        assert_eq!(select("None"), PinSelection::NotChosen);
        assert_eq!(select("External source"), PinSelection::NotChosen);
        assert_eq!(select(""), PinSelection::NotChosen);
        assert_eq!(select("GPIO9 (Pin 21)"), PinSelection::Line(LinePin(9)));
        assert_eq!(select("pin nine"), PinSelection::Unknown);
    }
}
