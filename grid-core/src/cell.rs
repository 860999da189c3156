//! Cell coordinates and spreadsheet-style labels.
//!
//! Columns use bijective base-26 letters (`A..Z`, `AA..AZ`, `BA..`) and rows
//! are 1-based on the wire, so `(row 0, col 0)` is `A1` and `(row 2, col 27)`
//! is `AB3`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GridError;

/// Zero-based `(row, col)` coordinate of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Spreadsheet label for this cell, e.g. `B3` for `(2, 1)`.
    ///
    /// This is also the default value a freshly seeded cell holds.
    pub fn label(&self) -> String {
        format!("{}{}", column_label(self.col), u64::from(self.row) + 1)
    }

    /// Parse a label such as `C7` or `aa12` (case-insensitive).
    pub fn parse(label: &str) -> Result<Self, GridError> {
        let err = || GridError::ParseCell(label.to_string());

        let split = label
            .find(|c: char| !c.is_ascii_alphabetic())
            .ok_or_else(err)?;
        let (letters, digits) = label.split_at(split);
        if letters.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }

        let mut col: u64 = 0;
        for b in letters.bytes() {
            let digit = u64::from(b.to_ascii_uppercase() - b'A' + 1);
            col = col
                .checked_mul(26)
                .and_then(|c| c.checked_add(digit))
                .filter(|c| *c <= u64::from(u32::MAX))
                .ok_or_else(err)?;
        }

        let row: u64 = digits.parse().map_err(|_| err())?;
        if row == 0 || row > u64::from(u32::MAX) {
            return Err(err());
        }

        Ok(Self {
            row: (row - 1) as u32,
            col: (col - 1) as u32,
        })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for CellRef {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<(u32, u32)> for CellRef {
    fn from((row, col): (u32, u32)) -> Self {
        Self { row, col }
    }
}

/// Column letters for a zero-based column index.
pub fn column_label(col: u32) -> String {
    let mut n = u64::from(col) + 1;
    let mut out = Vec::new();
    while n > 0 {
        n -= 1;
        out.push(b'A' + (n % 26) as u8);
        n /= 26;
    }
    out.reverse();
    // Only ASCII uppercase letters were pushed.
    String::from_utf8(out).unwrap_or_default()
}
