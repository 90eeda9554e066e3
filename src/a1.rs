//! A1 reference parsing.
//!
//! Accepted forms: `A1`, `A1:B2`, `Sheet!A1`, `'Sheet With Space'!A1:C3`
//! (single-quoted sheet names escape inner quotes by doubling). Rows are
//! 1-based, columns are 1–3 letters `A`–`Z`. The host only validates shape
//! and size here; unknown sheet names are the spreadsheet layer's problem.

use crate::error::{Error, Result};
use std::fmt;

/// Largest column expressible with three letters (`ZZZ`).
pub const MAX_COLUMN: u32 = 26 * 26 * 26 + 26 * 26 + 26;

/// A single cell, 1-based in both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    #[must_use]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_index_to_letters(self.col), self.row)
    }
}

/// A parsed A1 reference: optional sheet plus an inclusive cell rectangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRef {
    pub sheet: Option<String>,
    pub start: CellRef,
    pub end: CellRef,
}

impl RangeRef {
    /// Parse an A1 reference, normalizing the rectangle so that
    /// `start` is the top-left corner.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::validation("empty A1 reference"));
        }

        let (sheet, rest) = split_sheet(input)?;
        let (first, second) = match rest.split_once(':') {
            Some((a, b)) => (a, Some(b)),
            None => (rest, None),
        };

        let start = parse_cell(first)?;
        let end = match second {
            Some(cell) => parse_cell(cell)?,
            None => start,
        };

        Ok(Self {
            sheet,
            start: CellRef::new(start.row.min(end.row), start.col.min(end.col)),
            end: CellRef::new(start.row.max(end.row), start.col.max(end.col)),
        })
    }

    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    #[must_use]
    pub const fn cols(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    /// Number of cells covered by the rectangle.
    #[must_use]
    pub const fn cell_count(&self) -> u64 {
        self.rows() as u64 * self.cols() as u64
    }

    #[must_use]
    pub fn is_single_cell(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for RangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sheet) = &self.sheet {
            if needs_quoting(sheet) {
                write!(f, "'{}'!", sheet.replace('\'', "''"))?;
            } else {
                write!(f, "{sheet}!")?;
            }
        }
        if self.is_single_cell() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

fn needs_quoting(sheet: &str) -> bool {
    sheet.chars().any(|c| !c.is_ascii_alphanumeric() && c != '_')
}

/// Split off an optional `Sheet!` prefix, handling quoted names.
fn split_sheet(input: &str) -> Result<(Option<String>, &str)> {
    if let Some(rest) = input.strip_prefix('\'') {
        // Quoted sheet name; '' is a literal quote.
        let mut name = String::new();
        let mut chars = rest.char_indices();
        loop {
            let Some((idx, c)) = chars.next() else {
                return Err(Error::validation(format!(
                    "unterminated quoted sheet name in A1 reference: {input}"
                )));
            };
            if c != '\'' {
                name.push(c);
                continue;
            }
            match rest[idx + 1..].chars().next() {
                Some('\'') => {
                    name.push('\'');
                    chars.next();
                }
                Some('!') => {
                    if name.is_empty() {
                        return Err(Error::validation("empty sheet name in A1 reference"));
                    }
                    return Ok((Some(name), &rest[idx + 2..]));
                }
                _ => {
                    return Err(Error::validation(format!(
                        "expected '!' after quoted sheet name: {input}"
                    )));
                }
            }
        }
    }

    match input.split_once('!') {
        Some((sheet, rest)) => {
            if sheet.is_empty() {
                return Err(Error::validation("empty sheet name in A1 reference"));
            }
            if sheet.contains('\'') {
                return Err(Error::validation(format!(
                    "sheet names containing quotes must be quoted: {input}"
                )));
            }
            Ok((Some(sheet.to_string()), rest))
        }
        None => Ok((None, input)),
    }
}

fn parse_cell(cell: &str) -> Result<CellRef> {
    let letters_end = cell
        .char_indices()
        .find(|(_, c)| !c.is_ascii_uppercase())
        .map_or(cell.len(), |(i, _)| i);
    let (letters, digits) = cell.split_at(letters_end);

    if letters.is_empty() || letters.len() > 3 {
        return Err(Error::validation(format!(
            "invalid cell reference: {cell:?} (expected 1-3 column letters A-Z)"
        )));
    }
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::validation(format!(
            "invalid cell reference: {cell:?} (expected a 1-based row number)"
        )));
    }

    let row: u32 = digits
        .parse()
        .map_err(|_| Error::validation(format!("row out of range in cell reference: {cell:?}")))?;
    if row == 0 {
        return Err(Error::validation(format!(
            "rows are 1-based in cell reference: {cell:?}"
        )));
    }

    Ok(CellRef::new(row, column_letters_to_index(letters)))
}

/// `A` -> 1, `Z` -> 26, `AA` -> 27, … Caller guarantees 1-3 uppercase letters.
fn column_letters_to_index(letters: &str) -> u32 {
    letters
        .bytes()
        .fold(0u32, |acc, b| acc * 26 + u32::from(b - b'A') + 1)
}

/// Inverse of [`column_letters_to_index`].
#[must_use]
pub fn column_index_to_letters(mut col: u32) -> String {
    debug_assert!(col >= 1 && col <= MAX_COLUMN);
    let mut out = [0u8; 3];
    let mut len = 0;
    while col > 0 {
        col -= 1;
        out[len] = b'A' + (col % 26) as u8;
        col /= 26;
        len += 1;
    }
    out[..len].reverse();
    String::from_utf8_lossy(&out[..len]).into_owned()
}
