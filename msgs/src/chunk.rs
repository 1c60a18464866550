use std::{fmt, str::FromStr};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Position of one chunk in the map grid.
///
/// Ordering is by row, then column, so maps keyed by coordinate iterate
/// the grid deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoordinate {
    pub row: u16,
    pub column: u16,
}

impl ChunkCoordinate {
    pub fn new(row: u16, column: u16) -> ChunkCoordinate {
        ChunkCoordinate { row, column }
    }

    /// Spreadsheet style label: row letters, 1-based column. `(2, 3)` is `C4`.
    pub fn reference(&self) -> String {
        let mut letters = Vec::new();
        let mut n = self.row as u32 + 1;
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push(b'A' + rem as u8);
            n = (n - 1) / 26;
        }
        letters.reverse();
        let letters = String::from_utf8_lossy(&letters);
        format!("{letters}{}", self.column as u32 + 1)
    }

    pub fn from_reference(reference: &str) -> anyhow::Result<ChunkCoordinate> {
        let reference = reference.trim();
        let split = reference.find(|c: char| c.is_ascii_digit()).context("chunk reference has no column number")?;
        let (letters, digits) = reference.split_at(split);
        if letters.is_empty() {
            bail!("chunk reference has no row letters: {reference}");
        }
        let mut row: u32 = 0;
        for c in letters.chars() {
            if !c.is_ascii_alphabetic() {
                bail!("invalid row letter {c:?} in {reference}");
            }
            row = row * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
            if row > u16::MAX as u32 + 1 {
                bail!("row out of range in {reference}");
            }
        }
        let column: u32 = digits.parse().with_context(|| format!("invalid column in {reference}"))?;
        if column == 0 || column > u16::MAX as u32 + 1 {
            bail!("column out of range in {reference}");
        }
        Ok(ChunkCoordinate::new((row - 1) as u16, (column - 1) as u16))
    }
}

impl fmt::Display for ChunkCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.column)
    }
}

/// Accepts either `C4` or `2,3`.
impl FromStr for ChunkCoordinate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('(').trim_end_matches(')');
        match s.split_once(',') {
            Some((row, column)) => {
                let row = row.trim().parse().with_context(|| format!("invalid row in {s}"))?;
                let column = column.trim().parse().with_context(|| format!("invalid column in {s}"))?;
                Ok(ChunkCoordinate::new(row, column))
            }
            None => ChunkCoordinate::from_reference(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    #[default]
    Empty,
    Partial,
    Complete,
}

impl CompletionStatus {
    pub fn from_u8(index: u8) -> Option<CompletionStatus> {
        match index {
            0 => Some(CompletionStatus::Empty),
            1 => Some(CompletionStatus::Partial),
            2 => Some(CompletionStatus::Complete),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            CompletionStatus::Empty => 0,
            CompletionStatus::Partial => 1,
            CompletionStatus::Complete => 2,
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletionStatus::Empty => "empty",
            CompletionStatus::Partial => "partial",
            CompletionStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

impl FromStr for CompletionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "empty" | "e" => Ok(CompletionStatus::Empty),
            "partial" | "p" => Ok(CompletionStatus::Partial),
            "complete" | "c" | "done" => Ok(CompletionStatus::Complete),
            other => bail!("unknown completion status: {other}"),
        }
    }
}

/// Completion state of one chunk. The host owns the canonical copy; every
/// accepted mutation bumps `version` by exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkState {
    pub coordinate: ChunkCoordinate,
    pub status: CompletionStatus,
    pub version: u64,
    pub last_modified_by: Option<PeerId>,
}

impl ChunkState {
    pub fn new(coordinate: ChunkCoordinate, status: CompletionStatus) -> ChunkState {
        ChunkState {
            coordinate,
            status,
            version: 0,
            last_modified_by: None,
        }
    }
}
