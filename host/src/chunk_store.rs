use std::{collections::{BTreeMap, BTreeSet}, fs, path::{Path, PathBuf}};

use anyhow::{bail, Context};
use chrono::Utc;
use msgs::{
    chunk::{ChunkCoordinate, ChunkState, CompletionStatus},
    model::check_chunk_count,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const ROWS_PER_CHUNK: u8 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredChunk {
    pub status: CompletionStatus,
    /// Block rows (0..16) already placed.
    pub completed_rows: Vec<u8>,
}

/// Where chunk progress lives between sessions. The host seeds from it at
/// startup and writes back on save and shutdown.
pub trait ChunkDataProvider {
    fn coordinates(&self) -> Vec<ChunkCoordinate>;
    fn read_chunk(&self, coordinate: &ChunkCoordinate) -> anyhow::Result<StoredChunk>;
    fn write_chunk(&mut self, coordinate: &ChunkCoordinate, status: CompletionStatus) -> anyhow::Result<()>;

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reads every chunk the provider knows. Fails when the map is too large
/// to ship as a single snapshot.
pub fn load_states(provider: &dyn ChunkDataProvider) -> anyhow::Result<Vec<ChunkState>> {
    let coordinates = provider.coordinates();
    check_chunk_count(coordinates.len())?;
    coordinates
        .into_iter()
        .map(|coordinate| {
            let stored = provider.read_chunk(&coordinate)?;
            Ok(ChunkState::new(coordinate, stored.status))
        })
        .collect()
}

fn grid(rows: u16, columns: u16) -> impl Iterator<Item = ChunkCoordinate> {
    (0..rows).flat_map(move |r| (0..columns).map(move |c| ChunkCoordinate::new(r, c)))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProgressFile {
    #[serde(default)]
    completed_rows: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    completed_chunks: Vec<String>,
    #[serde(default)]
    last_modified: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    partial_chunks: Vec<String>,
}

/// Progress file keyed by chunk reference (`"C4"`), one grid per project.
pub struct JsonChunkStore {
    path: PathBuf,
    rows: u16,
    columns: u16,
    progress: ProgressFile,
}

impl JsonChunkStore {
    pub fn open(path: impl AsRef<Path>, rows: u16, columns: u16) -> anyhow::Result<JsonChunkStore> {
        check_chunk_count(rows as usize * columns as usize)
            .with_context(|| format!("a {rows}x{columns} grid is too large"))?;
        let path = path.as_ref().to_path_buf();
        let progress = if path.exists() {
            let contents = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("progress file {} is corrupted", path.display()))?
        }
        else {
            info!("no progress file at {}, starting empty", path.display());
            ProgressFile::default()
        };
        Ok(JsonChunkStore { path, rows, columns, progress })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkDataProvider for JsonChunkStore {
    fn coordinates(&self) -> Vec<ChunkCoordinate> {
        let mut coordinates: BTreeSet<ChunkCoordinate> = grid(self.rows, self.columns).collect();
        let recorded = self.progress.completed_rows.keys()
            .chain(self.progress.completed_chunks.iter())
            .chain(self.progress.partial_chunks.iter());
        for reference in recorded {
            match ChunkCoordinate::from_reference(reference) {
                Ok(coordinate) => {
                    coordinates.insert(coordinate);
                }
                Err(e) => warn!("skipping progress entry {reference:?}: {e}"),
            }
        }
        coordinates.into_iter().collect()
    }

    fn read_chunk(&self, coordinate: &ChunkCoordinate) -> anyhow::Result<StoredChunk> {
        let reference = coordinate.reference();
        let mut completed_rows = self.progress.completed_rows.get(&reference).cloned().unwrap_or_default();
        completed_rows.sort_unstable();
        completed_rows.dedup();
        if let Some(row) = completed_rows.iter().find(|row| **row >= ROWS_PER_CHUNK) {
            bail!("chunk {reference} has out of range row {row}");
        }

        let status = if self.progress.completed_chunks.contains(&reference) || completed_rows.len() == ROWS_PER_CHUNK as usize {
            CompletionStatus::Complete
        }
        else if !completed_rows.is_empty() || self.progress.partial_chunks.contains(&reference) {
            CompletionStatus::Partial
        }
        else {
            CompletionStatus::Empty
        };
        Ok(StoredChunk { status, completed_rows })
    }

    fn write_chunk(&mut self, coordinate: &ChunkCoordinate, status: CompletionStatus) -> anyhow::Result<()> {
        let reference = coordinate.reference();
        let progress = &mut self.progress;
        progress.completed_chunks.retain(|r| *r != reference);
        progress.partial_chunks.retain(|r| *r != reference);

        match status {
            CompletionStatus::Complete => {
                progress.completed_chunks.push(reference.clone());
                progress.completed_rows.insert(reference.clone(), (0..ROWS_PER_CHUNK).collect());
            }
            CompletionStatus::Partial => {
                let rows = progress.completed_rows.get(&reference).map(Vec::len).unwrap_or(0);
                if rows == ROWS_PER_CHUNK as usize {
                    progress.completed_rows.remove(&reference);
                }
                if rows == 0 || rows == ROWS_PER_CHUNK as usize {
                    progress.partial_chunks.push(reference.clone());
                }
            }
            CompletionStatus::Empty => {
                progress.completed_rows.remove(&reference);
            }
        }
        progress.last_modified.insert(reference, Utc::now().to_rfc3339());
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.progress)?;
        fs::write(&self.path, json).with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: BTreeMap<ChunkCoordinate, StoredChunk>,
}

impl MemoryChunkStore {
    pub fn with_grid(rows: u16, columns: u16) -> MemoryChunkStore {
        MemoryChunkStore {
            chunks: grid(rows, columns).map(|c| (c, StoredChunk::default())).collect(),
        }
    }
}

impl ChunkDataProvider for MemoryChunkStore {
    fn coordinates(&self) -> Vec<ChunkCoordinate> {
        self.chunks.keys().copied().collect()
    }

    fn read_chunk(&self, coordinate: &ChunkCoordinate) -> anyhow::Result<StoredChunk> {
        self.chunks.get(coordinate).cloned().with_context(|| format!("no chunk at {coordinate}"))
    }

    fn write_chunk(&mut self, coordinate: &ChunkCoordinate, status: CompletionStatus) -> anyhow::Result<()> {
        let chunk = self.chunks.entry(*coordinate).or_default();
        chunk.status = status;
        chunk.completed_rows = match status {
            CompletionStatus::Complete => (0..ROWS_PER_CHUNK).collect(),
            CompletionStatus::Empty => Vec::new(),
            CompletionStatus::Partial => std::mem::take(&mut chunk.completed_rows),
        };
        Ok(())
    }
}
