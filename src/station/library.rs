//! Media library: the station's track inventory.
//!
//! Walks the music root once at startup. Files under any path component
//! containing `holiday` (case-insensitive) form the holiday pool; the
//! rest are regular rotation.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{AppError, Result};

const AUDIO_EXTENSIONS: [&str; 2] = ["mp3", "wav"];

#[derive(Debug, Clone)]
pub struct MediaLibrary {
    pub regular_tracks: Vec<PathBuf>,
    pub holiday_tracks: Vec<PathBuf>,
}

impl MediaLibrary {
    pub fn load(music_path: &Path) -> Result<Self> {
        if !music_path.is_dir() {
            return Err(AppError::Config(format!(
                "music path is not a directory: {}",
                music_path.display()
            )));
        }

        let mut regular_tracks = Vec::new();
        let mut holiday_tracks = Vec::new();
        let walker = WalkDir::new(music_path)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable library entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !has_audio_extension(entry.path()) {
                continue;
            }
            if is_holiday_path(entry.path()) {
                holiday_tracks.push(entry.into_path());
            } else {
                regular_tracks.push(entry.into_path());
            }
        }

        regular_tracks.sort();
        holiday_tracks.sort();

        tracing::info!(
            regular = regular_tracks.len(),
            holiday = holiday_tracks.len(),
            "media library loaded"
        );

        if regular_tracks.is_empty() && holiday_tracks.is_empty() {
            return Err(AppError::Config(format!(
                "no playable tracks under {}",
                music_path.display()
            )));
        }

        Ok(Self {
            regular_tracks,
            holiday_tracks,
        })
    }

    pub fn len(&self) -> usize {
        self.regular_tracks.len() + self.holiday_tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether any path component marks this track as holiday rotation.
pub fn is_holiday_path(path: &Path) -> bool {
    path.to_string_lossy().to_lowercase().contains("holiday")
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn has_audio_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn splits_holiday_and_regular_pools() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("rock/a.mp3"));
        touch(&dir.path().join("rock/b.wav"));
        touch(&dir.path().join("Holiday/jingle.mp3"));
        touch(&dir.path().join("rock/notes.txt"));
        touch(&dir.path().join(".hidden/skip.mp3"));

        let library = MediaLibrary::load(dir.path()).unwrap();
        assert_eq!(library.regular_tracks.len(), 2);
        assert_eq!(library.holiday_tracks.len(), 1);
    }

    #[test]
    fn empty_library_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MediaLibrary::load(dir.path()).is_err());
    }
}
