//! DJ asset discovery.
//!
//! Scans the DJ directory for intros, outros and announcements by file
//! naming convention and keeps an in-memory cache. Rescans run at most
//! once per hour, during THINK, so playout never waits on the
//! filesystem.
//!
//! Conventions (case-insensitive, `.mp3` only):
//! - `<songstem>_intro*.mp3` — intro for a specific song
//! - `<songstem>_outro*.mp3` / `<songstem>_outtro*.mp3` — outro
//!   (the double-t spelling is a historical artifact that stays accepted)
//! - `generic_intro*.mp3` / `generic_outro*.mp3`
//! - `announcements/startup*.mp3`, `announcements/shutdown*.mp3`,
//!   `announcements/legal_id*.mp3`, any other `announcements/*.mp3`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use walkdir::WalkDir;

#[derive(Debug, Default)]
pub struct AssetCache {
    pub intros_per_song: HashMap<String, Vec<PathBuf>>,
    pub outros_per_song: HashMap<String, Vec<PathBuf>>,
    pub generic_intros: Vec<PathBuf>,
    pub generic_outros: Vec<PathBuf>,
    pub startup_announcements: Vec<PathBuf>,
    pub shutdown_announcements: Vec<PathBuf>,
    pub legal_ids: Vec<PathBuf>,
    pub general_announcements: Vec<PathBuf>,
}

pub struct AssetDiscovery {
    dj_path: PathBuf,
    scan_interval: Duration,
    last_scan: Option<Instant>,
    cache: AssetCache,
}

impl AssetDiscovery {
    pub fn new(dj_path: &Path) -> Self {
        let mut discovery = Self {
            dj_path: dj_path.to_path_buf(),
            scan_interval: Duration::from_secs(3600),
            last_scan: None,
            cache: AssetCache::default(),
        };
        discovery.scan();
        discovery
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    /// Rescan when the interval has elapsed. Called from THINK.
    pub fn maybe_rescan(&mut self) {
        let due = self
            .last_scan
            .map(|t| t.elapsed() >= self.scan_interval)
            .unwrap_or(true);
        if due {
            self.scan();
        }
    }

    fn scan(&mut self) {
        self.last_scan = Some(Instant::now());
        self.cache = AssetCache::default();

        if !self.dj_path.is_dir() {
            tracing::warn!(path = %self.dj_path.display(), "DJ asset path does not exist");
            return;
        }

        let walker = WalkDir::new(&self.dj_path)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
            .filter_map(|e| e.ok());
        for entry in walker {
            if entry.file_type().is_file() {
                self.classify(entry.path());
            }
        }

        tracing::info!(
            song_intros = self.cache.intros_per_song.len(),
            song_outros = self.cache.outros_per_song.len(),
            generic_intros = self.cache.generic_intros.len(),
            generic_outros = self.cache.generic_outros.len(),
            startup = self.cache.startup_announcements.len(),
            shutdown = self.cache.shutdown_announcements.len(),
            legal_ids = self.cache.legal_ids.len(),
            "asset scan complete"
        );
    }

    /// Sort one discovered file into the cache by naming convention.
    fn classify(&mut self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        let lower = name.to_string_lossy().to_lowercase();
        if !lower.ends_with(".mp3") {
            return;
        }
        let path = path.to_path_buf();

        let in_announcements = path
            .parent()
            .and_then(|dir| dir.file_name())
            .map(|n| n.to_string_lossy().eq_ignore_ascii_case("announcements"))
            .unwrap_or(false);

        if in_announcements {
            if lower.starts_with("startup") {
                self.cache.startup_announcements.push(path);
            } else if lower.starts_with("shutdown") {
                self.cache.shutdown_announcements.push(path);
            } else if lower.starts_with("legal_id") {
                self.cache.legal_ids.push(path);
            } else {
                self.cache.general_announcements.push(path);
            }
            return;
        }

        if lower.starts_with("generic_intro") {
            self.cache.generic_intros.push(path);
        } else if lower.starts_with("generic_outro") || lower.starts_with("generic_outtro") {
            self.cache.generic_outros.push(path);
        } else if let Some(stem) = split_marker(&lower, "_intro") {
            self.cache
                .intros_per_song
                .entry(stem)
                .or_default()
                .push(path);
        } else if let Some(stem) =
            split_marker(&lower, "_outtro").or_else(|| split_marker(&lower, "_outro"))
        {
            self.cache
                .outros_per_song
                .entry(stem)
                .or_default()
                .push(path);
        }
    }

    /// Intros recorded for a song, matched by the song file's stem.
    pub fn intros_for(&self, song: &Path) -> &[PathBuf] {
        song_stem(song)
            .and_then(|stem| self.cache.intros_per_song.get(&stem))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn outros_for(&self, song: &Path) -> &[PathBuf] {
        song_stem(song)
            .and_then(|stem| self.cache.outros_per_song.get(&stem))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// `my_song_intro_2.mp3` -> `my_song`. The marker must appear after a
/// non-empty stem.
fn split_marker(lower_name: &str, marker: &str) -> Option<String> {
    let idx = lower_name.find(marker)?;
    if idx == 0 {
        return None;
    }
    Some(lower_name[..idx].to_string())
}

fn song_stem(song: &Path) -> Option<String> {
    song.file_stem().map(|s| s.to_string_lossy().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("take_me_home_intro.mp3"));
        touch(&root.join("take_me_home_intro_alt.mp3"));
        touch(&root.join("take_me_home_outtro.mp3"));
        touch(&root.join("country_roads_outro.mp3"));
        touch(&root.join("generic_intro_01.mp3"));
        touch(&root.join("generic_outro_01.mp3"));
        touch(&root.join("announcements/startup_morning.mp3"));
        touch(&root.join("announcements/shutdown_night.mp3"));
        touch(&root.join("announcements/legal_id_top.mp3"));
        touch(&root.join("announcements/weather.mp3"));
        touch(&root.join("notes.txt"));
        dir
    }

    #[test]
    fn discovers_per_song_assets_by_stem() {
        let dir = sample_tree();
        let discovery = AssetDiscovery::new(dir.path());

        let intros = discovery.intros_for(Path::new("/music/take_me_home.mp3"));
        assert_eq!(intros.len(), 2);

        // The historical double-t outro spelling still matches.
        let outros = discovery.outros_for(Path::new("/music/take_me_home.mp3"));
        assert_eq!(outros.len(), 1);

        let outros = discovery.outros_for(Path::new("/music/country_roads.mp3"));
        assert_eq!(outros.len(), 1);

        assert!(discovery.intros_for(Path::new("/music/unknown.mp3")).is_empty());
    }

    #[test]
    fn discovers_generic_and_announcement_pools() {
        let dir = sample_tree();
        let discovery = AssetDiscovery::new(dir.path());
        let cache = discovery.cache();
        assert_eq!(cache.generic_intros.len(), 1);
        assert_eq!(cache.generic_outros.len(), 1);
        assert_eq!(cache.startup_announcements.len(), 1);
        assert_eq!(cache.shutdown_announcements.len(), 1);
        assert_eq!(cache.legal_ids.len(), 1);
        assert_eq!(cache.general_announcements.len(), 1);
    }

    #[test]
    fn missing_dj_path_yields_empty_cache() {
        let discovery = AssetDiscovery::new(Path::new("/nope/nothing-here"));
        assert!(discovery.cache().generic_intros.is_empty());
    }
}
