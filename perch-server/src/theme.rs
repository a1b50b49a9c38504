//! Process-wide dashboard theme, persisted to `<config-dir>/theme`

use crate::registry::THEME_FILE;
use parking_lot::RwLock;
use perch_core::Theme;
use std::path::{Path, PathBuf};

pub struct ThemeState {
    current: RwLock<Theme>,
    path: PathBuf,
}

impl ThemeState {
    /// Load the saved theme, falling back to `system`.
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(THEME_FILE);
        let current = match std::fs::read_to_string(&path) {
            Ok(saved) => saved.parse().unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "Ignoring saved theme: {}", e);
                Theme::default()
            }),
            Err(_) => Theme::default(),
        };
        Self {
            current: RwLock::new(current),
            path,
        }
    }

    pub fn get(&self) -> Theme {
        *self.current.read()
    }

    /// Update the theme and save it. A failed write is logged; the new
    /// theme still applies for this process.
    pub fn set(&self, theme: Theme) {
        *self.current.write() = theme;
        if let Err(e) = std::fs::write(&self.path, format!("{theme}\n")) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to save theme");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_to_system() {
        let dir = TempDir::new().unwrap();
        assert_eq!(ThemeState::load(dir.path()).get(), Theme::System);
    }

    #[test]
    fn set_persists_across_loads() {
        let dir = TempDir::new().unwrap();
        ThemeState::load(dir.path()).set(Theme::Dark);
        assert_eq!(ThemeState::load(dir.path()).get(), Theme::Dark);
    }

    #[test]
    fn garbage_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("theme"), "purple").unwrap();
        assert_eq!(ThemeState::load(dir.path()).get(), Theme::System);
    }

    #[test]
    fn unwritable_dir_still_updates_in_memory() {
        let state = ThemeState::load(Path::new("/no/such/perch/dir"));
        state.set(Theme::Light);
        assert_eq!(state.get(), Theme::Light);
    }
}
