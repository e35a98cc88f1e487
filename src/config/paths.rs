//! Canonical default paths for voicebot state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! | Location | Purpose |
//! |----------|---------|
//! | `~/.voicebot/` | Engine home |
//! | `<home>/voicebot.sqlite` | Session/message document store |
//! | `<home>/queues/` | JSONL job queues |
//! | `<home>/staging/` | Downloaded audio awaiting transcription |

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Name of the per-project config directory
pub const CONFIG_DIR: &str = ".voicebot";

/// Name of the config file inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "config.yaml";

/// Default home directory (~/.voicebot)
pub fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR))
}

/// Document store file under a home directory
pub fn database(home: &Path) -> PathBuf {
    home.join("voicebot.sqlite")
}

/// Queue directory under a home directory
pub fn queues(home: &Path) -> PathBuf {
    home.join("queues")
}

/// Staging directory for downloaded audio under a home directory
pub fn staging(home: &Path) -> PathBuf {
    home.join("staging")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_hang_off_home() {
        let home = PathBuf::from("/srv/voicebot");
        assert_eq!(database(&home), PathBuf::from("/srv/voicebot/voicebot.sqlite"));
        assert_eq!(queues(&home), PathBuf::from("/srv/voicebot/queues"));
        assert_eq!(staging(&home), PathBuf::from("/srv/voicebot/staging"));
    }

    #[test]
    fn test_default_home_is_dot_dir() {
        if let Ok(home) = default_home() {
            assert!(home.ends_with(CONFIG_DIR));
        }
    }
}
