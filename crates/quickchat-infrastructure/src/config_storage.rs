use quickchat_core::error::{ChatError, Result};
use quickchat_core::SyncSettings;
use std::fs;
use std::path::{Path, PathBuf};

/// Default settings file: `<config_dir>/quickchat/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("quickchat").join("config.toml"))
}

/// Loads sync settings from `path`, or from the default location when `None`.
///
/// # Returns
///
/// - `Ok(SyncSettings)`: Parsed and validated settings. A missing or empty
///   file, or an unknown config directory, yields the defaults.
/// - `Err(ChatError)`: The file exists but cannot be read, parsed or validated.
pub fn load_settings(path: Option<&Path>) -> Result<SyncSettings> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) => path,
            None => return Ok(SyncSettings::default()),
        },
    };

    if !config_path.exists() {
        tracing::debug!(
            "[ConfigStorage] No config at {:?}, using defaults",
            config_path
        );
        return Ok(SyncSettings::default());
    }

    let content = fs::read_to_string(&config_path).map_err(|e| {
        ChatError::config(format!(
            "Failed to read config file at {:?}: {}",
            config_path, e
        ))
    })?;

    if content.trim().is_empty() {
        return Ok(SyncSettings::default());
    }

    let settings: SyncSettings = toml::from_str(&content)?;
    settings.validate()?;
    tracing::debug!("[ConfigStorage] Loaded settings from {:?}", config_path);
    Ok(settings)
}

/// Writes `settings` to `path` as TOML, creating parent directories.
pub fn save_settings(path: &Path, settings: &SyncSettings) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
    }

    let toml_string = toml::to_string_pretty(settings).map_err(|e| ChatError::Serialization {
        format: "TOML".to_string(),
        message: e.to_string(),
    })?;

    fs::write(path, toml_string)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickchat_core::SendStrategy;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = load_settings(Some(&temp_dir.path().join("config.toml"))).unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
send_strategy = "atomic"
unknown_user_label = "Someone"
"#,
        )
        .unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.send_strategy, SendStrategy::Atomic);
        assert_eq!(settings.unknown_user_label, "Someone");
        assert_eq!(settings.message_window, 50);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "message_window = 0\n").unwrap();
        assert!(load_settings(Some(&path)).is_err());

        fs::write(&path, "message_window = \"many\"\n").unwrap();
        assert!(load_settings(Some(&path)).unwrap_err().is_serialization());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");
        let settings = SyncSettings {
            message_window: 20,
            ..SyncSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(Some(&path)).unwrap(), settings);
    }
}
