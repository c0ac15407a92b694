use crate::config::schema::{webauto_home, AppConfig};
use crate::error::{Result, WebautoError};
use std::fs;
use std::path::PathBuf;

/// Configuration file lives next to the rest of the runtime state.
pub fn get_config_path() -> PathBuf {
    webauto_home().join("config.toml")
}

/// Load configuration from file, creating default if not exists.
/// Environment overrides are applied after the file is read.
pub fn load_config() -> Result<AppConfig> {
    let config_path = get_config_path();

    let mut config = if config_path.exists() {
        let content = fs::read_to_string(&config_path).map_err(|e| {
            WebautoError::Config(format!(
                "Failed to read config from {:?}: {}",
                config_path, e
            ))
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        tracing::info!("Loaded config from {:?}", config_path);
        config
    } else {
        tracing::info!(
            "Config file not found at {:?}, creating default",
            config_path
        );
        init_config()?
    };

    config.apply_env();
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig) -> Result<()> {
    let config_path = get_config_path();

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            WebautoError::Config(format!(
                "Failed to create config directory {:?}: {}",
                parent, e
            ))
        })?;
    }

    let content = toml::to_string_pretty(config)?;

    fs::write(&config_path, content).map_err(|e| {
        WebautoError::Config(format!("Failed to write config to {:?}: {}", config_path, e))
    })?;

    tracing::info!("Saved config to {:?}", config_path);
    Ok(())
}

/// Initialize default configuration and save to file
pub fn init_config() -> Result<AppConfig> {
    let config = AppConfig::default();
    save_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path() {
        let path = get_config_path();
        assert!(path.ends_with("config.toml"));
    }
}
