use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;

use crate::project::{ProjectOptions, default_projects_root};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Shared cache directory. Empty keeps caches inside each project.
    #[serde(default)]
    pub root: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ProjectsConfig {
    /// Where project directories live. Empty means `~/.claude/projects`.
    #[serde(default)]
    pub root: String,
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: String::new(),
        }
    }
}

thread_local! {
    static TEST_CONFIG_PATH: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
pub fn set_test_config_path(path: PathBuf) {
    TEST_CONFIG_PATH.with(|p| *p.borrow_mut() = Some(path));
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        #[cfg(test)]
        {
            if let Some(path) = TEST_CONFIG_PATH.with(|p| p.borrow().clone()) {
                return Ok(path);
            }
        }

        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".claude-code-log.toml"))
    }

    pub fn load() -> Result<Option<Config>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Some(config))
    }

    /// The config file if present, defaults otherwise.
    pub fn load_or_default() -> Result<Config> {
        Ok(Self::load()?.unwrap_or_default())
    }

    pub fn save(&self, silent: bool) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        if !silent {
            println!("✅ Configuration saved to: {}", config_path.display());
        }

        Ok(())
    }

    pub fn cache_root(&self) -> Option<PathBuf> {
        non_empty_path(&self.cache.root)
    }

    pub fn projects_root(&self) -> Result<PathBuf> {
        match non_empty_path(&self.projects.root) {
            Some(root) => Ok(root),
            None => default_projects_root(),
        }
    }

    /// Manager options for this configuration. `no_cache` forces parsing.
    pub fn project_options(&self, no_cache: bool) -> ProjectOptions {
        ProjectOptions {
            cache_root: self.cache_root(),
            use_cache: self.cache.enabled && !no_cache,
            ..ProjectOptions::default()
        }
    }
}

fn non_empty_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(raw)),
    }
}

// CLI helper functions
pub fn create_default_config(overwrite: bool) -> Result<()> {
    let config = Config::default();
    if !std::fs::exists(Config::config_path()?)? || overwrite {
        config.save(true)?;

        println!("📝 Created default configuration file.");
        println!("📍 {}", Config::config_path()?.display());
    } else {
        println!("Configuration already exists.  Pass `--overwrite` to overwrite.");
    }

    Ok(())
}

pub fn show_config() -> Result<()> {
    match Config::load()? {
        Some(config) => {
            let or_default = |value: &str, fallback: &str| {
                if value.is_empty() {
                    fallback.to_string()
                } else {
                    value.to_string()
                }
            };
            println!("🔧 Current configuration:");
            println!("   Cache Enabled: {}", config.cache.enabled);
            println!(
                "   Cache Root: {}",
                or_default(&config.cache.root, "(per project)")
            );
            println!(
                "   Projects Root: {}",
                or_default(&config.projects.root, "~/.claude/projects")
            );
        }
        None => {
            println!("❌ No configuration file found.");
            println!("   Run 'claude-code-log config init' to create one.");
        }
    }
    Ok(())
}

pub fn set_config_value(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();

    match key {
        "cache-enabled" => {
            config.cache.enabled = value
                .parse::<bool>()
                .context("Invalid boolean value. Use 'true' or 'false'")?;
        }
        "cache-root" => config.cache.root = value.to_string(),
        "projects-root" => config.projects.root = value.to_string(),
        _ => anyhow::bail!("Unknown config key: {}", key),
    }

    config.save(false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_config() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("tempdir");
        let config_path = dir.path().join(".claude-code-log.toml");
        set_test_config_path(config_path.clone());
        (dir, config_path)
    }

    #[test]
    fn missing_config_means_defaults() {
        let (_dir, _path) = setup_test_config();
        assert!(Config::load().expect("load").is_none());

        let config = Config::load_or_default().expect("defaults");
        assert!(config.cache.enabled);
        assert_eq!(config.cache_root(), None);
    }

    #[test]
    fn default_config_round_trip() {
        let (_dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        let loaded = Config::load()
            .expect("load config")
            .expect("config should exist");
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let (_dir, path) = setup_test_config();
        fs::write(&path, "[cache]\nroot = \"/tmp/ccl\"\n").unwrap();

        let config = Config::load().unwrap().unwrap();
        assert!(config.cache.enabled);
        assert_eq!(config.cache_root(), Some(PathBuf::from("/tmp/ccl")));
        assert_eq!(config.projects.root, "");
    }

    #[test]
    fn malformed_config_is_an_error() {
        let (_dir, path) = setup_test_config();
        fs::write(&path, "[cache\nenabled = ").unwrap();

        let err = Config::load().unwrap_err();
        assert!(format!("{err}").contains("Failed to parse config file"));
    }

    #[test]
    fn project_options_respect_switches() {
        let mut config = Config::default();
        assert!(config.project_options(false).use_cache);
        assert!(!config.project_options(true).use_cache);

        config.cache.enabled = false;
        assert!(!config.project_options(false).use_cache);
    }

    #[test]
    fn set_config_value_behaviour() {
        let (_dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        set_config_value("cache-enabled", "false").expect("set cache-enabled");
        set_config_value("cache-root", "/var/cache/ccl").expect("set cache-root");
        set_config_value("projects-root", "/data/projects").expect("set projects-root");

        let cfg = Config::load()
            .expect("load config")
            .expect("config should exist");
        assert!(!cfg.cache.enabled);
        assert_eq!(cfg.cache_root(), Some(PathBuf::from("/var/cache/ccl")));
        assert_eq!(cfg.projects_root().unwrap(), PathBuf::from("/data/projects"));

        let err = set_config_value("unknown-key", "value").unwrap_err();
        assert!(format!("{err}").contains("Unknown config key"));
        let err = set_config_value("cache-enabled", "maybe").unwrap_err();
        assert!(format!("{err}").contains("Invalid boolean value"));
    }
}
