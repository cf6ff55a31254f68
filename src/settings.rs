use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tiles::{DEFAULT_CACHE_SIZE, DEFAULT_WORKERS, ServiceConfig, TilingConfig};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pagetiles";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub tiling: TilingConfig,

    /// Trailing-edge throttle for scroll snapshots
    #[serde(default = "default_scroll_throttle_ms")]
    pub scroll_throttle_ms: u64,

    #[serde(default = "default_render_workers")]
    pub render_workers: usize,

    /// 0 disables render timeouts
    #[serde(default = "default_render_timeout_ms")]
    pub render_timeout_ms: u64,

    #[serde(default = "default_bitmap_cache_size")]
    pub bitmap_cache_size: usize,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_scroll_throttle_ms() -> u64 {
    50
}

fn default_render_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_render_timeout_ms() -> u64 {
    5000
}

fn default_bitmap_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            tiling: TilingConfig::default(),
            scroll_throttle_ms: default_scroll_throttle_ms(),
            render_workers: default_render_workers(),
            render_timeout_ms: default_render_timeout_ms(),
            bitmap_cache_size: default_bitmap_cache_size(),
        }
    }
}

impl Settings {
    /// Service knobs derived from these settings
    #[must_use]
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            workers: self.render_workers.max(1),
            scroll_throttle: Duration::from_millis(self.scroll_throttle_ms),
            render_timeout: (self.render_timeout_ms > 0)
                .then(|| Duration::from_millis(self.render_timeout_ms)),
        }
    }
}

#[must_use]
pub fn preferred_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

/// Load settings from the user config directory, writing defaults on first run
#[must_use]
pub fn load_settings() -> Settings {
    let Some(path) = preferred_config_path() else {
        warn!("Could not determine config directory, using default settings");
        return Settings::default();
    };
    load_settings_from_path(&path)
}

/// Load settings from `path`. Missing files are created with defaults;
/// unreadable or malformed files fall back to defaults.
#[must_use]
pub fn load_settings_from_path(path: &Path) -> Settings {
    if !path.exists() {
        info!("Settings file not found, creating with defaults at {path:?}");
        let settings = Settings::default();
        if let Err(e) = save_settings_to_file(&settings, path) {
            error!("Failed to save settings to {path:?}: {e:#}");
        }
        return settings;
    }

    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                debug!("Loaded settings from {path:?}");

                if settings.version < CURRENT_VERSION {
                    migrate_settings(&mut settings);
                    if let Err(e) = save_settings_to_file(&settings, path) {
                        error!("Failed to save migrated settings to {path:?}: {e:#}");
                    }
                }
                if let Err(e) = settings.tiling.validate() {
                    warn!("Ignoring tiling section of {path:?}: {e}");
                    settings.tiling = TilingConfig::default();
                }
                settings
            }
            Err(e) => {
                error!("Failed to parse settings file {path:?}: {e}");
                Settings::default()
            }
        },
        Err(e) => {
            error!("Failed to read settings file {path:?}: {e}");
            Settings::default()
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );

    // Future migrations go here:
    // if settings.version < 2 {
    //     migrate_v1_to_v2(settings);
    // }

    settings.version = CURRENT_VERSION;
}

pub fn save_settings_to_file(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    if let Some(parent) = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && !p.exists())
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let content = serde_yaml::to_string(settings).context("serializing settings")?;
    fs::write(path, format!("{SETTINGS_HEADER}{content}"))
        .with_context(|| format!("writing {path:?}"))?;
    debug!("Saved settings to {path:?}");
    Ok(())
}

const SETTINGS_HEADER: &str = r#"# ============================================================================
# pagetiles settings
# ============================================================================
# tiling.tile_size      grid cell edge in device pixels
# tiling.overlap_px     pixels each tile bleeds past its cell
# tiling.extra_rings    tile rings prefetched around the visible area
# render_timeout_ms     0 disables render timeouts

"#;
