use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{info, warn};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::chart::{ChartKind, ThemeName};
use crate::error::{AppError, Context, Result};
use crate::quotes::TimeRange;

/// Hard cap on tracked tickers; the chart degrades past this.
pub const MAX_SYMBOLS: usize = 5;
/// Floor for the refresh interval, which also bounds the cache TTL.
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 60;

/// User-facing configuration persisted as JSON under the config directory.
/// Unknown fields are ignored and missing fields fall back to defaults, so
/// old config files keep loading across upgrades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub symbols: Vec<String>,
    pub refresh_interval_secs: u64,
    pub chart_kind: ChartKind,
    pub theme: ThemeName,
    pub time_range: TimeRange,
    pub api_key: String,
    pub trading_hours_only: bool,
    pub requests_per_minute: u32,
    pub show_grid: bool,
    pub wallpaper_width: u32,
    pub wallpaper_height: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            refresh_interval_secs: 300,
            chart_kind: ChartKind::Line,
            theme: ThemeName::Dark,
            time_range: TimeRange::OneDay,
            api_key: String::new(),
            trading_hours_only: true,
            requests_per_minute: 5,
            show_grid: true,
            wallpaper_width: 1920,
            wallpaper_height: 1080,
        }
    }
}

impl Settings {
    /// Bring the settings into canonical form: tickers uppercased, deduped,
    /// capped at `MAX_SYMBOLS`; numeric knobs clamped to workable floors.
    pub fn normalize(&mut self) {
        let mut seen = Vec::with_capacity(self.symbols.len());
        for raw in &self.symbols {
            let symbol = raw.trim().to_uppercase();
            if symbol.is_empty() || seen.contains(&symbol) {
                continue;
            }
            seen.push(symbol);
        }
        if seen.len() > MAX_SYMBOLS {
            warn!(
                "Tracking {} symbols, keeping the first {}",
                seen.len(),
                MAX_SYMBOLS
            );
            seen.truncate(MAX_SYMBOLS);
        }
        self.symbols = seen;

        self.refresh_interval_secs = self.refresh_interval_secs.max(MIN_REFRESH_INTERVAL_SECS);
        self.requests_per_minute = self.requests_per_minute.max(1);
        self.wallpaper_width = self.wallpaper_width.max(640);
        self.wallpaper_height = self.wallpaper_height.max(480);
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Cache TTL tracks the refresh interval with the 60s floor applied.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(MIN_REFRESH_INTERVAL_SECS))
    }
}

/// Per-user configuration directory, created on demand by the store.
pub fn config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("WallStonks")
    }
    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".wallstonks")
    }
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.json")
}

pub fn default_wallpaper_path() -> PathBuf {
    config_dir().join("wallpaper.png")
}

/// Owns the settings file: loads it, persists edits, watches for out-of-band
/// changes on disk, and broadcasts every new snapshot over a watch channel.
/// Consumers hold `Arc<Settings>` snapshots and never mutate shared state.
pub struct SettingsStore {
    path: PathBuf,
    state: RwLock<Arc<Settings>>,
    updates_tx: watch::Sender<Arc<Settings>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl SettingsStore {
    /// Load settings from `path`, creating the file with defaults when absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            load_settings(&path)?
        } else {
            let defaults = Settings::default();
            persist_settings(&path, &defaults)?;
            info!("Created settings file at {}", path.display());
            defaults
        };

        let snapshot = Arc::new(settings);
        let (updates_tx, _) = watch::channel(snapshot.clone());

        Ok(Self {
            path,
            state: RwLock::new(snapshot),
            updates_tx,
            watcher: Mutex::new(None),
        })
    }

    pub fn current(&self) -> Arc<Settings> {
        self.state.read().unwrap().clone()
    }

    /// Subscribe to settings updates. The receiver immediately yields the
    /// latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.updates_tx.subscribe()
    }

    /// Replace the settings, persist them, and broadcast the new snapshot.
    pub fn replace(&self, mut settings: Settings) -> Result<()> {
        settings.normalize();
        persist_settings(&self.path, &settings)?;
        self.install(Arc::new(settings));
        Ok(())
    }

    /// Re-read the settings file and broadcast if the contents changed.
    pub fn reload(&self) -> Result<()> {
        let settings = load_settings(&self.path)?;
        let snapshot = Arc::new(settings);
        if *self.current() == *snapshot {
            return Ok(());
        }
        info!("Settings reloaded from {}", self.path.display());
        self.install(snapshot);
        Ok(())
    }

    /// Watch the settings file's directory and reload on edits. Multiple
    /// invocations are no-ops.
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        if self.watcher.lock().unwrap().is_some() {
            return Ok(());
        }

        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let store = Arc::clone(self);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) if is_relevant_event(&event.kind) => {
                    if let Err(err) = store.reload() {
                        warn!("Failed to reload settings: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!("Settings watch error: {err}"),
            })
            .map_err(|err| AppError::message(format!("Failed to start settings watcher: {err}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::message(format!("Failed to watch settings directory: {err}"))
            })?;
        *self.watcher.lock().unwrap() = Some(watcher);
        Ok(())
    }

    fn install(&self, snapshot: Arc<Settings>) {
        {
            let mut state = self.state.write().unwrap();
            *state = snapshot.clone();
        }
        let _ = self.updates_tx.send(snapshot);
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let mut settings: Settings = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
    settings.normalize();
    Ok(settings)
}

fn persist_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(settings)?;
    fs::write(path, body)
        .with_context(|| format!("Failed to write settings file {}", path.display()))?;
    Ok(())
}

fn is_relevant_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Remove(_)
            | EventKind::Any
            | EventKind::Other
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("wallstonks-settings-{}-{}", std::process::id(), name))
    }

    #[test]
    fn normalize_uppercases_dedupes_and_caps() {
        let mut settings = Settings {
            symbols: vec![
                "aapl".to_string(),
                " msft ".to_string(),
                "AAPL".to_string(),
                "".to_string(),
                "goog".to_string(),
                "tsla".to_string(),
                "nvda".to_string(),
                "amzn".to_string(),
            ],
            ..Settings::default()
        };
        settings.normalize();
        assert_eq!(settings.symbols, vec!["AAPL", "MSFT", "GOOG", "TSLA", "NVDA"]);
    }

    #[test]
    fn normalize_clamps_interval_and_rate() {
        let mut settings = Settings {
            refresh_interval_secs: 5,
            requests_per_minute: 0,
            ..Settings::default()
        };
        settings.normalize();
        assert_eq!(settings.refresh_interval_secs, MIN_REFRESH_INTERVAL_SECS);
        assert_eq!(settings.requests_per_minute, 1);
        assert_eq!(settings.cache_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn missing_and_unknown_fields_are_tolerated() {
        let raw = r#"{
            "symbols": ["ibm"],
            "api_key": "demo",
            "some_future_knob": true
        }"#;
        let mut settings: Settings = serde_json::from_str(raw).expect("parses");
        settings.normalize();
        assert_eq!(settings.symbols, vec!["IBM"]);
        assert_eq!(settings.api_key, "demo");
        assert_eq!(settings.refresh_interval_secs, 300);
    }

    #[test]
    fn store_creates_file_and_roundtrips() {
        let path = temp_path("roundtrip").join("config.json");
        let _ = fs::remove_dir_all(path.parent().unwrap());

        let store = SettingsStore::open(&path).expect("store opens");
        assert!(path.exists());
        assert!(store.current().symbols.is_empty());

        let mut edited = Settings::default();
        edited.symbols = vec!["aapl".to_string()];
        edited.api_key = "secret".to_string();
        store.replace(edited).expect("replace persists");

        let reopened = SettingsStore::open(&path).expect("store reopens");
        assert_eq!(reopened.current().symbols, vec!["AAPL"]);
        assert_eq!(reopened.current().api_key, "secret");

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn replace_broadcasts_to_subscribers() {
        let path = temp_path("broadcast").join("config.json");
        let _ = fs::remove_dir_all(path.parent().unwrap());

        let store = SettingsStore::open(&path).expect("store opens");
        let rx = store.subscribe();

        let mut edited = Settings::default();
        edited.symbols = vec!["msft".to_string()];
        store.replace(edited).expect("replace persists");

        assert_eq!(rx.borrow().symbols, vec!["MSFT"]);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
