//! Engine configuration persistence
//!
//! Tempo, routing flags, channel mutes, and the keyboard mapping table
//! persist as one YAML file. Loading falls back to defaults on a missing or
//! unreadable file so a broken config can never keep the engine from
//! starting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::{MapTarget, NoteMap, DEFAULT_BPM};

/// Persisted engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Playback tempo
    pub bpm: f64,
    /// Channels loop independently instead of following the master wrap
    pub freewheel: bool,
    /// Copy input straight to the output port
    pub midi_through: bool,
    /// Channels whose note-ons are suppressed during playback
    pub muted_channels: Vec<u8>,
    /// Keyboard mapping table entries; absent notes map to themselves,
    /// `null` means the note is skipped entirely
    pub mapping: BTreeMap<u8, Option<u8>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            freewheel: false,
            midi_through: true,
            muted_channels: Vec::new(),
            mapping: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Build the runtime mapping table from the persisted entries
    pub fn note_map(&self) -> NoteMap {
        let mut map = NoteMap::identity();
        for (&note, &target) in &self.mapping {
            match target {
                Some(mapped) => map.set(note, MapTarget::Note(mapped)),
                None => map.set(note, MapTarget::Skip),
            }
        }
        map
    }

    /// Store a mapping table, keeping only the non-identity entries
    pub fn set_note_map(&mut self, map: &NoteMap) {
        self.mapping.clear();
        for note in 0..=127u8 {
            match map.get(note) {
                MapTarget::Note(n) if n == note => {}
                MapTarget::Note(n) => {
                    self.mapping.insert(note, Some(n));
                }
                MapTarget::Skip => {
                    self.mapping.insert(note, None);
                }
            }
        }
    }

    /// Mute mask for the engine atomics
    pub fn mute_mask(&self) -> u16 {
        self.muted_channels
            .iter()
            .filter(|&&ch| ch < 16)
            .fold(0u16, |mask, &ch| mask | (1 << ch))
    }
}

/// Default config location under the user config directory
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ostinato")
        .join("config.yaml")
}

/// Load the engine config, falling back to defaults
pub fn load_engine_config(path: &Path) -> EngineConfig {
    log::info!("Loading engine config from {:?}", path);

    if !path.exists() {
        log::info!("Config file doesn't exist, using defaults");
        return EngineConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<EngineConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to parse config: {}, using defaults", e);
                EngineConfig::default()
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file: {}, using defaults", e);
            EngineConfig::default()
        }
    }
}

/// Save the engine config, creating parent directories as needed
pub fn save_engine_config(config: &EngineConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write config: {:?}", path))?;
    log::info!("Engine config saved to {:?}", path);
    Ok(())
}
