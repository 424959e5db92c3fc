//! File-backed configuration collaborator.
//!
//! `settings.json` holds channel mappings and operator toggles;
//! `engine_snapshot.json` holds the persisted cache and counters. Both are
//! written through a temp file and rename so a crash never leaves half a file.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use mirror_engine::{ChatId, EngineSnapshot, MirrorError, MirrorOptions, SettingsStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;

const SETTINGS_FILE: &str = "settings.json";
const SNAPSHOT_FILE: &str = "engine_snapshot.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub source_chat_id: ChatId,
    pub target_chat_id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisabledMapping {
    pub source_chat_id: ChatId,
    pub target_chat_id: ChatId,
    pub reason: String,
    pub disabled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub mappings: Vec<ChannelMapping>,
    #[serde(default)]
    pub options: MirrorOptions,
    #[serde(default)]
    pub disabled_mappings: Vec<DisabledMapping>,
}

pub struct FileSettingsStore {
    settings_path: PathBuf,
    snapshot_path: PathBuf,
    mappings: DashMap<ChatId, ChatId>,
    options: RwLock<MirrorOptions>,
    disabled: RwLock<Vec<DisabledMapping>>,
    write_lock: Mutex<()>,
}

impl FileSettingsStore {
    /// Opens (or initializes) the settings under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| anyhow::anyhow!("create data dir {}: {e}", data_dir.display()))?;
        let settings_path = data_dir.join(SETTINGS_FILE);
        let existed = tokio::fs::try_exists(&settings_path).await.unwrap_or(false);
        let file = if existed {
            let contents = tokio::fs::read_to_string(&settings_path)
                .await
                .map_err(|e| anyhow::anyhow!("read {}: {e}", settings_path.display()))?;
            serde_json::from_str::<SettingsFile>(&contents)
                .map_err(|e| anyhow::anyhow!("parse {}: {e}", settings_path.display()))?
        } else {
            SettingsFile::default()
        };

        let mappings = DashMap::new();
        for mapping in &file.mappings {
            if let Some(previous) = mappings.insert(mapping.source_chat_id, mapping.target_chat_id)
            {
                tracing::warn!(
                    source_chat = %mapping.source_chat_id,
                    previous_target = %previous,
                    target_chat = %mapping.target_chat_id,
                    "duplicate source mapping; last entry wins"
                );
            }
        }

        let store = Self {
            settings_path,
            snapshot_path: data_dir.join(SNAPSHOT_FILE),
            mappings,
            options: RwLock::new(file.options),
            disabled: RwLock::new(file.disabled_mappings),
            write_lock: Mutex::new(()),
        };
        if !existed {
            store.save().await?;
            tracing::info!(path = %store.settings_path.display(), "initialized settings file");
        }
        Ok(store)
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn mappings(&self) -> Vec<ChannelMapping> {
        let mut mappings: Vec<ChannelMapping> = self
            .mappings
            .iter()
            .map(|entry| ChannelMapping {
                source_chat_id: *entry.key(),
                target_chat_id: *entry.value(),
            })
            .collect();
        mappings.sort_by_key(|m| m.source_chat_id);
        mappings
    }

    pub fn disabled_mappings(&self) -> Vec<DisabledMapping> {
        self.disabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds `source -> target`. Returns false, leaving the table untouched,
    /// when `source` is already mapped.
    pub async fn add_mapping(&self, source: ChatId, target: ChatId) -> Result<bool> {
        if source == target {
            return Err(anyhow::anyhow!("source and target must differ ({source})"));
        }
        match self.mappings.entry(source) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(target);
            }
        }
        self.save().await?;
        tracing::info!(source_chat = %source, target_chat = %target, "added channel mapping");
        Ok(true)
    }

    pub async fn remove_mapping(&self, source: ChatId) -> Result<Option<ChatId>> {
        let Some((_, target)) = self.mappings.remove(&source) else {
            return Ok(None);
        };
        self.save().await?;
        tracing::info!(source_chat = %source, target_chat = %target, "removed channel mapping");
        Ok(Some(target))
    }

    /// Drops every mapping and returns how many were removed.
    pub async fn clear_mappings(&self) -> Result<usize> {
        let removed = self.mappings.len();
        self.mappings.clear();
        self.save().await?;
        tracing::info!(removed, "cleared channel mappings");
        Ok(removed)
    }

    /// Sets one toggle by its field name, e.g. `batching_enabled`.
    pub async fn set_option(&self, name: &str, value: bool) -> Result<MirrorOptions> {
        let updated = {
            let mut options = self.options.write().unwrap_or_else(PoisonError::into_inner);
            let flag = option_flag(&mut options, name).ok_or_else(|| {
                anyhow::anyhow!(
                    "unknown option {name:?}; expected one of: {}",
                    OPTION_NAMES.join(", ")
                )
            })?;
            *flag = value;
            *options
        };
        self.save().await?;
        tracing::info!(option = name, value, "updated mirror option");
        Ok(updated)
    }

    fn to_file(&self) -> SettingsFile {
        SettingsFile {
            mappings: self.mappings(),
            options: self.options(),
            disabled_mappings: self.disabled_mappings(),
        }
    }

    async fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let body = serde_json::to_vec_pretty(&self.to_file())?;
        write_atomic(&self.settings_path, &body).await
    }
}

const OPTION_NAMES: [&str; 9] = [
    "mirror_enabled",
    "mirror_text",
    "mirror_media",
    "mirror_edits",
    "mirror_deletes",
    "bypass_restriction",
    "batching_enabled",
    "smart_mode",
    "text_fallback",
];

fn option_flag<'a>(options: &'a mut MirrorOptions, name: &str) -> Option<&'a mut bool> {
    let flag = match name {
        "mirror_enabled" => &mut options.mirror_enabled,
        "mirror_text" => &mut options.mirror_text,
        "mirror_media" => &mut options.mirror_media,
        "mirror_edits" => &mut options.mirror_edits,
        "mirror_deletes" => &mut options.mirror_deletes,
        "bypass_restriction" => &mut options.bypass_restriction,
        "batching_enabled" => &mut options.batching_enabled,
        "smart_mode" => &mut options.smart_mode,
        "text_fallback" => &mut options.text_fallback,
        _ => return None,
    };
    Some(flag)
}

async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| anyhow::anyhow!("write {}: {e}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| anyhow::anyhow!("rename {} -> {}: {e}", tmp.display(), path.display()))?;
    Ok(())
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    fn target_for(&self, source: ChatId) -> Option<ChatId> {
        self.mappings.get(&source).map(|target| *target)
    }

    fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    fn options(&self) -> MirrorOptions {
        *self.options.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn report_invalid_mapping(
        &self,
        source: ChatId,
        target: ChatId,
        reason: &str,
    ) -> mirror_engine::Result<()> {
        // Only drop the mapping if it still points at the failing target.
        let removed = self
            .mappings
            .remove_if(&source, |_, current| *current == target)
            .is_some();
        if !removed {
            return Ok(());
        }
        self.disabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DisabledMapping {
                source_chat_id: source,
                target_chat_id: target,
                reason: reason.to_string(),
                disabled_at: Utc::now(),
            });
        tracing::warn!(
            source_chat = %source,
            target_chat = %target,
            %reason,
            "disabled channel mapping"
        );
        self.save()
            .await
            .map_err(|e| MirrorError::Settings(e.to_string()))
    }

    async fn load_snapshot(&self) -> mirror_engine::Result<Option<EngineSnapshot>> {
        match tokio::fs::read(&self.snapshot_path).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MirrorError::Persistence(format!(
                "read {}: {e}",
                self.snapshot_path.display()
            ))),
        }
    }

    async fn save_snapshot(&self, snapshot: &EngineSnapshot) -> mirror_engine::Result<()> {
        let body = serde_json::to_vec(snapshot)?;
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.snapshot_path, &body)
            .await
            .map_err(|e| MirrorError::Persistence(e.to_string()))
    }
}
