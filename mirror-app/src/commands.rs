//! Offline edits to `settings.json`.
//!
//! A running `tgmirror serve` keeps its own copy of the settings and
//! overwrites the file on its next save, so these edits are meant for a
//! stopped process and take effect on the next start.

use crate::config::AppConfig;
use crate::settings::FileSettingsStore;
use anyhow::Result;
use clap::ValueEnum;
use mirror_engine::ChatId;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

impl From<Switch> for bool {
    fn from(switch: Switch) -> Self {
        switch == Switch::On
    }
}

async fn open_settings(config_path: Option<PathBuf>) -> Result<FileSettingsStore> {
    let (cfg, _) = AppConfig::load_with_path(config_path).await?;
    FileSettingsStore::open(&cfg.data_dir_path()?).await
}

pub async fn map(config_path: Option<PathBuf>, source: i64, target: i64) -> Result<()> {
    let settings = open_settings(config_path).await?;
    let (source, target) = (ChatId::new(source), ChatId::new(target));
    if settings.add_mapping(source, target).await? {
        println!("mapped {source} -> {target}");
    } else {
        println!("{source} is already mapped; run `tgmirror unmap {source}` first");
    }
    Ok(())
}

pub async fn unmap(config_path: Option<PathBuf>, source: i64) -> Result<()> {
    let settings = open_settings(config_path).await?;
    match settings.remove_mapping(ChatId::new(source)).await? {
        Some(target) => println!("removed {source} -> {target}"),
        None => println!("no mapping for {source}"),
    }
    Ok(())
}

pub async fn clear_mappings(config_path: Option<PathBuf>) -> Result<()> {
    let settings = open_settings(config_path).await?;
    let removed = settings.clear_mappings().await?;
    println!("removed {removed} mapping(s)");
    Ok(())
}

pub async fn set_option(config_path: Option<PathBuf>, name: &str, value: Switch) -> Result<()> {
    let settings = open_settings(config_path).await?;
    let options = settings.set_option(name, value.into()).await?;
    println!("{}", serde_json::to_string_pretty(&options)?);
    Ok(())
}
