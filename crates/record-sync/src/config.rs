// File: record-sync/src/config.rs
// Purpose: Configuration parsing from record-sync.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub item: ItemConfig,
}

/// Change feed settings shared by every subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Database schema the feed filters on
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Prefix of every channel name
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Primary key column of subscribed tables
    #[serde(default = "default_primary_key")]
    pub primary_key: String,

    /// Event capacity of the in-memory transport
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Settings for the item subscription and its discount feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConfig {
    #[serde(default = "default_item_table")]
    pub table: String,

    /// Child table holding per-customer-tier discounts
    #[serde(default = "default_child_table")]
    pub child_table: String,

    /// Column of the child table referencing the item
    #[serde(default = "default_foreign_key")]
    pub foreign_key: String,

    /// Numeric column normalized on every refresh
    #[serde(default = "default_discount_field")]
    pub discount_field: String,

    /// Form field receiving the normalized discount collection
    #[serde(default = "default_collection_field")]
    pub collection_field: String,

    /// Fields compared by structural equality when diffing updates
    #[serde(default = "default_structural_keys")]
    pub structural_keys: Vec<String>,

    /// Namespace of the item detail query key
    #[serde(default = "default_detail_namespace")]
    pub detail_namespace: String,

    /// Force a list refetch after each processed item update
    #[serde(default = "default_true")]
    pub refetch_list_on_update: bool,
}

impl ItemConfig {
    pub fn structural_key_set(&self) -> HashSet<String> {
        self.structural_keys.iter().cloned().collect()
    }
}

// Default values
fn default_schema() -> String {
    "public".to_string()
}

fn default_channel_prefix() -> String {
    "realtime".to_string()
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_event_buffer() -> usize {
    256
}

fn default_item_table() -> String {
    "items".to_string()
}

fn default_child_table() -> String {
    "item_customer_discounts".to_string()
}

fn default_foreign_key() -> String {
    "item_id".to_string()
}

fn default_discount_field() -> String {
    "discount_percentage".to_string()
}

fn default_collection_field() -> String {
    "customer_discounts".to_string()
}

fn default_structural_keys() -> Vec<String> {
    vec!["package_conversions".to_string()]
}

fn default_detail_namespace() -> String {
    "item-detail".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            channel_prefix: default_channel_prefix(),
            primary_key: default_primary_key(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for ItemConfig {
    fn default() -> Self {
        Self {
            table: default_item_table(),
            child_table: default_child_table(),
            foreign_key: default_foreign_key(),
            discount_field: default_discount_field(),
            collection_field: default_collection_field(),
            structural_keys: default_structural_keys(),
            detail_namespace: default_detail_namespace(),
            refetch_list_on_update: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Missing file means defaults
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        Self::from_toml(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from default path (./record-sync.toml)
    pub fn load_default() -> Result<Self> {
        Self::load("record-sync.toml")
    }
}
