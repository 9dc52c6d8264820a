use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use std::env;

use crate::chunker::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_BUCKET: &str = "fs";

/// Settings for one [crate::GridStore] bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridConfig {
    pub bucket_name: String,
    pub chunk_size: usize,
    /// When set, failing to create an index is logged and ignored instead of
    /// failing initialization.
    pub index_creation_is_best_effort: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            bucket_name: DEFAULT_BUCKET.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            index_creation_is_best_effort: true,
        }
    }
}

impl GridConfig {
    pub fn bucket(name: &str) -> Self {
        GridConfig {
            bucket_name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn strict_indexes(mut self) -> Self {
        self.index_creation_is_best_effort = false;
        self
    }

    pub fn files_collection(&self) -> String {
        format!("{}.files", self.bucket_name)
    }

    pub fn chunks_collection(&self) -> String {
        format!("{}.chunks", self.bucket_name)
    }
}

/// Settings of the command line tool.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub prometheus_port: Option<u16>,
    pub grid: GridConfig,
}

fn flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = var("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL not set"))?;

        let mut grid = GridConfig::default();
        if let Some(bucket) = var("GRIDSTORE_BUCKET") {
            grid.bucket_name = bucket;
        }
        if let Some(size) = var("GRIDSTORE_CHUNK_SIZE") {
            grid.chunk_size = size
                .parse()
                .with_context(|| format!("GRIDSTORE_CHUNK_SIZE={:?} is not a number", size))?;
        }
        if let Some(strict) = var("GRIDSTORE_STRICT_INDEXES") {
            grid.index_creation_is_best_effort = !flag(&strict);
        }

        let prometheus_port = var("PROMETHEUS_PORT")
            .map(|p| {
                p.parse()
                    .with_context(|| format!("PROMETHEUS_PORT={:?} is not a port", p))
            })
            .transpose()?;

        Ok(Config {
            database_url,
            prometheus_port,
            grid,
        })
    }
}
