// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! File-backed configuration shared by the gateway binaries.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

// Any serde type becomes loadable from a YAML or JSON file
pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        // Support both YAML and JSON formats
        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse yaml config {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse json config {}", path.display()))?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}
