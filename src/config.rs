use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Per-frame lighting parameters consumed by the shadow/cookie atlas pipeline.
///
/// Doubles as the on-disk configuration record; unspecified fields fall back
/// to engine defaults.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LightingParams {
    #[serde(default = "LightingParams::default_shadow_atlas_resolution")]
    pub shadow_atlas_resolution: u32,
    #[serde(default = "LightingParams::default_cookie_atlas_resolution")]
    pub cookie_atlas_resolution: u32,
    /// Explicit atlas subdivision. `None` derives a split from the number of
    /// lights that need a slot this frame.
    #[serde(default)]
    pub atlas_split: Option<Vec<u32>>,
    #[serde(default = "LightingParams::default_enabled")]
    pub shadows_enabled: bool,
    #[serde(default = "LightingParams::default_enabled")]
    pub cookies_enabled: bool,
    /// Clustered mode renders every assigned light/face inside one shared
    /// atlas pass; otherwise each face gets its own pass.
    #[serde(default)]
    pub clustered: bool,
}

impl LightingParams {
    fn default_shadow_atlas_resolution() -> u32 {
        2048
    }

    fn default_cookie_atlas_resolution() -> u32 {
        512
    }

    fn default_enabled() -> bool {
        true
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lighting config '{}'", path.display()))?;
        let params: LightingParams = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse lighting config '{}'", path.display()))?;
        Ok(params)
    }
}

impl Default for LightingParams {
    fn default() -> Self {
        Self {
            shadow_atlas_resolution: Self::default_shadow_atlas_resolution(),
            cookie_atlas_resolution: Self::default_cookie_atlas_resolution(),
            atlas_split: None,
            shadows_enabled: true,
            cookies_enabled: true,
            clustered: false,
        }
    }
}
