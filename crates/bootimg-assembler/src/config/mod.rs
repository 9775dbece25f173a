use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::error::{Error, ErrorKind, Result};

fn default_compress_args() -> Vec<String> {
    ["-c", "-l", "-12", "--favor-decSpeed"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_decompress_args() -> Vec<String> {
    ["-c", "-d", "-l"].into_iter().map(String::from).collect()
}

fn default_max_extract_passes() -> usize {
    64
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    pub tools: ToolsConfig,
    pub avb: AvbConfig,
    pub ramdisk: RamdiskConfig,
    pub staging: StagingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub host_bin_dir: Option<PathBuf>,
    /// Logical tool name -> executable path.
    pub paths: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AvbConfig {
    pub algorithm: Option<String>,
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RamdiskConfig {
    #[serde(default = "default_compress_args")]
    pub compress_args: Vec<String>,
    #[serde(default = "default_decompress_args")]
    pub decompress_args: Vec<String>,
    #[serde(default = "default_max_extract_passes")]
    pub max_extract_passes: usize,
}

impl Default for RamdiskConfig {
    fn default() -> Self {
        Self {
            compress_args: default_compress_args(),
            decompress_args: default_decompress_args(),
            max_extract_passes: default_max_extract_passes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Parent directory for throwaway unpack dirs. Falls back to `$TEMP`, then the system temp dir.
    pub temp_dir: Option<PathBuf>,
}

impl StagingConfig {
    pub fn resolved_temp_dir(&self) -> PathBuf {
        if let Some(dir) = &self.temp_dir {
            return dir.clone();
        }
        std::env::var_os("TEMP")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl AssemblerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut stack = HashSet::<PathBuf>::new();
        let value = load_value_inner(path, &mut stack)?;
        let mut cfg: AssemblerConfig = value.try_into().map_err(|e| {
            Error::with_kind(
                ErrorKind::Config,
                format!("invalid config {}: {e}", path.display()),
            )
        })?;
        cfg.resolve_relative_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: AssemblerConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.ramdisk.max_extract_passes == 0 {
            return Err(Error::with_kind(
                ErrorKind::Config,
                "ramdisk.max_extract_passes must be at least 1",
            ));
        }
        for (name, p) in &self.tools.paths {
            if p.as_os_str().is_empty() {
                return Err(Error::with_kind(
                    ErrorKind::Config,
                    format!("tools.paths.{name} is empty"),
                ));
            }
        }
        Ok(())
    }

    // Paths in a config file are relative to that file, not to the cwd.
    fn resolve_relative_paths(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.tools.host_bin_dir.as_mut() {
            rebase(p);
        }
        for p in self.tools.paths.values_mut() {
            // Bare names stay bare so they resolve through PATH.
            if p.components().count() > 1 {
                rebase(p);
            }
        }
        if let Some(p) = self.avb.key.as_mut() {
            rebase(p);
        }
        if let Some(p) = self.staging.temp_dir.as_mut() {
            rebase(p);
        }
    }
}

// Tables merge key by key; anything else in `overlay` replaces `base`.
fn merge_values(base: &mut Value, overlay: Value) {
    let overlay_tbl = match overlay {
        Value::Table(t) if base.is_table() => t,
        other => {
            *base = other;
            return;
        }
    };
    let Some(base_tbl) = base.as_table_mut() else {
        return;
    };
    for (key, value) in overlay_tbl {
        match base_tbl.entry(key) {
            toml::map::Entry::Occupied(mut slot) => merge_values(slot.get_mut(), value),
            toml::map::Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::with_kind(
            ErrorKind::Config,
            format!("config extends cycle detected at {}", canonical.display()),
        ));
    }

    let data = fs::read_to_string(path).map_err(|e| Error::io("read config", path, e))?;
    let mut value: Value = toml::from_str(&data).map_err(|e| {
        Error::with_kind(
            ErrorKind::Config,
            format!("TOML parse error in {}: {e}", path.display()),
        )
    })?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let p = PathBuf::from(ext);
        let base_path = if p.is_absolute() {
            p
        } else {
            path.parent().unwrap_or_else(|| Path::new(".")).join(p)
        };
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}
