//! External tool collaborators.
//!
//! Host binaries are never looked up through global state: every component
//! that needs one receives a [`ToolRunner`], which resolves logical tool
//! names through an injected [`ToolLocator`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ToolsConfig;
use crate::error::Result;

mod runner;
mod sanitize;

pub use runner::ToolCommand;
pub use sanitize::sanitize_tool_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tool {
    UnpackBootimg,
    Mkbootimg,
    Avbtool,
    Mkbootfs,
    Lz4,
    Toybox,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::UnpackBootimg,
        Tool::Mkbootimg,
        Tool::Avbtool,
        Tool::Mkbootfs,
        Tool::Lz4,
        Tool::Toybox,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tool::UnpackBootimg => "unpack_bootimg",
            Tool::Mkbootimg => "mkbootimg",
            Tool::Avbtool => "avbtool",
            Tool::Mkbootfs => "mkbootfs",
            Tool::Lz4 => "lz4",
            Tool::Toybox => "toybox",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maps a logical tool to something `std::process::Command` can spawn.
pub trait ToolLocator: Send + Sync {
    fn locate(&self, tool: Tool) -> Result<PathBuf>;
}

/// Resolves tools from explicit overrides, then each search directory in
/// order, and finally the bare name (PATH).
#[derive(Debug, Clone, Default)]
pub struct HostToolLocator {
    search_dirs: Vec<PathBuf>,
    overrides: BTreeMap<String, PathBuf>,
}

const HOST_OUT_VARS: [&str; 2] = ["ANDROID_HOST_OUT", "ANDROID_SOONG_HOST_OUT"];

impl HostToolLocator {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self::with_search_dirs(bin_dir.into_iter().collect())
    }

    pub fn with_search_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            overrides: BTreeMap::new(),
        }
    }

    /// `host_bin_dir` first, then `bin/` under each Android host output
    /// variable that is set.
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self {
            search_dirs: search_dirs(cfg.host_bin_dir.as_deref(), |k| std::env::var_os(k)),
            overrides: cfg.paths.clone(),
        }
    }

    pub fn with_override(mut self, tool: Tool, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(tool.name().to_string(), path.into());
        self
    }
}

fn search_dirs(
    host_bin_dir: Option<&Path>,
    env: impl Fn(&str) -> Option<OsString>,
) -> Vec<PathBuf> {
    let host_out = HOST_OUT_VARS
        .into_iter()
        .filter_map(&env)
        .filter(|v| !v.is_empty())
        .map(|v| PathBuf::from(v).join("bin"));
    host_bin_dir.map(Path::to_path_buf).into_iter().chain(host_out).collect()
}

impl ToolLocator for HostToolLocator {
    fn locate(&self, tool: Tool) -> Result<PathBuf> {
        if let Some(p) = self.overrides.get(tool.name()) {
            return Ok(p.clone());
        }
        let found = self
            .search_dirs
            .iter()
            .map(|dir| dir.join(tool.name()))
            .find(|candidate| candidate.is_file());
        Ok(found.unwrap_or_else(|| PathBuf::from(tool.name())))
    }
}

/// Spawns tools resolved through a shared locator.
#[derive(Clone)]
pub struct ToolRunner {
    locator: Arc<dyn ToolLocator>,
}

impl ToolRunner {
    pub fn new(locator: Arc<dyn ToolLocator>) -> Self {
        Self { locator }
    }

    pub fn command(&self, tool: Tool) -> Result<ToolCommand> {
        let program = self.locator.locate(tool)?;
        Ok(ToolCommand::new(tool, program))
    }
}

impl fmt::Debug for ToolRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRunner").finish_non_exhaustive()
    }
}
