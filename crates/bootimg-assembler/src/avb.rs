use std::path::Path;

use crate::config::AvbConfig;
use crate::error::Result;
use crate::tools::{Tool, ToolRunner};

/// Thin wrapper over `avbtool`.
#[derive(Debug, Clone, Copy)]
pub struct Avb<'a> {
    tools: &'a ToolRunner,
    cfg: &'a AvbConfig,
}

impl<'a> Avb<'a> {
    pub fn new(tools: &'a ToolRunner, cfg: &'a AvbConfig) -> Self {
        Self { tools, cfg }
    }

    /// Append a hash footer in place, sizing the partition to `partition_size`.
    pub fn add_hash_footer(
        &self,
        image: &Path,
        partition_name: &str,
        partition_size: u64,
    ) -> Result<()> {
        let mut cmd = self.tools.command(Tool::Avbtool)?;
        cmd.arg("add_hash_footer")
            .arg("--image")
            .arg(image)
            .arg("--partition_size")
            .arg(partition_size.to_string())
            .arg("--partition_name")
            .arg(partition_name);
        if let Some(algorithm) = self.cfg.algorithm.as_deref().filter(|s| !s.trim().is_empty()) {
            cmd.arg("--algorithm").arg(algorithm);
        }
        if let Some(key) = &self.cfg.key {
            cmd.arg("--key").arg(key);
        }
        cmd.run()
            .map_err(|e| e.context(format!("signing {partition_name} image")))
    }

    /// Dump the image's AVB metadata as text into `out`.
    pub fn info_image(&self, image: &Path, out: &Path) -> Result<()> {
        self.tools
            .command(Tool::Avbtool)?
            .arg("info_image")
            .arg("--image")
            .arg(image)
            .stdout_to(out)
            .run()
    }
}
