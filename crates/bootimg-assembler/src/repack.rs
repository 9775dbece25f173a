//! Boot and vendor boot image reassembly.
//!
//! Each entry point walks the same stages,
//! `unpacked -> cmdline-extracted -> ramdisk-transformed -> repacked -> signed -> committed`,
//! blocking on every tool. The first failure ends the run with the stage
//! transition prefixed to the error; nothing is retried, and nothing but
//! `.tmp` files and staging intermediates is left behind.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::avb::Avb;
use crate::bootconfig;
use crate::commit::{self, CommitOutcome};
use crate::config::AssemblerConfig;
use crate::error::{Error, Result};
use crate::kv::{BOOT_CMDLINE_KEY, VENDOR_CMDLINE_KEY, extract_value};
use crate::ramdisk::{self, RamdiskTransformer};
use crate::report::RepackReport;
use crate::staging::{
    self, BOOT_PARAMS, BOOT_RAMDISK, BOOTCONFIG, CONCATENATED_VENDOR_RAMDISK, DTB, EMPTY_RAMDISK,
    StagingDir, StagingState, VENDOR_BOOT_PARAMS, VENDOR_RAMDISK_REPACKED,
};
use crate::tools::{HostToolLocator, Tool, ToolLocator, ToolRunner};

const HEADER_VERSION: &str = "4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Boot,
    VendorBoot,
}

impl ImageKind {
    pub fn partition_name(self) -> &'static str {
        match self {
            ImageKind::Boot => "boot",
            ImageKind::VendorBoot => "vendor_boot",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.partition_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RepackStage {
    Unpacked,
    CmdlineExtracted,
    RamdiskTransformed,
    Repacked,
    Signed,
    Committed,
}

impl RepackStage {
    pub fn name(self) -> &'static str {
        match self {
            RepackStage::Unpacked => "unpacked",
            RepackStage::CmdlineExtracted => "cmdline-extracted",
            RepackStage::RamdiskTransformed => "ramdisk-transformed",
            RepackStage::Repacked => "repacked",
            RepackStage::Signed => "signed",
            RepackStage::Committed => "committed",
        }
    }
}

impl fmt::Display for RepackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct StageTracker {
    image: ImageKind,
    reached: Option<RepackStage>,
}

impl StageTracker {
    fn new(image: ImageKind) -> Self {
        Self {
            image,
            reached: None,
        }
    }

    fn advance<T>(&mut self, next: RepackStage, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let from = self.reached.map_or("start", RepackStage::name);
        match work() {
            Ok(v) => {
                tracing::debug!(image = %self.image, stage = %next, "stage reached");
                self.reached = Some(next);
                Ok(v)
            }
            Err(e) => Err(e.context(format!("{}: {from} -> {next}", self.image))),
        }
    }
}

/// Build the vendor kernel command line.
///
/// Without a bootconfig partition the bootconfig lines are folded into the
/// command line, and module parameters namespaced as `kernel.<key>=<value>`
/// for bootconfig go back to their bare `<key>=<value>` cmdline form.
pub fn vendor_cmdline(base: &str, bootconfig: &str, bootconfig_supported: bool) -> String {
    if bootconfig_supported {
        return base.to_string();
    }
    let cmdline = format!("{base} {}", bootconfig.replace('\n', " "));
    cmdline.replace(" kernel.", " ")
}

/// Orchestrates unpacking, ramdisk surgery, repacking, signing and commit.
#[derive(Debug, Clone)]
pub struct Assembler {
    tools: ToolRunner,
    cfg: AssemblerConfig,
}

impl Assembler {
    pub fn new(cfg: AssemblerConfig, locator: Arc<dyn ToolLocator>) -> Self {
        Self {
            tools: ToolRunner::new(locator),
            cfg,
        }
    }

    /// Resolve tools from the host locations named in the config.
    pub fn from_config(cfg: AssemblerConfig) -> Self {
        let locator = HostToolLocator::from_config(&cfg.tools);
        Self::new(cfg, Arc::new(locator))
    }

    pub fn tools(&self) -> &ToolRunner {
        &self.tools
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.cfg
    }

    fn ramdisks(&self) -> RamdiskTransformer<'_> {
        RamdiskTransformer::new(&self.tools, &self.cfg.ramdisk)
    }

    fn avb(&self) -> Avb<'_> {
        Avb::new(&self.tools, &self.cfg.avb)
    }

    /// Replace the kernel of `boot_image`, keeping its ramdisk and cmdline.
    pub fn repack_boot_image(
        &self,
        new_kernel: &Path,
        boot_image: &Path,
        new_boot_image: &Path,
        build_dir: &Path,
    ) -> Result<RepackReport> {
        let staging = StagingDir::new(build_dir);
        let tmp_image = commit::pending_path(new_boot_image);
        let mut run = StageTracker::new(ImageKind::Boot);

        run.advance(RepackStage::Unpacked, || {
            staging.unpack(&self.tools, boot_image, BOOT_PARAMS)
        })?;

        let cmdline = run.advance(RepackStage::CmdlineExtracted, || {
            let params = staging.read_text(BOOT_PARAMS)?;
            Ok(extract_value(&params, BOOT_CMDLINE_KEY))
        })?;
        tracing::debug!("Cmdline from boot image is {cmdline}");

        let ramdisk_path = run.advance(RepackStage::RamdiskTransformed, || {
            let p = staging.join(BOOT_RAMDISK);
            if !p.is_file() {
                return Err(Error::msg(format!(
                    "unpack produced no ramdisk at {}",
                    p.display()
                )));
            }
            Ok(p)
        })?;

        run.advance(RepackStage::Repacked, || {
            self.tools
                .command(Tool::Mkbootimg)?
                .arg("--kernel")
                .arg(new_kernel)
                .arg("--ramdisk")
                .arg(&ramdisk_path)
                .arg("--header_version")
                .arg(HEADER_VERSION)
                .arg("--cmdline")
                .arg(&cmdline)
                .arg("-o")
                .arg(&tmp_image)
                .run()
        })?;

        run.advance(RepackStage::Signed, || {
            let size = staging::file_len(boot_image)?;
            self.avb()
                .add_hash_footer(&tmp_image, ImageKind::Boot.partition_name(), size)
        })?;

        let outcome = run.advance(RepackStage::Committed, || {
            commit::commit_if_changed(&tmp_image, new_boot_image)
        })?;
        RepackReport::for_committed(ImageKind::Boot, new_boot_image, outcome)
    }

    /// Unpack the vendor boot image unless a previous run already did, and
    /// make sure the ramdisk fragments have been concatenated.
    pub fn unpack_vendor_boot_image_if_not_unpacked(
        &self,
        vendor_boot_image: &Path,
        unpack_dir: &Path,
    ) -> Result<StagingState> {
        let staging = StagingDir::new(unpack_dir);
        let before = staging.ensure_unpacked(&self.tools, vendor_boot_image, VENDOR_BOOT_PARAMS)?;
        if before == StagingState::Empty || !staging.join(CONCATENATED_VENDOR_RAMDISK).is_file() {
            ramdisk::concatenate_fragments(unpack_dir)?;
        }
        Ok(before)
    }

    /// Rebuild the vendor boot image, optionally swapping in `new_ramdisk`
    /// as the kernel modules ramdisk.
    pub fn repack_vendor_boot_image(
        &self,
        new_ramdisk: Option<&Path>,
        vendor_boot_image: &Path,
        new_vendor_boot_image: &Path,
        unpack_dir: &Path,
        bootconfig_supported: bool,
    ) -> Result<RepackReport> {
        let staging = StagingDir::new(unpack_dir);
        let tmp_image = commit::pending_path(new_vendor_boot_image);
        let mut run = StageTracker::new(ImageKind::VendorBoot);

        run.advance(RepackStage::Unpacked, || {
            self.unpack_vendor_boot_image_if_not_unpacked(vendor_boot_image, unpack_dir)
        })?;

        let cmdline = run.advance(RepackStage::CmdlineExtracted, || {
            let raw = staging.read_optional(BOOTCONFIG)?;
            let params_text = String::from_utf8_lossy(&raw);
            tracing::debug!("Bootconfig parameters from vendor boot image are {params_text}");
            let params = staging.read_text(VENDOR_BOOT_PARAMS)?;
            let base = extract_value(&params, VENDOR_CMDLINE_KEY);
            Ok(vendor_cmdline(&base, &params_text, bootconfig_supported))
        })?;
        tracing::debug!("Cmdline from vendor boot image is {cmdline}");

        let ramdisk_path = run.advance(RepackStage::RamdiskTransformed, || {
            self.select_vendor_ramdisk(&staging, new_ramdisk)
        })?;

        run.advance(RepackStage::Repacked, || {
            let mut cmd = self.tools.command(Tool::Mkbootimg)?;
            cmd.arg("--vendor_ramdisk")
                .arg(&ramdisk_path)
                .arg("--header_version")
                .arg(HEADER_VERSION)
                .arg("--vendor_cmdline")
                .arg(&cmdline)
                .arg("--vendor_boot")
                .arg(&tmp_image);
            let dtb = staging.join(DTB);
            if dtb.is_file() {
                cmd.arg("--dtb").arg(dtb);
            }
            if bootconfig_supported {
                cmd.arg("--vendor_bootconfig").arg(staging.join(BOOTCONFIG));
            }
            cmd.run()
        })?;

        run.advance(RepackStage::Signed, || {
            let size = staging::file_len(vendor_boot_image)?;
            self.avb()
                .add_hash_footer(&tmp_image, ImageKind::VendorBoot.partition_name(), size)
        })?;

        let outcome = run.advance(RepackStage::Committed, || {
            commit::commit_if_changed(&tmp_image, new_vendor_boot_image)
        })?;
        RepackReport::for_committed(ImageKind::VendorBoot, new_vendor_boot_image, outcome)
    }

    /// Strip `lib/modules` out of the vendor ramdisk without adding any
    /// replacement modules.
    pub fn repack_vendor_boot_image_with_empty_ramdisk(
        &self,
        vendor_boot_image: &Path,
        new_vendor_boot_image: &Path,
        unpack_dir: &Path,
        bootconfig_supported: bool,
    ) -> Result<RepackReport> {
        staging::ensure_dir(unpack_dir)?;
        let empty = unpack_dir.join(EMPTY_RAMDISK);
        File::create(&empty).map_err(|e| Error::io("create", &empty, e))?;
        self.repack_vendor_boot_image(
            Some(&empty),
            vendor_boot_image,
            new_vendor_boot_image,
            unpack_dir,
            bootconfig_supported,
        )
    }

    // The stripped+repacked ramdisk is reused across runs; it is only
    // rebuilt when missing.
    fn select_vendor_ramdisk(
        &self,
        staging: &StagingDir,
        modules_ramdisk: Option<&Path>,
    ) -> Result<PathBuf> {
        let Some(modules) = modules_ramdisk else {
            return Ok(staging.join(CONCATENATED_VENDOR_RAMDISK));
        };
        let repacked = staging.join(VENDOR_RAMDISK_REPACKED);
        if !repacked.exists() {
            self.ramdisks().strip_and_repack(
                modules,
                &staging.join(CONCATENATED_VENDOR_RAMDISK),
                &repacked,
                staging.path(),
            )?;
        }
        Ok(repacked)
    }

    /// Do what the boot loader would: build one initrd from the boot and
    /// vendor ramdisks followed by the bootconfig trailer. Runs every time
    /// and writes `initrd` directly.
    pub fn repack_gem5_boot_image(
        &self,
        initrd: &Path,
        persistent_bootconfig: &Path,
        unpack_dir: &Path,
        input_ramdisk: Option<&Path>,
    ) -> Result<()> {
        let staging = StagingDir::new(unpack_dir);
        let repacked = staging.join(VENDOR_RAMDISK_REPACKED);
        if let Some(modules) = input_ramdisk.filter(|p| p.exists())
            && !repacked.exists()
        {
            self.ramdisks().strip_and_repack(
                modules,
                &staging.join(CONCATENATED_VENDOR_RAMDISK),
                &repacked,
                unpack_dir,
            )?;
        }
        let vendor_ramdisk = if repacked.exists() {
            repacked
        } else {
            staging.join(CONCATENATED_VENDOR_RAMDISK)
        };

        let vendor_bootconfig = staging.read_optional(BOOTCONFIG)?;
        let persistent = staging::read_optional(persistent_bootconfig)?;
        let trailer = bootconfig::build_trailer(&vendor_bootconfig, &persistent)?;
        bootconfig::assemble_gem5_ramdisk(
            initrd,
            &staging.join(BOOT_RAMDISK),
            &vendor_ramdisk,
            &trailer,
        )?;
        tracing::info!(initrd = %initrd.display(), "assembled initrd with bootconfig");
        Ok(())
    }

    pub fn read_android_version(&self, boot_image: &Path) -> Result<String> {
        crate::version::read_android_version(&self.tools, &self.cfg, boot_image)
    }
}
