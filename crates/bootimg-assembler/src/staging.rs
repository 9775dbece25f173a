use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::tools::{Tool, ToolRunner};

/// Metadata dumped while unpacking a boot image; doubles as its sentinel.
pub const BOOT_PARAMS: &str = "boot_params";
/// Metadata dumped while unpacking a vendor boot image; doubles as its sentinel.
pub const VENDOR_BOOT_PARAMS: &str = "vendor_boot_params";

pub const BOOT_RAMDISK: &str = "ramdisk";
pub const VENDOR_RAMDISK_PREFIX: &str = "vendor_ramdisk";
pub const CONCATENATED_VENDOR_RAMDISK: &str = "concatenated_vendor_ramdisk";
pub const VENDOR_RAMDISK_REPACKED: &str = "vendor_ramdisk_repacked";
pub const EMPTY_RAMDISK: &str = "empty_ramdisk";
pub const DTB: &str = "dtb";
pub const BOOTCONFIG: &str = "bootconfig";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingState {
    /// No completed unpack; the directory must be populated before reads.
    Empty,
    /// The sentinel exists, so a previous unpack finished.
    Populated,
}

/// Working directory that owns every intermediate of one image unpack.
///
/// The on-disk sentinel is the source of truth so that state survives
/// process restarts. The directory itself is never removed here.
#[derive(Debug, Clone)]
pub struct StagingDir {
    root: PathBuf,
}

impl StagingDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn state(&self, sentinel: &str) -> StagingState {
        if self.join(sentinel).is_file() {
            StagingState::Populated
        } else {
            StagingState::Empty
        }
    }

    /// Run the unpack tool unconditionally, replacing any earlier sentinel.
    pub fn unpack(&self, tools: &ToolRunner, image: &Path, sentinel: &str) -> Result<()> {
        ensure_dir(&self.root)?;
        let sentinel_path = self.join(sentinel);
        // The dump lands in a side file first so a failed unpack can never
        // leave a sentinel behind.
        let partial = self.join(&format!("{sentinel}.partial"));
        if sentinel_path.exists() {
            fs::remove_file(&sentinel_path).map_err(|e| Error::io("remove", &sentinel_path, e))?;
        }

        let res = tools
            .command(Tool::UnpackBootimg)?
            .arg("--boot_img")
            .arg(image)
            .arg("--out")
            .arg(&self.root)
            .stdout_to(&partial)
            .run();
        if let Err(e) = res {
            let _ = fs::remove_file(&partial);
            return Err(e.context(format!("unpacking {}", image.display())));
        }

        fs::rename(&partial, &sentinel_path).map_err(|e| Error::io("finalize", &sentinel_path, e))?;
        tracing::debug!(
            image = %image.display(),
            dir = %self.root.display(),
            "unpacked image"
        );
        Ok(())
    }

    /// Unpack only if the sentinel is missing. Returns the state found
    /// before any work was done.
    pub fn ensure_unpacked(
        &self,
        tools: &ToolRunner,
        image: &Path,
        sentinel: &str,
    ) -> Result<StagingState> {
        let before = self.state(sentinel);
        if before == StagingState::Empty {
            self.unpack(tools, image, sentinel)?;
        } else {
            tracing::debug!(
                dir = %self.root.display(),
                sentinel,
                "already unpacked, skipping"
            );
        }
        Ok(before)
    }

    pub fn read_text(&self, name: &str) -> Result<String> {
        let p = self.join(name);
        let raw = fs::read(&p).map_err(|e| Error::io("read", &p, e))?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Read an optional artifact; a missing file reads as empty.
    pub fn read_optional(&self, name: &str) -> Result<Vec<u8>> {
        read_optional(&self.join(name))
    }
}

pub(crate) fn read_optional(p: &Path) -> Result<Vec<u8>> {
    match fs::read(p) {
        Ok(b) => Ok(b),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::io("read", p, e)),
    }
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p).map_err(|e| Error::io("create dir", p, e))
}

pub fn file_len(p: &Path) -> Result<u64> {
    fs::metadata(p)
        .map(|m| m.len())
        .map_err(|e| Error::io("stat", p, e))
}
