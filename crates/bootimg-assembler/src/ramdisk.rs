//! Ramdisk classification and transformation.
//!
//! Ramdisks arrive either as a bare newc cpio archive or lz4-compressed.
//! Every transformation writes a new file; inputs are never edited in place.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use crate::config::RamdiskConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::staging::{
    self, CONCATENATED_VENDOR_RAMDISK, VENDOR_RAMDISK_PREFIX, VENDOR_RAMDISK_REPACKED,
};
use crate::tools::{Tool, ToolRunner};

/// newc cpio magic at offset 0 of an uncompressed archive.
pub const ARCHIVE_MAGIC: &[u8; 6] = b"070701";
/// Suffix of the uncompressed sibling produced next to a ramdisk.
pub const ARCHIVE_EXT: &str = ".cpio";
const PARTIAL_EXT: &str = ".partial";

const STRIPPED_RAMDISK_DIR: &str = "stripped_ramdisk_dir";
const STRIPPED_RAMDISK: &str = "stripped_ramdisk";
const MODULES_SUBTREE: &str = "lib/modules";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamdiskFormat {
    Archive,
    Compressed,
}

/// Classify by the first six bytes. Anything unreadable or shorter than the
/// magic counts as compressed, so callers fall through to decompression.
pub fn detect_format(path: &Path) -> RamdiskFormat {
    let mut buf = [0u8; ARCHIVE_MAGIC.len()];
    let read = File::open(path).and_then(|mut f| f.read_exact(&mut buf));
    match read {
        Ok(()) if &buf == ARCHIVE_MAGIC => RamdiskFormat::Archive,
        _ => RamdiskFormat::Compressed,
    }
}

pub fn is_archive_already(path: &Path) -> bool {
    detect_format(path) == RamdiskFormat::Archive
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Write `inputs` back to back into `output`.
///
/// The bytes go to `<output>.partial` first and replace `output` only once
/// every input was copied, so a reused intermediate is never left short.
pub fn concat_files(output: &Path, inputs: &[&Path]) -> Result<u64> {
    let partial = with_suffix(output, PARTIAL_EXT);
    let res = write_concatenation(&partial, inputs);
    if res.is_err() {
        let _ = fs::remove_file(&partial);
    }
    let total = res?;
    fs::rename(&partial, output).map_err(|e| {
        Error::io(&format!("rename {} over", partial.display()), output, e)
    })?;
    Ok(total)
}

fn write_concatenation(dest: &Path, inputs: &[&Path]) -> Result<u64> {
    let out = File::create(dest).map_err(|e| Error::io("create", dest, e))?;
    let mut out = BufWriter::new(out);
    let mut total = 0u64;
    for input in inputs {
        let mut f = File::open(input).map_err(|e| Error::io("open", input, e))?;
        total += io::copy(&mut f, &mut out).map_err(|e| Error::io("append to", dest, e))?;
    }
    out.flush().map_err(|e| Error::io("write", dest, e))?;
    Ok(total)
}

/// Concatenate every `vendor_ramdisk*` fragment of an unpack dir, in file
/// name order, into `concatenated_vendor_ramdisk`. The unpack tool pads the
/// fragment index, so name order is load order.
pub fn concatenate_fragments(unpack_dir: &Path) -> Result<PathBuf> {
    let mut fragments = Vec::new();
    for entry in walkdir::WalkDir::new(unpack_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let is_fragment = name.starts_with(VENDOR_RAMDISK_PREFIX)
            && name != VENDOR_RAMDISK_REPACKED
            && !name.ends_with(ARCHIVE_EXT)
            && !name.ends_with(PARTIAL_EXT);
        if is_fragment {
            fragments.push(entry.into_path());
        }
    }
    if fragments.is_empty() {
        return Err(Error::msg(format!(
            "no {VENDOR_RAMDISK_PREFIX}* fragments in {}",
            unpack_dir.display()
        )));
    }

    let output = unpack_dir.join(CONCATENATED_VENDOR_RAMDISK);
    let inputs: Vec<&Path> = fragments.iter().map(PathBuf::as_path).collect();
    let bytes = concat_files(&output, &inputs)?;
    tracing::debug!(
        fragments = fragments.len(),
        bytes,
        output = %output.display(),
        "concatenated vendor ramdisk fragments"
    );
    Ok(output)
}

/// Drives the archiver, extractor and compressor tools.
#[derive(Debug, Clone, Copy)]
pub struct RamdiskTransformer<'a> {
    tools: &'a ToolRunner,
    cfg: &'a RamdiskConfig,
}

impl<'a> RamdiskTransformer<'a> {
    pub fn new(tools: &'a ToolRunner, cfg: &'a RamdiskConfig) -> Self {
        Self { tools, cfg }
    }

    /// Expand `ramdisk` into `stage_dir`, decompressing through a `.cpio`
    /// sibling when needed.
    pub fn unpack(&self, ramdisk: &Path, stage_dir: &Path) -> Result<()> {
        let archive = with_suffix(ramdisk, ARCHIVE_EXT);
        match detect_format(ramdisk) {
            RamdiskFormat::Archive => {
                fs::copy(ramdisk, &archive).map_err(|e| {
                    Error::io(&format!("copy {} to", ramdisk.display()), &archive, e)
                })?;
            }
            RamdiskFormat::Compressed => {
                self.tools
                    .command(Tool::Lz4)?
                    .args(&self.cfg.decompress_args)
                    .arg(ramdisk)
                    .stdout_to(&archive)
                    .run()
                    .map_err(|e| e.context(format!("decompressing {}", ramdisk.display())))?;
            }
        }
        staging::ensure_dir(stage_dir)?;
        let passes = self.extract_all(&archive, stage_dir)?;
        tracing::debug!(
            ramdisk = %ramdisk.display(),
            stage = %stage_dir.display(),
            passes,
            "unpacked ramdisk"
        );
        Ok(())
    }

    // A concatenated ramdisk holds several archives back to back and the
    // extractor stops after each trailer, so keep feeding it the same handle
    // until it fails or the input is drained.
    fn extract_all(&self, archive: &Path, dest: &Path) -> Result<usize> {
        let file = File::open(archive).map_err(|e| Error::io("open", archive, e))?;
        let total = file
            .metadata()
            .map_err(|e| Error::io("stat", archive, e))?
            .len();
        let max = self.cfg.max_extract_passes;
        let mut passes = 0usize;

        while passes < max {
            let handle = file.try_clone().map_err(|e| Error::io("reopen", archive, e))?;
            let status = self
                .tools
                .command(Tool::Toybox)?
                .args(["cpio", "-idu"])
                .current_dir(dest)
                .stdin_file(handle)
                .status()?;
            if !status.success() {
                if passes == 0 {
                    return Err(Error::tool_failed(Tool::Toybox.name(), status)
                        .context(format!("extracting {}", archive.display())));
                }
                return Ok(passes);
            }
            passes += 1;

            let mut cursor = &file;
            let pos = cursor
                .stream_position()
                .map_err(|e| Error::io("seek", archive, e))?;
            if pos >= total {
                return Ok(passes);
            }
        }

        Err(Error::with_kind(
            ErrorKind::Tool,
            format!(
                "extracting {} did not finish within {max} passes",
                archive.display()
            ),
        ))
    }

    /// Archive `stage_dir` and compress the result into `output`.
    pub fn pack(&self, stage_dir: &Path, output: &Path) -> Result<()> {
        let archive = with_suffix(output, ARCHIVE_EXT);
        self.tools
            .command(Tool::Mkbootfs)?
            .arg(stage_dir)
            .stdout_to(&archive)
            .run()
            .map_err(|e| e.context(format!("archiving {}", stage_dir.display())))?;
        self.tools
            .command(Tool::Lz4)?
            .args(&self.cfg.compress_args)
            .arg(&archive)
            .stdout_to(output)
            .run()
            .map_err(|e| e.context(format!("compressing {}", archive.display())))?;
        Ok(())
    }

    /// Drop `lib/modules` from `original`, repack it, and append the kernel
    /// modules ramdisk: `new = stripped ++ modules`. The modules must trail so
    /// the boot loader layers them over the stripped tree.
    pub fn strip_and_repack(
        &self,
        modules_ramdisk: &Path,
        original: &Path,
        new_ramdisk: &Path,
        work_dir: &Path,
    ) -> Result<()> {
        let stage_dir = work_dir.join(STRIPPED_RAMDISK_DIR);
        if stage_dir.exists() {
            fs::remove_dir_all(&stage_dir).map_err(|e| Error::io("clear", &stage_dir, e))?;
        }
        self.unpack(original, &stage_dir)?;

        let modules_dir = stage_dir.join(MODULES_SUBTREE);
        match fs::remove_dir_all(&modules_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("remove", &modules_dir, e)),
        }

        let stripped = work_dir.join(STRIPPED_RAMDISK);
        self.pack(&stage_dir, &stripped)?;
        let bytes = concat_files(new_ramdisk, &[&stripped, modules_ramdisk])?;
        tracing::debug!(
            output = %new_ramdisk.display(),
            bytes,
            "repacked ramdisk with replacement modules"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_detection() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cases: [(&str, &[u8], bool); 4] = [
            ("exact", b"070701", true),
            ("longer", b"07070100000001", true),
            ("wrong", b"070700", false),
            ("short", b"070", false),
        ];
        for (name, bytes, want) in cases {
            let p = tmp.path().join(name);
            fs::write(&p, bytes).expect("write probe");
            assert_eq!(is_archive_already(&p), want, "case {name}");
        }
        assert!(!is_archive_already(&tmp.path().join("missing")));
    }

    #[test]
    fn fragments_concatenate_in_name_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("vendor_ramdisk01"), b"B").expect("write 01");
        fs::write(tmp.path().join("vendor_ramdisk00"), b"A").expect("write 00");
        fs::write(tmp.path().join("vendor_ramdisk02"), b"C").expect("write 02");
        fs::write(tmp.path().join("dtb"), b"dtb").expect("write dtb");
        fs::write(tmp.path().join("vendor_boot_params"), b"x").expect("write params");

        let out = concatenate_fragments(tmp.path()).expect("concatenate");
        assert_eq!(out, tmp.path().join(CONCATENATED_VENDOR_RAMDISK));
        assert_eq!(fs::read(out).expect("read"), b"ABC");
    }

    #[test]
    fn no_fragments_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("dtb"), b"dtb").expect("write dtb");
        assert!(concatenate_fragments(tmp.path()).is_err());
    }

    #[test]
    fn concat_keeps_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::write(&a, b"stripped").expect("write a");
        fs::write(&b, b"+modules").expect("write b");
        let out = tmp.path().join("out");
        fs::write(&out, b"stale content that is longer").expect("write stale");
        assert_eq!(concat_files(&out, &[&a, &b]).expect("concat"), 16);
        assert_eq!(fs::read(&out).expect("read"), b"stripped+modules");
    }

    #[test]
    fn failed_concat_keeps_previous_output() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = tmp.path().join("a");
        fs::write(&a, b"stripped").expect("write a");
        let out = tmp.path().join("vendor_ramdisk_repacked");
        fs::write(&out, b"previous").expect("write previous");

        let err = concat_files(&out, &[&a, &tmp.path().join("missing_modules")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(fs::read(&out).expect("read"), b"previous");
        assert!(!tmp.path().join("vendor_ramdisk_repacked.partial").exists());

        fs::remove_file(&out).expect("remove previous");
        assert!(concat_files(&out, &[&a, &tmp.path().join("missing_modules")]).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn stale_partial_is_not_a_fragment() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("vendor_ramdisk00"), b"A").expect("write 00");
        fs::write(tmp.path().join("vendor_ramdisk_repacked.partial"), b"X").expect("write partial");
        let out = concatenate_fragments(tmp.path()).expect("concatenate");
        assert_eq!(fs::read(out).expect("read"), b"A");
    }
}
