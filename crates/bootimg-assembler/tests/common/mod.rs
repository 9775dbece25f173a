#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use bootimg_assembler::Assembler;
use bootimg_assembler::config::AssemblerConfig;
use bootimg_assembler::tools::Tool;

// Writing an executable while another test thread forks can leave the write
// fd open in the child (ETXTBSY on exec), so tests that install and spawn
// fake tools run one at a time.
static LOCK: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Archive format understood by the fake `mkbootfs`/`toybox` pair: the newc
/// magic, one path per line, then a trailer line.
pub fn fake_archive(paths: &[&str]) -> Vec<u8> {
    let mut out = String::from("070701\n");
    for p in paths {
        out.push_str(p);
        out.push('\n');
    }
    out.push_str("TRAILER!!!\n");
    out.into_bytes()
}

pub fn fake_lz4(data: &[u8]) -> Vec<u8> {
    let mut out = b"LZ4".to_vec();
    out.extend_from_slice(data);
    out
}

pub const BOOT_RAMDISK: &[u8] = b"070701\ninit\nTRAILER!!!\n";
pub const VENDOR_BOOTCONFIG: &str = "androidboot.hardware=fake\nkernel.mod.param=1\n";

const UNPACK_BOOTIMG: &str = r#"#!/bin/sh
echo "$*" >> "$0.calls"
img=
out=
while [ $# -gt 0 ]; do
  case "$1" in
    --boot_img) img=$2; shift 2 ;;
    --out) out=$2; shift 2 ;;
    *) shift ;;
  esac
done
[ -n "$img" ] && [ -n "$out" ] || exit 2
mkdir -p "$out"
fixtures="$(dirname "$0")/fixtures"
if grep -q vendor "$img"; then
  cp "$fixtures/vendor_ramdisk00" "$out/vendor_ramdisk00"
  cp "$fixtures/vendor_ramdisk01" "$out/vendor_ramdisk01"
  cp "$fixtures/dtb" "$out/dtb"
  cp "$fixtures/bootconfig" "$out/bootconfig"
  printf 'boot magic: VNDRBOOT\nvendor command line args: console=ttyS0 kernel.foo=1\n'
else
  cp "$fixtures/ramdisk" "$out/ramdisk"
  printf 'boot magic: ANDROID!\ncommand line args: androidboot.foo=bar\n'
fi
"#;

const MKBOOTIMG: &str = r#"#!/bin/sh
echo "$*" >> "$0.calls"
out=
prev=
for a in "$@"; do
  case "$prev" in
    -o|--vendor_boot) out=$a ;;
  esac
  prev=$a
done
[ -n "$out" ] || exit 2
printf '%s\n' "$@" > "$out"
"#;

const AVBTOOL: &str = r#"#!/bin/sh
echo "$*" >> "$0.calls"
cmd=$1
shift
case "$cmd" in
  add_hash_footer)
    img=
    prev=
    for a in "$@"; do
      [ "$prev" = "--image" ] && img=$a
      prev=$a
    done
    [ -n "$img" ] || exit 2
    printf 'AVB %s\n' "$*" >> "$img"
    ;;
  info_image)
    cat "$(dirname "$0")/fixtures/avb_info"
    ;;
  *)
    exit 2
    ;;
esac
"#;

const MKBOOTFS: &str = r#"#!/bin/sh
echo "$*" >> "$0.calls"
cd "$1" || exit 1
echo 070701
find . -type f | sed 's|^\./||' | LC_ALL=C sort
echo 'TRAILER!!!'
"#;

const LZ4: &str = r#"#!/bin/sh
echo "$*" >> "$0.calls"
last=
decompress=0
for a in "$@"; do
  [ "$a" = "-d" ] && decompress=1
  last=$a
done
if [ "$decompress" = 1 ]; then
  tail -c +4 "$last"
else
  printf 'LZ4'
  cat "$last"
fi
"#;

// Extracts exactly one archive per run, leaving the shared stdin offset
// just past its trailer.
const TOYBOX: &str = r#"#!/bin/sh
echo "$*" >> "$0.calls"
IFS= read -r magic || exit 1
[ "$magic" = "070701" ] || exit 1
while IFS= read -r line; do
  if [ "$line" = "TRAILER!!!" ]; then
    exit 0
  fi
  mkdir -p "$(dirname "$line")"
  printf '%s\n' "$line" > "$line"
done
exit 1
"#;

/// Host bin dir populated with shell stand-ins for every tool.
pub struct FakeHost {
    pub root: tempfile::TempDir,
}

impl FakeHost {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let host = Self { root };
        fs::create_dir_all(host.fixtures()).expect("create fixtures dir");
        fs::create_dir_all(host.temp_dir()).expect("create temp dir");

        host.install(Tool::UnpackBootimg, UNPACK_BOOTIMG);
        host.install(Tool::Mkbootimg, MKBOOTIMG);
        host.install(Tool::Avbtool, AVBTOOL);
        host.install(Tool::Mkbootfs, MKBOOTFS);
        host.install(Tool::Lz4, LZ4);
        host.install(Tool::Toybox, TOYBOX);

        host.fixture(
            "vendor_ramdisk00",
            &fake_lz4(&fake_archive(&["first_stage.rc", "lib/modules/old.ko"])),
        );
        host.fixture("vendor_ramdisk01", &fake_archive(&["etc/fstab"]));
        host.fixture("dtb", b"fake dtb");
        host.fixture("bootconfig", VENDOR_BOOTCONFIG.as_bytes());
        host.fixture("ramdisk", BOOT_RAMDISK);
        host.set_os_version("'14.0.0'");
        host
    }

    pub fn bin(&self) -> PathBuf {
        self.root.path().join("bin")
    }

    pub fn fixtures(&self) -> PathBuf {
        self.bin().join("fixtures")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.path().join("tmp")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn install(&self, tool: Tool, script: &str) {
        let p = self.bin().join(tool.name());
        fs::write(&p, script).expect("write tool script");
        fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).expect("chmod tool");
        let _ = fs::remove_file(self.bin().join(format!("{}.calls", tool.name())));
    }

    pub fn fixture(&self, name: &str, bytes: &[u8]) {
        fs::write(self.fixtures().join(name), bytes).expect("write fixture");
    }

    pub fn set_os_version(&self, raw: &str) {
        self.set_avb_info(&format!(
            "Footer version:           1.0\n\
             Descriptors:\n    \
             Prop: com.android.build.boot.os_version -> {raw}\n    \
             Prop: com.android.build.boot.security_patch -> '2024-01-05'\n"
        ));
    }

    pub fn set_avb_info(&self, text: &str) {
        self.fixture("avb_info", text.as_bytes());
    }

    /// Argument lines recorded by one fake tool, one per invocation.
    pub fn calls(&self, tool: Tool) -> Vec<String> {
        let p = self.bin().join(format!("{}.calls", tool.name()));
        match fs::read_to_string(p) {
            Ok(s) => s.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn config(&self) -> AssemblerConfig {
        let mut cfg = AssemblerConfig::default();
        cfg.tools.host_bin_dir = Some(self.bin());
        cfg.staging.temp_dir = Some(self.temp_dir());
        cfg
    }

    pub fn assembler(&self) -> Assembler {
        Assembler::from_config(self.config())
    }

    /// Fake images only need to be told apart by the unpack stand-in.
    pub fn boot_image(&self) -> PathBuf {
        let p = self.path("boot.img");
        fs::write(&p, b"ANDROID! boot image").expect("write boot image");
        p
    }

    pub fn vendor_boot_image(&self) -> PathBuf {
        let p = self.path("vendor_boot.img");
        fs::write(&p, b"VNDRBOOT vendor boot image").expect("write vendor boot image");
        p
    }

    pub fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let p = self.path(name);
        fs::write(&p, bytes).expect("write input");
        p
    }
}

/// Lines of a file written by the fake `mkbootimg`.
pub fn image_lines(p: &Path) -> Vec<String> {
    fs::read_to_string(p)
        .expect("read image")
        .lines()
        .map(str::to_string)
        .collect()
}

/// Value following `flag` in a fake image's argument lines.
pub fn flag_value(lines: &[String], flag: &str) -> Option<String> {
    lines
        .iter()
        .position(|l| l == flag)
        .and_then(|i| lines.get(i + 1))
        .cloned()
}
