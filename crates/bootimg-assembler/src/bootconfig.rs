//! Bootconfig trailer codec.
//!
//! Layout appended to a ramdisk, read back-to-front by the boot loader:
//!
//! ```text
//! config bytes            preamble ++ vendor ++ persistent, trailing NULs trimmed
//! u32 LE                  config length
//! u32 LE                  sum of config bytes, mod 2^32
//! "#BOOTCONFIG\n"         magic
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};

pub const BOOTCONFIG_MAGIC: &[u8; 12] = b"#BOOTCONFIG\n";

/// Boot-state assertions a real boot loader would inject ahead of the
/// vendor and persistent parameters.
pub const PREAMBLE: &str = "androidboot.slot_suffix=_a\n\
                            androidboot.force_normal_boot=1\n\
                            androidboot.verifiedbootstate=orange\n";

const SIZE_LEN: usize = 4;
const CHECKSUM_LEN: usize = 4;
/// Bytes following the config body.
pub const FOOTER_LEN: usize = SIZE_LEN + CHECKSUM_LEN + BOOTCONFIG_MAGIC.len();

/// Drop trailing NUL padding; interior NULs are kept.
pub fn trim_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_add(u32::from(*b)))
}

/// `preamble ++ vendor ++ persistent`, with the block padding of the
/// persistent region trimmed off the end.
pub fn build_config(vendor: &[u8], persistent: &[u8]) -> Vec<u8> {
    let mut config = Vec::with_capacity(PREAMBLE.len() + vendor.len() + persistent.len());
    config.extend_from_slice(PREAMBLE.as_bytes());
    config.extend_from_slice(vendor);
    config.extend_from_slice(persistent);
    let keep = trim_trailing_nuls(&config).len();
    config.truncate(keep);
    config
}

/// Serialize the full trailer: config body, length, checksum and magic.
pub fn build_trailer(vendor: &[u8], persistent: &[u8]) -> Result<Vec<u8>> {
    let config = build_config(vendor, persistent);
    let size = u32::try_from(config.len()).map_err(|_| {
        Error::validation(format!(
            "bootconfig of {} bytes does not fit the 32-bit size field",
            config.len()
        ))
    })?;
    let sum = checksum(&config);

    let mut out = config;
    out.reserve(FOOTER_LEN);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&sum.to_le_bytes());
    out.extend_from_slice(BOOTCONFIG_MAGIC);
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTrailer<'a> {
    pub config: &'a [u8],
    pub size: u32,
    pub checksum: u32,
}

/// Locate and verify the trailer at the end of `buf`, which may be a whole
/// initrd or just the trailer bytes.
pub fn parse_trailer(buf: &[u8]) -> Result<ParsedTrailer<'_>> {
    if buf.len() < FOOTER_LEN || !buf.ends_with(BOOTCONFIG_MAGIC) {
        return Err(Error::validation("missing #BOOTCONFIG trailer magic"));
    }
    let footer = &buf[buf.len() - FOOTER_LEN..];
    let size = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let stored_sum = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]);

    let body_end = buf.len() - FOOTER_LEN;
    let body_start = body_end.checked_sub(size as usize).ok_or_else(|| {
        Error::validation(format!(
            "bootconfig size {size} exceeds the {body_end} bytes before the trailer"
        ))
    })?;
    let config = &buf[body_start..body_end];

    let actual = checksum(config);
    if actual != stored_sum {
        return Err(Error::validation(format!(
            "bootconfig checksum mismatch: stored {stored_sum:#010x}, computed {actual:#010x}"
        )));
    }
    Ok(ParsedTrailer {
        config,
        size,
        checksum: stored_sum,
    })
}

/// Write `boot ramdisk ++ vendor ramdisk ++ trailer` to `initrd`, replacing
/// any previous content.
pub fn assemble_gem5_ramdisk(
    initrd: &Path,
    boot_ramdisk: &Path,
    vendor_ramdisk: &Path,
    trailer: &[u8],
) -> Result<()> {
    let out = File::create(initrd).map_err(|e| Error::io("create", initrd, e))?;
    let mut out = BufWriter::new(out);
    for src in [boot_ramdisk, vendor_ramdisk] {
        let mut f = File::open(src).map_err(|e| Error::io("open", src, e))?;
        io::copy(&mut f, &mut out).map_err(|e| Error::io("append to", initrd, e))?;
    }
    out.write_all(trailer)
        .and_then(|()| out.flush())
        .map_err(|e| Error::io("write", initrd, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn footer_fields(trailer: &[u8]) -> (u32, u32) {
        let f = &trailer[trailer.len() - FOOTER_LEN..];
        (
            u32::from_le_bytes(f[0..4].try_into().unwrap()),
            u32::from_le_bytes(f[4..8].try_into().unwrap()),
        )
    }

    #[test]
    fn exact_layout() {
        let trailer = build_trailer(b"androidboot.hardware=cutf\n", b"persist=1\n\0\0\0\0")
            .expect("trailer");
        let config = format!("{PREAMBLE}androidboot.hardware=cutf\npersist=1\n");
        let mut want = config.as_bytes().to_vec();
        want.extend_from_slice(&(config.len() as u32).to_le_bytes());
        want.extend_from_slice(&checksum(config.as_bytes()).to_le_bytes());
        want.extend_from_slice(b"#BOOTCONFIG\n");
        assert_eq!(trailer, want);
    }

    #[test]
    fn size_and_checksum_describe_the_body() {
        let inputs: [(&[u8], &[u8]); 4] = [
            (b"", b""),
            (b"a=1\n", b"\0\0\0"),
            (b"x=\xff\xfe\n", b"k=v\0inner\n\0"),
            (&[0xffu8; 300], b"tail"),
        ];
        for (vendor, persistent) in inputs {
            let trailer = build_trailer(vendor, persistent).expect("trailer");
            let (size, sum) = footer_fields(&trailer);
            let magic_at = trailer.len() - BOOTCONFIG_MAGIC.len();
            let size_at = magic_at - CHECKSUM_LEN - SIZE_LEN;
            assert_eq!(size as usize, size_at);
            assert_eq!(sum, checksum(&trailer[..size_at]));
            assert_eq!(&trailer[magic_at..], BOOTCONFIG_MAGIC);
        }
    }

    #[test]
    fn checksum_uses_unsigned_bytes_and_wraps() {
        assert_eq!(checksum(&[0xff, 0x01]), 0x100);
        let big = vec![0xffu8; (u32::MAX as usize / 0xff) + 2];
        let expected = (big.len() as u64 * 0xff) as u32;
        assert_eq!(checksum(&big), expected);
    }

    #[test]
    fn only_trailing_nuls_are_trimmed() {
        assert_eq!(trim_trailing_nuls(b"a\0b\0\0"), b"a\0b");
        assert_eq!(trim_trailing_nuls(b"\0\0"), b"");
        assert_eq!(trim_trailing_nuls(b""), b"");
        let once = trim_trailing_nuls(b"k=v\n\0\0\0");
        assert_eq!(trim_trailing_nuls(once), once);
    }

    #[test]
    fn vendor_padding_is_trimmed_when_persistent_is_empty() {
        let config = build_config(b"v=1\n\0\0", b"");
        assert!(config.ends_with(b"v=1\n"));
    }

    #[test]
    fn parse_round_trips_inside_a_larger_buffer() {
        let trailer = build_trailer(b"a=1\n", b"b=2\n\0\0").expect("trailer");
        let mut initrd = b"RAMDISK-BYTES".to_vec();
        initrd.extend_from_slice(&trailer);
        let parsed = parse_trailer(&initrd).expect("parse");
        assert_eq!(parsed.config, format!("{PREAMBLE}a=1\nb=2\n").as_bytes());
        assert_eq!(parsed.size as usize, parsed.config.len());
    }

    #[test]
    fn parse_rejects_corruption() {
        let mut trailer = build_trailer(b"a=1\n", b"").expect("trailer");
        trailer[0] ^= 0x01;
        let err = parse_trailer(&trailer).unwrap_err();
        assert!(err.to_string().contains("checksum"), "{err}");
        assert!(parse_trailer(b"no magic here").is_err());
    }

    #[test]
    fn gem5_ramdisk_is_boot_then_vendor_then_trailer() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let boot = tmp.path().join("ramdisk");
        let vendor = tmp.path().join("vendor");
        let initrd = tmp.path().join("initrd");
        std::fs::write(&boot, b"BOOT").expect("write boot");
        std::fs::write(&vendor, b"VENDOR").expect("write vendor");
        std::fs::write(&initrd, vec![b'x'; 64]).expect("write stale initrd");

        let trailer = build_trailer(b"", b"").expect("trailer");
        assemble_gem5_ramdisk(&initrd, &boot, &vendor, &trailer).expect("assemble");

        let got = std::fs::read(&initrd).expect("read initrd");
        let mut want = b"BOOTVENDOR".to_vec();
        want.extend_from_slice(&trailer);
        assert_eq!(got, want);
    }
}
