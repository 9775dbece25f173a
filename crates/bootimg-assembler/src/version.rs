use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::avb::Avb;
use crate::config::AssemblerConfig;
use crate::error::{Error, Result};
use crate::kv::{OS_VERSION_KEY, extract_value};
use crate::staging::{BOOT_PARAMS, StagingDir};
use crate::tools::ToolRunner;

/// Reported when the image was built without an OS version.
pub const DEFAULT_VERSION: &str = "0.0.0";

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[1-9][0-9]*(\.[0-9]+)*$").expect("static regex"))
}

/// Read the Android OS version recorded in a boot image's AVB properties.
///
/// The dump goes to a throwaway directory that is removed before returning.
pub fn read_android_version(
    tools: &ToolRunner,
    cfg: &AssemblerConfig,
    boot_image: &Path,
) -> Result<String> {
    let parent = cfg.staging.resolved_temp_dir();
    let tmp = tempfile::Builder::new()
        .prefix("bootimg-version-")
        .tempdir_in(&parent)
        .map_err(|e| Error::io("create temp dir in", &parent, e))?;
    let dir = StagingDir::new(tmp.path());

    Avb::new(tools, &cfg.avb)
        .info_image(boot_image, &dir.join(BOOT_PARAMS))
        .map_err(|e| {
            e.context(format!(
                "\"{}\" boot image unpack into \"{}\" failed",
                boot_image.display(),
                tmp.path().display()
            ))
        })?;
    let dump = dir.read_text(BOOT_PARAMS)?;
    drop(tmp);

    let raw = extract_value(&dump, OS_VERSION_KEY);
    let version = normalize_version(&raw)?;
    if version == DEFAULT_VERSION {
        tracing::info!(
            image = %boot_image.display(),
            "could not extract os version, defaulting to {DEFAULT_VERSION}"
        );
    }
    Ok(version)
}

/// Strip quoting, map an unset value to [`DEFAULT_VERSION`], and validate.
pub fn normalize_version(raw: &str) -> Result<String> {
    let unquoted = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    if unquoted.is_empty() || unquoted == "None" {
        return Ok(DEFAULT_VERSION.to_string());
    }
    if !version_re().is_match(unquoted) {
        return Err(Error::validation(format!(
            "Version string is not a valid version \"{unquoted}\""
        )));
    }
    Ok(unquoted.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn quoted_version_is_unquoted() {
        assert_eq!(normalize_version("'14.0.0'").expect("valid"), "14.0.0");
        assert_eq!(normalize_version("13").expect("valid"), "13");
    }

    #[test]
    fn unset_version_defaults() {
        assert_eq!(normalize_version("None").expect("none"), "0.0.0");
        assert_eq!(normalize_version("'None'").expect("quoted none"), "0.0.0");
        assert_eq!(normalize_version("").expect("missing"), "0.0.0");
    }

    #[test]
    fn malformed_versions_are_rejected() {
        for bad in ["abc", "'0.1'", "14.", "14..0", "v14.0.0", "1 4"] {
            let err = normalize_version(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{bad}");
        }
        let err = normalize_version("abc").unwrap_err();
        assert!(err.to_string().contains("\"abc\""), "{err}");
    }
}
