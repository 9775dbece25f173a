use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::commit::CommitOutcome;
use crate::error::{Error, Result};
use crate::repack::ImageKind;

/// What one repack run left at its committed path.
#[derive(Debug, Clone, Serialize)]
pub struct RepackReport {
    pub image: ImageKind,
    pub output: PathBuf,
    pub outcome: CommitOutcome,
    pub bytes: u64,
    pub sha256: String,
}

impl RepackReport {
    pub fn for_committed(image: ImageKind, output: &Path, outcome: CommitOutcome) -> Result<Self> {
        let (bytes, sha256) = sha256_file_hex(output)?;
        tracing::info!(
            image = %image,
            output = %output.display(),
            outcome = ?outcome,
            sha256 = %sha256,
            "repack finished"
        );
        Ok(Self {
            image,
            output: output.to_path_buf(),
            outcome,
            bytes,
            sha256,
        })
    }
}

#[derive(Serialize)]
struct ReportDoc<'a> {
    generated_at: chrono::DateTime<chrono::Utc>,
    reports: &'a [RepackReport],
}

/// Write the reports as pretty JSON to `path`, creating parent dirs.
pub fn write_json_report(path: &Path, reports: &[RepackReport]) -> Result<()> {
    let doc = ReportDoc {
        generated_at: chrono::Utc::now(),
        reports,
    };
    let body = serde_json::to_string_pretty(&doc)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        crate::staging::ensure_dir(parent)?;
    }
    fs::write(path, body).map_err(|e| Error::io("write", path, e))
}

fn sha256_file_hex(path: &Path) -> Result<(u64, String)> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path).map_err(|e| Error::io("open", path, e))?;
    let mut hasher = Sha256::new();
    let bytes = io::copy(&mut file, &mut hasher).map_err(|e| Error::io("hash", path, e))?;
    Ok((bytes, hex::encode(hasher.finalize())))
}
