use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::Context;
use tokio::sync::mpsc;

use crate::error::{PortalError, Result, format_error_chain};
use crate::progress::{ProgressSink, Throttle};

const PROGRESS_EVERY_ENTRIES: u64 = 10;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ExtractReport {
    pub image: PathBuf,
    pub server_dir: PathBuf,
    pub entries: usize,
}

/// Chooses the image to unpack: the most recently modified `*.zip` in the
/// image store, ties broken by file name.
pub fn find_image(images_dir: &Path) -> Result<PathBuf> {
    let no_image = || PortalError::Extraction("no image found".to_string());

    let rd = match fs::read_dir(images_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(no_image()),
        Err(e) => {
            return Err(PortalError::Extraction(format!(
                "read {}: {e}",
                images_dir.display()
            )));
        }
    };

    let mut candidates: Vec<(SystemTime, PathBuf)> = rd
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
        })
        .map(|p| {
            let modified = fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, p)
        })
        .collect();

    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    candidates.into_iter().next().map(|(_, p)| p).ok_or_else(no_image)
}

/// Replaces `server_dir` with the contents of the newest image in `images_dir`.
///
/// The archive is opened before anything is deleted, so a missing or corrupt
/// image leaves the current installation alone. Once unpacking has begun a
/// failure leaves whatever was written so far.
pub async fn extract_latest_image(
    images_dir: &Path,
    server_dir: &Path,
    executable_name: Option<&str>,
    progress: &dyn ProgressSink,
) -> Result<ExtractReport> {
    let image = find_image(images_dir)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let task = tokio::task::spawn_blocking({
        let image = image.clone();
        let server_dir = server_dir.to_path_buf();
        let executable_name = executable_name.map(str::to_string);
        move || {
            extract_image(&image, &server_dir, executable_name.as_deref(), &|m: &str| {
                let _ = tx.send(m.to_string());
            })
        }
    });

    // Channel closes when the blocking task finishes and drops its sender.
    while let Some(message) = rx.recv().await {
        progress.report(&message);
    }

    let entries = task
        .await
        .map_err(|e| PortalError::Extraction(format!("extraction task failed: {e}")))?
        .map_err(|e| PortalError::Extraction(format_error_chain(&e)))?;

    tracing::info!(
        image = %image.display(),
        server_dir = %server_dir.display(),
        entries,
        "image extracted"
    );

    Ok(ExtractReport {
        image,
        server_dir: server_dir.to_path_buf(),
        entries,
    })
}

fn extract_image(
    image: &Path,
    server_dir: &Path,
    executable_name: Option<&str>,
    emit: &dyn Fn(&str),
) -> anyhow::Result<usize> {
    let f = fs::File::open(image).with_context(|| format!("open {}", image.display()))?;
    let mut archive = zip::ZipArchive::new(f).context("read archive")?;
    let total = archive.len();

    let file_name = image
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    emit(&format!(
        "extracting {file_name} to {}",
        server_dir.display()
    ));

    if server_dir.exists() {
        fs::remove_dir_all(server_dir)
            .with_context(|| format!("remove {}", server_dir.display()))?;
    }
    fs::create_dir_all(server_dir).with_context(|| format!("create {}", server_dir.display()))?;

    let mut throttle = Throttle::new(PROGRESS_EVERY_ENTRIES, PROGRESS_INTERVAL);
    let mut processed: u64 = 0;

    for i in 0..total {
        let mut entry = archive.by_index(i).context("read archive entry")?;
        let name = entry.name().to_string();

        if entry.unix_mode().is_some_and(is_symlink_mode) {
            anyhow::bail!("unsupported entry type (symlink): {name}");
        }
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| anyhow::anyhow!("unsupported entry path: {name:?}"))?;
        let out_path = server_dir.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("create {}", out_path.display()))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            let mut out = fs::File::create(&out_path)
                .with_context(|| format!("create {}", out_path.display()))?;
            std::io::copy(&mut entry, &mut out).with_context(|| format!("extract {name}"))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    // Owner keeps read/write on everything unpacked.
                    let mode = (mode & 0o777) | 0o600;
                    fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))
                        .with_context(|| format!("chmod {}", out_path.display()))?;
                }
            }
        }

        processed += 1;
        if throttle.should_emit(processed) {
            emit(&format!("extracting {processed}/{total} entries"));
        }
    }

    if let Some(name) = executable_name {
        mark_executable(&server_dir.join(name))?;
    }

    emit(&format!("extracted {processed} entries"));
    Ok(processed as usize)
}

fn is_symlink_mode(mode: u32) -> bool {
    mode & 0o170000 == 0o120000
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = fs::metadata(path) else {
        return Ok(());
    };
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms).with_context(|| format!("chmod {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
