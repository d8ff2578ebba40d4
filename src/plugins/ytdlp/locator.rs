use crate::core::paths::managed_bin_dir;
use std::path::{Path, PathBuf};
use std::process::Stdio;

fn bin_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    }
}

fn on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

async fn responds_to_version(bin: &Path) -> bool {
    tokio::process::Command::new(bin)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Explicit path first, then `PATH`, then the managed bin directory.
/// Installing the binary is someone else's job; nothing here downloads it.
pub async fn find_ytdlp(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return p.is_file().then(|| p.to_path_buf());
    }

    if let Some(found) = on_path(bin_name()) {
        if responds_to_version(&found).await {
            return Some(found);
        }
        tracing::warn!(path = %found.display(), "yt-dlp on PATH does not run");
    }

    let managed = managed_bin_dir().join(bin_name());
    managed.is_file().then_some(managed)
}
