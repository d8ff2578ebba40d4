use std::path::PathBuf;

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("media-queue"))
        .unwrap_or_else(|| PathBuf::from(".media-queue"))
}

pub fn default_db_path() -> PathBuf {
    data_dir().join("queue.sqlite")
}

pub fn managed_bin_dir() -> PathBuf {
    data_dir().join("bin")
}

/// `PATH` with the managed bin directory in front, so workers can find helpers
/// (ffmpeg and friends) installed next to them.
pub fn enhanced_path() -> String {
    let sep = if cfg!(windows) { ";" } else { ":" };
    let current = std::env::var("PATH").unwrap_or_default();
    format!("{}{}{}", managed_bin_dir().display(), sep, current)
}
