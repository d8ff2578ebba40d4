use async_trait::async_trait;
use crate::core::model::{Download, Settings};
use crate::plugins::registry::WorkerDriver;
use crate::plugins::ytdlp::locator::find_ytdlp;
use std::path::PathBuf;
use tokio::sync::OnceCell;

const OUTPUT_TEMPLATE: &str = "%(title).200s [%(id)s].%(ext)s";

pub struct YtDlpDriver {
    explicit_bin: Option<PathBuf>,
    // only a successful lookup is cached; a missing binary is looked for again next time
    located: OnceCell<PathBuf>,
}

impl YtDlpDriver {
    pub fn new(explicit_bin: Option<PathBuf>) -> Self {
        Self { explicit_bin, located: OnceCell::new() }
    }

    fn format_selector(download: &Download, settings: &Settings) -> Option<String> {
        if let Some(fid) = download.format_id.as_deref().filter(|f| !f.trim().is_empty()) {
            return Some(fid.to_string());
        }
        if let Some(q) = download.options.quality.as_deref() {
            if let Ok(h) = q.trim_end_matches('p').parse::<u32>() {
                return Some(if download.options.audio_only {
                    "ba/b".to_string()
                } else {
                    format!("bv*[height<={h}]+ba/b[height<={h}]/bv*+ba/b")
                });
            }
        }
        if download.options.audio_only {
            return Some("ba/b".to_string());
        }
        settings.default_format.clone()
    }
}

#[async_trait]
impl WorkerDriver for YtDlpDriver {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn locate(&self) -> Option<PathBuf> {
        self.located
            .get_or_try_init(|| async { find_ytdlp(self.explicit_bin.as_deref()).await.ok_or(()) })
            .await
            .ok()
            .cloned()
    }

    fn build_args(&self, download: &Download, settings: &Settings, resume: bool) -> Vec<String> {
        let mut args = vec!["--newline".to_string(), "--no-colors".to_string()];

        if let Some(f) = Self::format_selector(download, settings) {
            args.push("-f".to_string());
            args.push(f);
        }

        if download.options.audio_only {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(download.options.audio_format.clone().unwrap_or_else(|| "mp3".to_string()));
        }

        args.push("-o".to_string());
        args.push(settings.download_directory.join(OUTPUT_TEMPLATE).to_string_lossy().to_string());

        if let Some(proxy) = &settings.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }

        if settings.speed_limit > 0 {
            args.push("-r".to_string());
            args.push(format!("{}K", settings.speed_limit));
        }

        if resume {
            args.push("--continue".to_string());
        }

        // keeps a URL starting with '-' from being read as an option
        args.push("--".to_string());
        args.push(download.url.clone());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{DownloadOptions, DownloadRequest};

    fn settings() -> Settings {
        Settings {
            concurrency: 2,
            speed_limit: 0,
            download_directory: PathBuf::from("/data/videos"),
            proxy: None,
            default_format: None,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).map(|s| s.as_str())
    }

    #[test]
    fn plain_download_ends_with_separator_and_url() {
        let d = Download::new(DownloadRequest::new("https://example.com/v/1"), 1);
        let args = YtDlpDriver::new(None).build_args(&d, &settings(), false);

        assert_eq!(&args[args.len() - 2..], ["--".to_string(), "https://example.com/v/1".to_string()]);
        assert!(!args.contains(&"-f".to_string()));
        assert!(!args.contains(&"--continue".to_string()));
        assert_eq!(
            value_after(&args, "-o"),
            Some("/data/videos/%(title).200s [%(id)s].%(ext)s")
        );
    }

    #[test]
    fn format_id_beats_quality_and_default_format() {
        let mut req = DownloadRequest::new("https://example.com/v/1");
        req.format_id = Some("22".into());
        req.options.quality = Some("720p".into());
        let d = Download::new(req, 1);
        let mut s = settings();
        s.default_format = Some("worst".into());

        let args = YtDlpDriver::new(None).build_args(&d, &s, false);
        assert_eq!(value_after(&args, "-f"), Some("22"));
    }

    #[test]
    fn quality_maps_to_height_filter() {
        let mut req = DownloadRequest::new("https://example.com/v/1");
        req.options.quality = Some("720p".into());
        let d = Download::new(req, 1);

        let args = YtDlpDriver::new(None).build_args(&d, &settings(), false);
        assert_eq!(value_after(&args, "-f"), Some("bv*[height<=720]+ba/b[height<=720]/bv*+ba/b"));
    }

    #[test]
    fn audio_proxy_limit_and_resume() {
        let mut req = DownloadRequest::new("https://example.com/v/1");
        req.options = DownloadOptions { audio_only: true, audio_format: Some("opus".into()), quality: None };
        let d = Download::new(req, 1);
        let mut s = settings();
        s.proxy = Some("http://proxy:3128".into());
        s.speed_limit = 750;

        let args = YtDlpDriver::new(None).build_args(&d, &s, true);
        assert!(args.contains(&"-x".to_string()));
        assert_eq!(value_after(&args, "--audio-format"), Some("opus"));
        assert_eq!(value_after(&args, "-f"), Some("ba/b"));
        assert_eq!(value_after(&args, "--proxy"), Some("http://proxy:3128"));
        assert_eq!(value_after(&args, "-r"), Some("750K"));
        assert!(args.contains(&"--continue".to_string()));
    }
}
