use std::path::PathBuf;

use clap::Parser;

/// Adaptive media stream downloader.
#[derive(Debug, Parser)]
#[command(name = "sluice", version, about)]
pub struct Cli {
    /// Manifest or media URLs to download.
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Directory for merged output files.
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Maximum simultaneously active downloads.
    #[arg(long, default_value_t = 3)]
    pub max_concurrent: usize,

    /// Concurrent segment fetches per wave.
    #[arg(long, default_value_t = 24)]
    pub wave_size: usize,

    /// Password forwarded as a bearer credential with every request.
    #[arg(long)]
    pub password: Option<String>,

    /// Output title; applies when a single URL is given.
    #[arg(long)]
    pub title: Option<String>,

    /// Print the final registry snapshot as JSON.
    #[arg(long)]
    pub snapshot: bool,

    /// Verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_minimal_invocation() {
        let cli = Cli::parse_from(["sluice", "https://example.com/index.m3u8"]);
        assert_eq!(cli.urls.len(), 1);
        assert_eq!(cli.max_concurrent, 3);
        assert_eq!(cli.wave_size, 24);
        assert!(!cli.snapshot);
    }

    #[test]
    fn test_requires_at_least_one_url() {
        assert!(Cli::try_parse_from(["sluice"]).is_err());
    }
}
