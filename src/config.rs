use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_QUALITY: &str = "best";
const DEFAULT_EXTRACTOR: &str = "yt-dlp";
const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;

/// Centralized application configuration.
/// Merges CLI arguments, environment variables and the optional config file,
/// in that order of precedence.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub video: String,
    pub destination: String,
    pub access_grant: String,
    pub quality: String,
    pub extractor_path: PathBuf,
    pub progress_interval: Duration,
}

/// Command-line configuration.
#[derive(Parser, Debug)]
#[command(
    name = "y2sj",
    author,
    version,
    about = "Download a video and store it in a bucket",
    long_about = "Download a video from its ID or URL and put it in a bucket.\n\
                  You will need an access grant to the project where the video should be stored."
)]
pub struct Args {
    /// Video identifier or URL
    pub video: String,

    /// Destination, `sj://<bucket>[/<key>]`
    pub destination: String,

    /// Access grant to the destination project (overrides Y2SJ_ACCESS_GRANT)
    #[arg(long)]
    pub access_grant: Option<String>,

    /// Quality: `best`, a label such as `720p` or `hd720`, or a yt-dlp format
    /// selector (overrides Y2SJ_QUALITY)
    #[arg(short, long)]
    pub quality: Option<String>,

    /// Path to the yt-dlp binary (overrides Y2SJ_YT_DLP)
    #[arg(long = "yt-dlp")]
    pub yt_dlp: Option<PathBuf>,

    /// Config file to read instead of the default search path
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Minimum delay between progress lines, in milliseconds
    #[arg(long)]
    pub progress_interval_ms: Option<u64>,
}

/// On-disk configuration, `config.toml`.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub storj: StorjSection,
    pub video: VideoSection,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct StorjSection {
    pub access_grant: Option<String>,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct VideoSection {
    pub quality: Option<String>,
    pub extractor_path: Option<PathBuf>,
    pub progress_interval_ms: Option<u64>,
}

impl FileConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parsing config file")
    }

    /// Load `explicit` if given (it must exist), otherwise the first file
    /// found on the default search path. No file at all is fine.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            return Self::parse(&raw).with_context(|| path.display().to_string());
        }

        for path in search_path() {
            match fs::read_to_string(&path) {
                Ok(raw) => {
                    tracing::debug!("using config file {}", path.display());
                    return Self::parse(&raw).with_context(|| path.display().to_string());
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("reading config file {}", path.display()));
                }
            }
        }
        Ok(Self::default())
    }
}

/// `./config.toml`, then `$XDG_CONFIG_HOME/y2sj/config.toml`, then
/// `$HOME/.config/y2sj/config.toml`.
fn search_path() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.toml")];
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        paths.push(PathBuf::from(xdg).join("y2sj").join("config.toml"));
    }
    if let Some(home) = env::var_os("HOME").filter(|v| !v.is_empty()) {
        paths.push(
            PathBuf::from(home)
                .join(".config")
                .join("y2sj")
                .join("config.toml"),
        );
    }
    paths
}

/// Values read from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub access_grant: Option<String>,
    pub quality: Option<String>,
    pub extractor_path: Option<PathBuf>,
    pub progress_interval_ms: Option<u64>,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self> {
        let progress_interval_ms = match env::var("Y2SJ_PROGRESS_INTERVAL_MS") {
            Ok(value) => Some(
                value
                    .parse::<u64>()
                    .with_context(|| format!("parsing Y2SJ_PROGRESS_INTERVAL_MS value `{}`", value))?,
            ),
            Err(env::VarError::NotPresent) => None,
            Err(err) => return Err(err).context("reading Y2SJ_PROGRESS_INTERVAL_MS"),
        };

        Ok(Self {
            access_grant: non_empty(env::var("Y2SJ_ACCESS_GRANT").ok()),
            quality: non_empty(env::var("Y2SJ_QUALITY").ok()),
            extractor_path: env::var_os("Y2SJ_YT_DLP")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            progress_interval_ms,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Parse CLI args, environment and config file into an AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();
        let env_cfg = EnvConfig::from_env()?;
        let file_cfg = FileConfig::load(args.config.as_deref())?;
        Self::merge(args, env_cfg, file_cfg)
    }

    /// Flag beats environment, environment beats file, file beats default.
    pub fn merge(args: Args, env_cfg: EnvConfig, file_cfg: FileConfig) -> Result<Self> {
        let access_grant = non_empty(args.access_grant)
            .or(env_cfg.access_grant)
            .or(non_empty(file_cfg.storj.access_grant));
        let Some(access_grant) = access_grant else {
            bail!(
                "no access grant: pass --access-grant, set Y2SJ_ACCESS_GRANT \
                 or add storj.access_grant to config.toml"
            );
        };

        let quality = non_empty(args.quality)
            .or(env_cfg.quality)
            .or(non_empty(file_cfg.video.quality))
            .unwrap_or_else(|| DEFAULT_QUALITY.into());

        let extractor_path = args
            .yt_dlp
            .or(env_cfg.extractor_path)
            .or(file_cfg.video.extractor_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTRACTOR));

        let interval_ms = args
            .progress_interval_ms
            .or(env_cfg.progress_interval_ms)
            .or(file_cfg.video.progress_interval_ms)
            .unwrap_or(DEFAULT_PROGRESS_INTERVAL_MS);

        Ok(Self {
            video: args.video,
            destination: args.destination,
            access_grant,
            quality,
            extractor_path,
            progress_interval: Duration::from_millis(interval_ms),
        })
    }
}
