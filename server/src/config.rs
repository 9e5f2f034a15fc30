use std::path::PathBuf;

use anyhow::{bail, Context};

use crate::storage::listing::{validate_date_format, DEFAULT_DATE_FORMAT};
use crate::storage::range::DEFAULT_MAX_CHUNK;

#[derive(Clone, Debug)]
pub struct Config {
    pub root: PathBuf,
    pub host: String,
    pub http_port: u16,
    pub overwrite: bool,
    pub max_chunk_size: u64,
    pub date_format: String,
    pub static_dir: Option<PathBuf>,
    pub on_receive: Option<String>,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let root = match var("QUICKHUB_ROOT") {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().context("Cannot determine working directory")?,
        };

        let config = Config {
            root,
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            http_port: var("HTTP_PORT")
                .unwrap_or_else(|| "3006".to_string())
                .parse()
                .context("HTTP_PORT must be a port number")?,
            overwrite: match var("QUICKHUB_OVERWRITE") {
                Some(v) => parse_bool(&v).context("QUICKHUB_OVERWRITE must be true or false")?,
                None => false,
            },
            max_chunk_size: match var("QUICKHUB_MAX_CHUNK") {
                Some(v) => v.parse().context("QUICKHUB_MAX_CHUNK must be a byte count")?,
                None => DEFAULT_MAX_CHUNK,
            },
            date_format: var("QUICKHUB_DATE_FORMAT").unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string()),
            static_dir: var("QUICKHUB_STATIC_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            on_receive: var("QUICKHUB_ON_RECEIVE").filter(|v| !v.trim().is_empty()),
            cors_origins: var("CORS_ORIGINS")
                .map(|v| split_origins(&v))
                .unwrap_or_default(),
        };
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_chunk_size == 0 {
            bail!("max chunk size must be greater than zero");
        }
        validate_date_format(&self.date_format).map_err(anyhow::Error::msg)?;
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("not a boolean: {other}"),
    }
}

pub fn split_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
