use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;
use crate::http::RetryPolicy;
use crate::identity::{DEFAULT_USER_AGENT, ProxyEntry, load_lines, normalize_proxy};
use crate::metadata::ListingSettings;
use crate::pacing::{DelayPolicy, checked_secs};
use crate::reviews::ReviewSettings;
use crate::store::Store;

pub const DEFAULT_CONFIG_FILE: &str = "leafly-harvest.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub reviews_url: Option<String>,
    #[serde(default)]
    pub strain_url_base: Option<String>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub strain_total: Option<u64>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub snapshot_path: Option<String>,
    #[serde(default)]
    pub aggregate_path: Option<String>,
    #[serde(default)]
    pub checkpoint_every: Option<usize>,
    #[serde(default)]
    pub page_delay: Option<DelayPolicy>,
    #[serde(default)]
    pub cooldown_secs: Option<f64>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub user_agents: Vec<String>,
    #[serde(default)]
    pub user_agents_file: Option<String>,
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
    #[serde(default)]
    pub proxies_file: Option<String>,
    #[serde(default)]
    pub rotate_every: Option<usize>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub listing: Option<RetryEntry>,
    #[serde(default)]
    pub reviews: Option<RetryEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub statuses: Option<Vec<u16>>,
    #[serde(default)]
    pub fallback_delay_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub listing: ListingSettings,
    pub reviews: ReviewSettings,
    pub strain_url_base: String,
    pub output_dir: Utf8PathBuf,
    pub snapshot_path: Utf8PathBuf,
    pub aggregate_path: Utf8PathBuf,
    pub checkpoint_every: usize,
    pub page_delay: DelayPolicy,
    pub cooldown: Duration,
    pub user_agents: Vec<String>,
    pub proxies: Vec<String>,
    pub rotate_every: usize,
    pub request_timeout: Option<Duration>,
    pub seed: Option<u64>,
}

impl ResolvedConfig {
    pub fn store(&self) -> Store {
        Store::new(
            self.output_dir.clone(),
            self.snapshot_path.clone(),
            self.aggregate_path.clone(),
        )
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let page_size = config.page_size.unwrap_or(50);
        if page_size == 0 {
            return Err(HarvestError::InvalidConfig(
                "page_size must be greater than 0".to_string(),
            ));
        }

        let listing_url = config.listing_url.unwrap_or_else(|| {
            "https://consumer-api.leafly.com/api/strain_playlists/v2".to_string()
        });
        let reviews_url = config.reviews_url.unwrap_or_else(|| {
            "https://www.leafly.com/web-strain-explorer/api/strains/{slug}/reviews".to_string()
        });
        let strain_url_base = config
            .strain_url_base
            .unwrap_or_else(|| "https://www.leafly.com/strains/".to_string());
        for (name, url) in [
            ("listing_url", &listing_url),
            ("reviews_url", &reviews_url),
            ("strain_url_base", &strain_url_base),
        ] {
            if !url.starts_with("http") {
                return Err(HarvestError::InvalidConfig(format!(
                    "{name} must start with http(s): {url}"
                )));
            }
        }
        if !reviews_url.contains("{slug}") {
            return Err(HarvestError::InvalidConfig(format!(
                "reviews_url must contain a {{slug}} placeholder: {reviews_url}"
            )));
        }

        let page_delay = config.page_delay.unwrap_or_default();
        page_delay.validate()?;
        let cooldown = checked_secs("cooldown_secs", config.cooldown_secs.unwrap_or(3.0))?;

        let output_dir =
            Utf8PathBuf::from(config.output_dir.unwrap_or_else(|| "reviews".to_string()));
        let snapshot_path = Utf8PathBuf::from(
            config
                .snapshot_path
                .unwrap_or_else(|| "strains_metadata.json".to_string()),
        );
        let aggregate_path = Utf8PathBuf::from(
            config
                .aggregate_path
                .unwrap_or_else(|| "reviews_aggregate.jsonl".to_string()),
        );
        for (name, path) in [
            ("snapshot_path", &snapshot_path),
            ("aggregate_path", &aggregate_path),
        ] {
            if path
                .parent()
                .is_some_and(|parent| same_dir(parent, &output_dir))
            {
                return Err(HarvestError::InvalidConfig(format!(
                    "{name} must not live inside output_dir: {path}"
                )));
            }
        }

        let mut user_agents = config.user_agents;
        if let Some(file) = &config.user_agents_file {
            user_agents.extend(load_lines(Path::new(file))?);
        }
        if user_agents.is_empty() {
            user_agents.push(DEFAULT_USER_AGENT.to_string());
        }

        let mut proxies = config
            .proxies
            .iter()
            .map(ProxyEntry::to_url)
            .collect::<Result<Vec<_>, HarvestError>>()?;
        if let Some(file) = &config.proxies_file {
            for line in load_lines(Path::new(file))? {
                proxies.push(normalize_proxy(&line)?);
            }
        }

        Ok(ResolvedConfig {
            schema_version,
            listing: ListingSettings {
                url: listing_url,
                page_size,
                total: config.strain_total.unwrap_or(5867),
                retry: resolve_retry(config.retry.listing, RetryPolicy::no_retry())?,
            },
            reviews: ReviewSettings {
                url_template: reviews_url,
                page_size,
                retry: resolve_retry(config.retry.reviews, RetryPolicy::single_retry())?,
            },
            strain_url_base,
            output_dir,
            snapshot_path,
            aggregate_path,
            checkpoint_every: config.checkpoint_every.unwrap_or(10),
            page_delay,
            cooldown,
            user_agents,
            proxies,
            rotate_every: config.rotate_every.unwrap_or(50),
            request_timeout: config.request_timeout_secs.map(Duration::from_secs),
            seed: config.seed,
        })
    }
}

fn same_dir(a: &Utf8Path, b: &Utf8Path) -> bool {
    fn significant<'a>(path: &'a Utf8Path) -> Vec<Utf8Component<'a>> {
        path.components()
            .filter(|component| *component != Utf8Component::CurDir)
            .collect::<Vec<_>>()
    }
    significant(a) == significant(b)
}

fn resolve_retry(
    entry: Option<RetryEntry>,
    default: RetryPolicy,
) -> Result<RetryPolicy, HarvestError> {
    let Some(entry) = entry else {
        return Ok(default);
    };
    let fallback_delay = match entry.fallback_delay_secs {
        Some(secs) => checked_secs("fallback_delay_secs", secs)?,
        None => default.fallback_delay,
    };
    Ok(RetryPolicy {
        max_retries: entry.max_retries.unwrap_or(default.max_retries),
        retryable_statuses: entry.statuses.unwrap_or(default.retryable_statuses),
        fallback_delay,
    })
}
