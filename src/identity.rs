use std::fs;
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::HarvestError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Identity {
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
}

/// Pool of user agents and proxies. The active identity is re-rolled every
/// `rotate_every` checkouts rather than per request.
pub struct IdentityPool {
    user_agents: Vec<String>,
    proxies: Vec<String>,
    rotate_every: usize,
    checkouts: usize,
    current: Identity,
    rng: StdRng,
}

impl IdentityPool {
    pub fn new(
        user_agents: Vec<String>,
        proxies: Vec<String>,
        rotate_every: usize,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut pool = Self {
            user_agents,
            proxies,
            rotate_every,
            checkouts: 0,
            current: Identity::default(),
            rng,
        };
        pool.reroll();
        pool
    }

    pub fn fixed(identity: Identity) -> Self {
        Self {
            user_agents: identity.user_agent.iter().cloned().collect(),
            proxies: identity.proxy.iter().cloned().collect(),
            rotate_every: 0,
            checkouts: 0,
            current: identity,
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn current(&self) -> &Identity {
        &self.current
    }

    pub fn checkout(&mut self) -> Identity {
        if self.rotate_every > 0 && self.checkouts > 0 && self.checkouts % self.rotate_every == 0 {
            self.reroll();
            if let Some(proxy) = &self.current.proxy {
                info!(proxy = %proxy, "rotated identity");
            }
        }
        self.checkouts += 1;
        self.current.clone()
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    fn reroll(&mut self) {
        self.current = Identity {
            user_agent: self.user_agents.choose(&mut self.rng).cloned(),
            proxy: self.proxies.choose(&mut self.rng).cloned(),
        };
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ProxyEntry {
    Shorthand(String),
    Detailed(ProxyEntryObject),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyEntryObject {
    pub url: String,
}

impl ProxyEntry {
    pub fn to_url(&self) -> Result<String, HarvestError> {
        let raw = match self {
            ProxyEntry::Shorthand(value) => value.trim(),
            ProxyEntry::Detailed(obj) => obj.url.trim(),
        };
        normalize_proxy(raw)
    }
}

pub fn normalize_proxy(raw: &str) -> Result<String, HarvestError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains(char::is_whitespace) {
        return Err(HarvestError::Identity(format!("invalid proxy entry: {raw:?}")));
    }
    if raw.contains("://") {
        Ok(raw.to_string())
    } else {
        Ok(format!("http://{raw}"))
    }
}

pub fn load_lines(path: &Path) -> Result<Vec<String>, HarvestError> {
    let content = fs::read_to_string(path)
        .map_err(|err| HarvestError::Identity(format!("read {}: {err}", path.display())))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
