use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub trait Pacer: Send + Sync {
    fn sleep(&self, duration: Duration);
}

impl<P: Pacer + ?Sized> Pacer for &P {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelayPolicy {
    Fixed(f64),
    Normal { mean_secs: f64, std_dev_secs: f64 },
}

impl Default for DelayPolicy {
    fn default() -> Self {
        DelayPolicy::Fixed(3.0)
    }
}

impl DelayPolicy {
    pub fn validate(&self) -> Result<(), HarvestError> {
        match *self {
            DelayPolicy::Fixed(secs) => checked_secs("page_delay", secs).map(|_| ()),
            DelayPolicy::Normal {
                mean_secs,
                std_dev_secs,
            } => {
                checked_secs("page_delay.mean_secs", mean_secs)?;
                checked_secs("page_delay.std_dev_secs", std_dev_secs)?;
                Ok(())
            }
        }
    }
}

pub struct PageDelay {
    policy: DelayPolicy,
    rng: Mutex<StdRng>,
}

impl PageDelay {
    pub fn new(policy: DelayPolicy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            policy,
            rng: Mutex::new(rng),
        }
    }

    pub fn policy(&self) -> DelayPolicy {
        self.policy
    }

    pub fn next(&self) -> Duration {
        let secs = match self.policy {
            DelayPolicy::Fixed(secs) => secs,
            DelayPolicy::Normal {
                mean_secs,
                std_dev_secs,
            } => match Normal::new(mean_secs, std_dev_secs) {
                Ok(normal) => match self.rng.lock() {
                    Ok(mut rng) => normal.sample(&mut *rng),
                    Err(_) => mean_secs,
                },
                Err(_) => mean_secs,
            },
        };
        secs_to_duration(secs)
    }
}

pub fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

pub fn checked_secs(name: &str, secs: f64) -> Result<Duration, HarvestError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        HarvestError::InvalidConfig(format!(
            "{name} must be a non-negative number of seconds, got {secs}"
        ))
    })
}
