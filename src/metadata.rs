use std::collections::HashSet;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::{StrainSlug, page_count};
use crate::error::HarvestError;
use crate::http::{HttpTransport, RetryPolicy};
use crate::identity::IdentityPool;
use crate::pacing::Pacer;
use crate::store::Store;

pub const CANNABINOIDS: [&str; 5] = ["cbc", "cbd", "cbg", "thc", "thcv"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrainRecord {
    pub strain_id: u64,
    pub category: Option<String>,
    pub name: String,
    pub review_count: u64,
    pub slug: StrainSlug,
    pub url: String,
    pub cbc_p50: Option<f64>,
    pub cbd_p50: Option<f64>,
    pub cbg_p50: Option<f64>,
    pub thc_p50: Option<f64>,
    pub thcv_p50: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StrainTable {
    rows: Vec<StrainRecord>,
}

impl StrainTable {
    pub fn rows(&self) -> &[StrainRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, strain_id: u64) -> Option<&StrainRecord> {
        self.rows.iter().find(|row| row.strain_id == strain_id)
    }

    pub fn by_slug(&self, slug: &str) -> Option<&StrainRecord> {
        self.rows.iter().find(|row| row.slug.as_str() == slug)
    }

    pub fn slugs_by_review_count(&self) -> Vec<StrainSlug> {
        let mut rows = self.rows.iter().collect::<Vec<_>>();
        rows.sort_by(|a, b| b.review_count.cmp(&a.review_count));
        rows.into_iter().map(|row| row.slug.clone()).collect()
    }

    pub fn total_reviews(&self) -> u64 {
        self.rows.iter().map(|row| row.review_count).sum()
    }
}

pub fn flatten_strains(entries: &[Value], url_base: &str) -> Result<StrainTable, HarvestError> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let record = project_strain(entry, url_base).map_err(|message| {
            HarvestError::MalformedResponse {
                context: format!("listing entry {index}"),
                message,
            }
        })?;
        if record.review_count == 0 {
            continue;
        }
        if !seen.insert(record.strain_id) {
            continue;
        }
        rows.push(record);
    }
    Ok(StrainTable { rows })
}

fn project_strain(entry: &Value, url_base: &str) -> Result<StrainRecord, String> {
    let strain_id = entry
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| "missing numeric id".to_string())?;
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("strain {strain_id}: missing name"))?
        .to_string();
    let review_count = entry
        .get("reviewCount")
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("strain {strain_id}: missing reviewCount"))?;
    let raw_slug = entry
        .get("slug")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("strain {strain_id}: missing slug"))?;
    let slug: StrainSlug = raw_slug.parse().map_err(|err: HarvestError| err.to_string())?;
    let category = entry
        .get("category")
        .and_then(Value::as_str)
        .map(|value| value.to_string());
    let percentile = |chem: &str| {
        entry
            .get("cannabinoids")
            .and_then(|value| value.get(chem))
            .and_then(|value| value.get("percentile50"))
            .and_then(Value::as_f64)
    };

    Ok(StrainRecord {
        strain_id,
        category,
        name,
        review_count,
        url: format!("{url_base}{slug}"),
        slug,
        cbc_p50: percentile(CANNABINOIDS[0]),
        cbd_p50: percentile(CANNABINOIDS[1]),
        cbg_p50: percentile(CANNABINOIDS[2]),
        thc_p50: percentile(CANNABINOIDS[3]),
        thcv_p50: percentile(CANNABINOIDS[4]),
    })
}

pub fn listing_batch(page: &Value) -> Result<Vec<Value>, HarvestError> {
    page.get("hits")
        .and_then(|hits| hits.get("strain"))
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| HarvestError::MalformedResponse {
            context: "listing page".to_string(),
            message: "expected an array at hits.strain".to_string(),
        })
}

#[derive(Debug, Clone)]
pub struct ListingSettings {
    pub url: String,
    pub page_size: u32,
    pub total: u64,
    pub retry: RetryPolicy,
}

impl ListingSettings {
    pub fn page_url(&self, page: u64) -> String {
        let skip = page * u64::from(self.page_size);
        format!("{}?skip={}&take={}", self.url, skip, self.page_size)
    }
}

pub struct MetadataFetcher<'a, T: HttpTransport + ?Sized, P: Pacer + ?Sized> {
    transport: &'a T,
    pacer: &'a P,
    identities: &'a Mutex<IdentityPool>,
    settings: &'a ListingSettings,
}

impl<'a, T: HttpTransport + ?Sized, P: Pacer + ?Sized> MetadataFetcher<'a, T, P> {
    pub fn new(
        transport: &'a T,
        pacer: &'a P,
        identities: &'a Mutex<IdentityPool>,
        settings: &'a ListingSettings,
    ) -> Self {
        Self {
            transport,
            pacer,
            identities,
            settings,
        }
    }

    pub fn fetch_raw(&self) -> Result<Vec<Value>, HarvestError> {
        let pages = page_count(self.settings.total, self.settings.page_size);
        info!(pages, total = self.settings.total, "scraping strain metadata");
        let mut batches = Vec::new();
        for page in 0..pages {
            let identity = self
                .identities
                .lock()
                .map_err(|_| HarvestError::Identity("identity pool poisoned".to_string()))?
                .checkout();
            let url = self.settings.page_url(page);
            let response = self.settings.retry.send_with_retries(
                self.transport,
                self.pacer,
                &url,
                &identity,
                &|_| {},
            )?;
            let body: Value = response.json(&url)?;
            let batch = listing_batch(&body)?;
            if batch.is_empty() {
                warn!(page, "listing page came back empty, stopping early");
                break;
            }
            batches.push(batch);
        }
        Ok(batches.into_iter().flatten().collect())
    }
}

pub fn load_or_fetch<T: HttpTransport + ?Sized, P: Pacer + ?Sized>(
    store: &Store,
    fetcher: &MetadataFetcher<'_, T, P>,
    url_base: &str,
) -> Result<StrainTable, HarvestError> {
    let entries = if store.snapshot_exists() {
        info!(path = %store.snapshot_path(), "loading existing strain metadata");
        store.read_snapshot()?
    } else {
        let entries = fetcher.fetch_raw()?;
        store.write_snapshot(&entries)?;
        entries
    };
    flatten_strains(&entries, url_base)
}
