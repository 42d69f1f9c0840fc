use camino::Utf8Path;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{ReviewPages, StrainSlug};
use crate::error::HarvestError;
use crate::metadata::StrainTable;
use crate::store::{Store, artifact_slug};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRecord {
    pub strain_slug: String,
    pub strain_id: Option<u64>,
    pub review_id: String,
    pub username: Option<String>,
    pub created: String,
    pub form: Option<String>,
    pub language: Option<String>,
    pub rating: Option<f64>,
    pub upvotes: u64,
    pub text: Option<String>,
}

impl ReviewRecord {
    fn created_at(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.created).ok()
    }
}

#[derive(Debug, Deserialize)]
struct RawReview {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    username: Option<String>,
    created: String,
    #[serde(default)]
    form: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(rename = "upvotesCount", default)]
    upvotes_count: Option<u64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "strainSlug", default)]
    strain_slug: Option<String>,
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "review id must be a number or string, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReviewTable {
    rows: Vec<ReviewRecord>,
}

impl ReviewTable {
    pub fn from_rows(mut rows: Vec<ReviewRecord>) -> Self {
        rows.sort_by_cached_key(sort_key);
        Self { rows }
    }

    pub fn rows(&self) -> &[ReviewRecord] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<ReviewRecord> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn attach_strain_ids(&mut self, strains: &StrainTable) -> usize {
        let mut matched = 0;
        for row in &mut self.rows {
            row.strain_id = strains.by_slug(&row.strain_slug).map(|s| s.strain_id);
            if row.strain_id.is_some() {
                matched += 1;
            }
        }
        matched
    }
}

// Within a strain, unparseable `created` values come first, ordered as text.
fn sort_key(row: &ReviewRecord) -> (String, Option<DateTime<FixedOffset>>, String) {
    (
        row.strain_slug.clone(),
        row.created_at(),
        row.created.clone(),
    )
}

pub fn flatten_artifact(
    pages: &ReviewPages,
    slug: &StrainSlug,
) -> Result<Vec<ReviewRecord>, HarvestError> {
    let mut rows = Vec::new();
    for (page_index, page) in pages.iter().enumerate() {
        for (index, raw) in page.iter().enumerate() {
            let review: RawReview = serde_json::from_value(raw.clone()).map_err(|err| {
                HarvestError::MalformedResponse {
                    context: format!("{slug} page {} review {index}", page_index + 1),
                    message: err.to_string(),
                }
            })?;
            rows.push(ReviewRecord {
                strain_slug: review.strain_slug.unwrap_or_else(|| slug.to_string()),
                strain_id: None,
                review_id: review.id,
                username: review.username,
                created: review.created,
                form: review.form,
                language: review.language,
                rating: review.rating,
                upvotes: review.upvotes_count.unwrap_or(0),
                text: review.text,
            });
        }
    }
    Ok(rows)
}

fn flatten_file(path: &Utf8Path) -> Result<Vec<ReviewRecord>, HarvestError> {
    let slug = artifact_slug(path).ok_or_else(|| HarvestError::ArtifactCorrupt {
        path: path.to_string(),
        message: "file name does not encode a strain slug".to_string(),
    })?;
    let pages = Store::read_artifact(path)?;
    if pages.first().is_none() {
        debug!(path = %path, "artifact has no pages, skipping");
        return Ok(Vec::new());
    }
    flatten_artifact(&pages, &slug)
}

pub fn aggregate(store: &Store) -> Result<ReviewTable, HarvestError> {
    let paths = store.list_artifacts()?;
    let mut rows = Vec::new();
    for path in &paths {
        rows.extend(flatten_file(path)?);
    }
    info!(
        artifacts = paths.len(),
        reviews = rows.len(),
        "aggregated review artifacts"
    );
    Ok(ReviewTable::from_rows(rows))
}
