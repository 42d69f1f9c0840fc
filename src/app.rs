use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::aggregate::{self, ReviewTable};
use crate::config::ResolvedConfig;
use crate::domain::{ReviewPages, StrainSlug};
use crate::error::HarvestError;
use crate::http::HttpTransport;
use crate::identity::IdentityPool;
use crate::metadata::{self, MetadataFetcher, StrainTable};
use crate::pacing::{Pacer, PageDelay};
use crate::reviews::ReviewFetcher;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub shuffle: bool,
    pub limit: Option<usize>,
    pub keep_going: bool,
    pub refresh_metadata: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            shuffle: true,
            limit: None,
            keep_going: false,
            refresh_metadata: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrainFetch {
    pub slug: String,
    pub action: String,
    pub pages: usize,
    pub reviews: usize,
    pub artifact_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrainsResult {
    pub strains: usize,
    pub total_reviews: u64,
    pub from_cache: bool,
    pub snapshot_path: String,
    #[serde(skip)]
    pub table: StrainTable,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub strains: usize,
    pub queued: usize,
    pub fetched: usize,
    pub failed: usize,
    pub items: Vec<StrainFetch>,
    pub review_rows: usize,
    pub aggregate_path: Option<String>,
    #[serde(skip)]
    pub table: ReviewTable,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub artifacts: usize,
    pub review_rows: usize,
    pub joined_rows: Option<usize>,
    #[serde(skip)]
    pub table: ReviewTable,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub snapshot_path: String,
    pub snapshot_present: bool,
    pub artifact_dir: String,
    pub artifacts: usize,
    pub aggregate_path: String,
    pub aggregate_present: bool,
    pub proxies: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Run,
    Reviews,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
    pub progress: Option<(usize, usize)>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
            progress: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Serialize)]
struct CheckpointEntry<'a> {
    slug: &'a str,
    pages: &'a ReviewPages,
}

pub struct App<T: HttpTransport, P: Pacer> {
    store: Store,
    config: ResolvedConfig,
    transport: T,
    pacer: P,
    identities: Mutex<IdentityPool>,
    page_delay: PageDelay,
    rng: Mutex<StdRng>,
}

impl<T: HttpTransport, P: Pacer> App<T, P> {
    pub fn new(
        store: Store,
        config: ResolvedConfig,
        transport: T,
        pacer: P,
        identities: IdentityPool,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let page_delay = PageDelay::new(config.page_delay, config.seed);
        Self {
            store,
            config,
            transport,
            pacer,
            identities: Mutex::new(identities),
            page_delay,
            rng: Mutex::new(rng),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn strains(
        &self,
        refresh: bool,
        sink: &dyn ProgressSink,
    ) -> Result<StrainsResult, HarvestError> {
        if refresh && self.store.remove_snapshot()? {
            info!(path = %self.store.snapshot_path(), "discarded cached strain metadata");
        }
        let from_cache = self.store.snapshot_exists();
        sink.event(ProgressEvent::message(if from_cache {
            "phase=Resolve; loading cached strain metadata".to_string()
        } else {
            format!(
                "phase=Resolve; scraping strain metadata ({} strains declared)",
                self.config.listing.total
            )
        }));

        let fetcher = MetadataFetcher::new(
            &self.transport,
            &self.pacer,
            &self.identities,
            &self.config.listing,
        );
        let table = metadata::load_or_fetch(&self.store, &fetcher, &self.config.strain_url_base)?;
        sink.event(ProgressEvent::message(format!(
            "phase=Resolve; {} strains with reviews",
            table.len()
        )));
        Ok(StrainsResult {
            strains: table.len(),
            total_reviews: table.total_reviews(),
            from_cache,
            snapshot_path: self.store.snapshot_path().to_string(),
            table,
        })
    }

    pub fn work_list(&self, table: &StrainTable, shuffle: bool) -> Vec<StrainSlug> {
        let mut slugs = table.slugs_by_review_count();
        if shuffle {
            if let Ok(mut rng) = self.rng.lock() {
                slugs.shuffle(&mut *rng);
            }
        }
        slugs.retain(|slug| !self.store.artifact_exists(slug));
        slugs
    }

    pub fn fetch_reviews(
        &self,
        slug: &StrainSlug,
        sink: &dyn ProgressSink,
    ) -> Result<StrainFetch, HarvestError> {
        self.fetch_reviews_inner(slug, sink).map(|(fetch, _)| fetch)
    }

    fn fetch_reviews_inner(
        &self,
        slug: &StrainSlug,
        sink: &dyn ProgressSink,
    ) -> Result<(StrainFetch, Option<ReviewPages>), HarvestError> {
        let path = self.store.artifact_path(slug);
        if self.store.artifact_exists(slug) {
            sink.event(ProgressEvent::message(format!(
                "phase=Store; {slug} already harvested"
            )));
            return Ok((
                StrainFetch {
                    slug: slug.to_string(),
                    action: "skipped".to_string(),
                    pages: 0,
                    reviews: 0,
                    artifact_path: Some(path.to_string()),
                    error: None,
                },
                None,
            ));
        }

        let started = Instant::now();
        sink.event(ProgressEvent::message(format!(
            "phase=Fetch; reviews for {slug}"
        )));
        let identity = self
            .identities
            .lock()
            .map_err(|_| HarvestError::Identity("identity pool poisoned".to_string()))?
            .checkout();
        let fetcher = ReviewFetcher::new(
            &self.transport,
            &self.pacer,
            &self.page_delay,
            &self.config.reviews,
        )
        .with_sink(sink);
        let pages = fetcher.fetch(slug, &identity)?;

        self.store.ensure_artifact_root()?;
        let path = self.store.write_artifact(slug, &pages)?;
        let reviews: usize = pages.iter().map(Vec::len).sum();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Store; {slug}: {reviews} reviews in {} pages latency_ms={}",
                pages.len(),
                started.elapsed().as_millis()
            ),
            elapsed: Some(started.elapsed()),
            progress: None,
        });

        if pages.len() <= 1 {
            warn!(slug = %slug, "few or no reviews, cooling down");
            self.pacer.sleep(self.config.cooldown);
        }

        Ok((
            StrainFetch {
                slug: slug.to_string(),
                action: "fetched".to_string(),
                pages: pages.len(),
                reviews,
                artifact_path: Some(path.to_string()),
                error: None,
            },
            Some(pages),
        ))
    }

    pub fn run(
        &self,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, HarvestError> {
        let started = Instant::now();
        let strains = self.strains(options.refresh_metadata, sink)?;
        let mut queue = self.work_list(&strains.table, options.shuffle);
        if let Some(limit) = options.limit {
            queue.truncate(limit);
        }
        let queued = queue.len();
        info!(strains = strains.strains, queued, "starting review harvest");

        let mut items = Vec::with_capacity(queued);
        let checkpoints = self.config.checkpoint_every > 0;
        let mut pending: Vec<(StrainSlug, ReviewPages)> = Vec::new();
        let mut checkpointed = false;
        let mut fetched = 0usize;
        let mut failed = 0usize;
        for (index, slug) in queue.iter().enumerate() {
            sink.event(ProgressEvent {
                message: format!("phase=Fetch; strain {} of {queued}: {slug}", index + 1),
                elapsed: Some(started.elapsed()),
                progress: Some((index, queued)),
            });
            match self.fetch_reviews_inner(slug, sink) {
                Ok((item, pages)) => {
                    if let Some(pages) = pages {
                        fetched += 1;
                        if checkpoints {
                            pending.push((slug.clone(), pages));
                            if pending.len() >= self.config.checkpoint_every {
                                checkpointed |= self.append_checkpoint(&mut pending)?;
                            }
                        }
                    }
                    items.push(item);
                }
                Err(err) if options.keep_going => {
                    error!(slug = %slug, error = %err, "strain failed, continuing");
                    sink.event(ProgressEvent::message(format!(
                        "phase=Fetch; {slug} failed: {err}"
                    )));
                    failed += 1;
                    items.push(StrainFetch {
                        slug: slug.to_string(),
                        action: "failed".to_string(),
                        pages: 0,
                        reviews: 0,
                        artifact_path: None,
                        error: Some(err.to_string()),
                    });
                }
                Err(err) => {
                    self.append_checkpoint(&mut pending)?;
                    return Err(err);
                }
            }
        }

        checkpointed |= self.append_checkpoint(&mut pending)?;
        let aggregate_path = checkpointed.then(|| self.store.aggregate_path().to_string());

        sink.event(ProgressEvent {
            message: "phase=Aggregate; merging artifacts".to_string(),
            elapsed: Some(started.elapsed()),
            progress: Some((queued, queued)),
        });
        let aggregated = self.aggregate(true, sink)?;

        Ok(RunResult {
            strains: strains.strains,
            queued,
            fetched,
            failed,
            items,
            review_rows: aggregated.review_rows,
            aggregate_path,
            table: aggregated.table,
        })
    }

    pub fn aggregate(
        &self,
        join: bool,
        sink: &dyn ProgressSink,
    ) -> Result<AggregateResult, HarvestError> {
        let artifacts = self.store.list_artifacts()?.len();
        sink.event(ProgressEvent::message(format!(
            "phase=Aggregate; {artifacts} artifacts"
        )));
        let mut table = aggregate::aggregate(&self.store)?;
        let joined_rows = if join && self.store.snapshot_exists() {
            let entries = self.store.read_snapshot()?;
            let strains = metadata::flatten_strains(&entries, &self.config.strain_url_base)?;
            Some(table.attach_strain_ids(&strains))
        } else {
            None
        };
        Ok(AggregateResult {
            artifacts,
            review_rows: table.len(),
            joined_rows,
            table,
        })
    }

    pub fn status(&self) -> Result<StatusResult, HarvestError> {
        let proxies = self
            .identities
            .lock()
            .map(|pool| pool.proxy_count())
            .unwrap_or(0);
        Ok(StatusResult {
            snapshot_path: self.store.snapshot_path().to_string(),
            snapshot_present: self.store.snapshot_exists(),
            artifact_dir: self.store.artifact_root().to_string(),
            artifacts: self.store.list_artifacts()?.len(),
            aggregate_path: self.store.aggregate_path().to_string(),
            aggregate_present: self.store.aggregate_path().as_std_path().is_file(),
            proxies,
        })
    }

    fn append_checkpoint(
        &self,
        pending: &mut Vec<(StrainSlug, ReviewPages)>,
    ) -> Result<bool, HarvestError> {
        if pending.is_empty() {
            return Ok(false);
        }
        Store::append_json_lines(
            self.store.aggregate_path(),
            &pending
                .iter()
                .map(|(slug, pages)| CheckpointEntry {
                    slug: slug.as_str(),
                    pages,
                })
                .collect::<Vec<_>>(),
        )?;
        info!(
            strains = pending.len(),
            path = %self.store.aggregate_path(),
            "appended aggregate checkpoint"
        );
        pending.clear();
        Ok(true)
    }
}
