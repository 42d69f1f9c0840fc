use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use leafly_harvest::app::{App, ProgressEvent, ProgressSink, RunOptions};
use leafly_harvest::config::{Config, ConfigLoader, ResolvedConfig};
use leafly_harvest::domain::StrainSlug;
use leafly_harvest::error::HarvestError;
use leafly_harvest::http::{HttpResponse, HttpTransport};
use leafly_harvest::identity::{Identity, IdentityPool};
use leafly_harvest::output::JsonOutput;
use leafly_harvest::pacing::{DelayPolicy, Pacer};
use leafly_harvest::store::Store;

const LISTING: &str = "https://listing.test/strains";
const REVIEWS: &str = "https://reviews.test/{slug}/reviews";

#[derive(Default)]
struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn push(&self, url: impl Into<String>, status: u16, body: Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(url.into())
            .or_default()
            .push_back(HttpResponse::new(status, body.to_string()));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl HttpTransport for ScriptedTransport {
    fn get(&self, url: &str, _identity: &Identity) -> Result<HttpResponse, HarvestError> {
        self.calls.lock().unwrap().push(url.to_string());
        self.responses
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| HarvestError::Http(format!("unscripted request {url}")))
    }
}

#[derive(Default)]
struct RecordingPacer {
    sleeps: Mutex<Vec<Duration>>,
}

impl Pacer for RecordingPacer {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

fn test_config() -> ResolvedConfig {
    config_with_checkpoint(1)
}

fn config_with_checkpoint(every: usize) -> ResolvedConfig {
    ConfigLoader::resolve_config(Config {
        listing_url: Some(LISTING.to_string()),
        reviews_url: Some(REVIEWS.to_string()),
        strain_total: Some(2),
        page_delay: Some(DelayPolicy::Fixed(1.0)),
        cooldown_secs: Some(7.0),
        checkpoint_every: Some(every),
        seed: Some(7),
        ..Config::default()
    })
    .unwrap()
}

fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::in_dir(&root);
    (temp, store)
}

fn strain(id: u64, slug: &str, reviews: u64) -> Value {
    json!({
        "id": id,
        "name": slug.to_uppercase(),
        "category": "Hybrid",
        "reviewCount": reviews,
        "slug": slug,
        "cannabinoids": {"thc": {"percentile50": 17.5}}
    })
}

fn review(id: u64, slug: &str, created: &str) -> Value {
    json!({
        "id": id,
        "username": "reviewer",
        "created": created,
        "form": "flower",
        "language": "en",
        "rating": 4.0,
        "upvotesCount": 1,
        "text": "ok",
        "strainSlug": slug
    })
}

fn review_page(records: Vec<Value>, total: u64) -> Value {
    json!({"data": records, "metadata": {"totalCount": total}})
}

fn listing_url() -> String {
    format!("{LISTING}?skip=0&take=50")
}

fn review_url(slug: &str, page: u64) -> String {
    format!("https://reviews.test/{slug}/reviews?take=50&page={page}")
}

fn checkpoint_lines(store: &Store) -> Vec<Value> {
    std::fs::read_to_string(store.aggregate_path().as_std_path())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn no_shuffle() -> RunOptions {
    RunOptions {
        shuffle: false,
        ..RunOptions::default()
    }
}

fn script_two_strains(transport: &ScriptedTransport) {
    transport.push(
        listing_url(),
        200,
        json!({"hits": {"strain": [strain(1, "alpha", 2), strain(2, "beta", 60)]}}),
    );
    transport.push(
        review_url("beta", 1),
        200,
        review_page(vec![review(20, "beta", "2021-05-01T00:00:00Z")], 60),
    );
    transport.push(
        review_url("beta", 2),
        200,
        review_page(vec![review(21, "beta", "2020-05-01T00:00:00Z")], 60),
    );
    transport.push(
        review_url("alpha", 1),
        200,
        review_page(vec![review(10, "alpha", "2019-01-01T00:00:00Z")], 1),
    );
}

#[test]
fn run_fetches_most_reviewed_first_and_aggregates() {
    let (_temp, store) = temp_store();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    script_two_strains(&transport);

    let app = App::new(
        store.clone(),
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );
    let result = app.run(no_shuffle(), &JsonOutput).unwrap();

    assert_eq!(
        transport.calls(),
        vec![
            listing_url(),
            review_url("beta", 1),
            review_url("beta", 2),
            review_url("alpha", 1),
        ]
    );
    assert_eq!(result.strains, 2);
    assert_eq!(result.fetched, 2);
    assert_eq!(result.failed, 0);
    assert_eq!(result.review_rows, 3);

    // One inter-page delay for beta, one cooldown after single-page alpha.
    assert_eq!(
        *pacer.sleeps.lock().unwrap(),
        vec![Duration::from_secs(1), Duration::from_secs(7)]
    );

    let rows = result.table.rows();
    assert_eq!(
        rows.iter().map(|r| r.review_id.as_str()).collect::<Vec<_>>(),
        vec!["10", "21", "20"]
    );
    assert_eq!(rows[0].strain_id, Some(1));
    assert_eq!(rows[1].strain_id, Some(2));

    let alpha: StrainSlug = "alpha".parse().unwrap();
    let pages = Store::read_artifact(&store.artifact_path(&alpha)).unwrap();
    assert_eq!(pages.len(), 1);

    let dump = checkpoint_lines(&store);
    assert_eq!(dump.len(), 2);
    assert_eq!(dump[0]["slug"], "beta");
    assert_eq!(dump[0]["pages"].as_array().unwrap().len(), 2);
    assert!(store.snapshot_exists());
}

#[test]
fn second_run_makes_no_requests_and_leaves_artifacts_alone() {
    let (_temp, store) = temp_store();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    script_two_strains(&transport);
    let app = App::new(
        store.clone(),
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );
    app.run(no_shuffle(), &JsonOutput).unwrap();

    let beta: StrainSlug = "beta".parse().unwrap();
    let before = std::fs::read(store.artifact_path(&beta).as_std_path()).unwrap();

    let idle = ScriptedTransport::default();
    let idle_pacer = RecordingPacer::default();
    let app = App::new(
        store.clone(),
        test_config(),
        &idle,
        &idle_pacer,
        IdentityPool::fixed(Identity::default()),
    );
    let result = app.run(RunOptions::default(), &JsonOutput).unwrap();

    assert!(idle.calls().is_empty());
    assert!(idle_pacer.sleeps.lock().unwrap().is_empty());
    assert_eq!(result.queued, 0);
    assert_eq!(result.fetched, 0);
    assert_eq!(result.review_rows, 3);
    assert!(result.aggregate_path.is_none());
    let after = std::fs::read(store.artifact_path(&beta).as_std_path()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn checkpoint_appends_batches_across_runs() {
    let (_temp, store) = temp_store();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    script_two_strains(&transport);
    let app = App::new(
        store.clone(),
        config_with_checkpoint(2),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );
    let result = app.run(no_shuffle(), &JsonOutput).unwrap();
    assert!(result.aggregate_path.is_some());
    assert_eq!(checkpoint_lines(&store).len(), 2);

    let alpha: StrainSlug = "alpha".parse().unwrap();
    std::fs::remove_file(store.artifact_path(&alpha).as_std_path()).unwrap();
    let transport = ScriptedTransport::default();
    transport.push(
        review_url("alpha", 1),
        200,
        review_page(vec![review(11, "alpha", "2019-02-01T00:00:00Z")], 1),
    );
    let app = App::new(
        store.clone(),
        config_with_checkpoint(2),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );
    app.run(no_shuffle(), &JsonOutput).unwrap();

    let lines = checkpoint_lines(&store);
    assert_eq!(
        lines.iter().map(|line| line["slug"].as_str().unwrap()).collect::<Vec<_>>(),
        vec!["beta", "alpha", "alpha"]
    );
    assert_eq!(lines[2]["pages"][0][0]["id"], 11);
}

#[test]
fn fatal_failure_flushes_pending_checkpoint() {
    let (_temp, store) = temp_store();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    transport.push(
        listing_url(),
        200,
        json!({"hits": {"strain": [strain(1, "good", 100), strain(2, "bad", 3)]}}),
    );
    transport.push(
        review_url("good", 1),
        200,
        review_page(vec![review(5, "good", "2022-01-01T00:00:00Z")], 1),
    );
    transport.push(review_url("bad", 1), 500, json!({"error": "boom"}));
    let app = App::new(
        store.clone(),
        config_with_checkpoint(10),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );

    let err = app.run(no_shuffle(), &JsonOutput).unwrap_err();
    assert_matches!(err, HarvestError::Status { status: 500, .. });
    let lines = checkpoint_lines(&store);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["slug"], "good");
}

#[test]
fn disabled_checkpoint_writes_nothing() {
    let (_temp, store) = temp_store();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    script_two_strains(&transport);
    let app = App::new(
        store.clone(),
        config_with_checkpoint(0),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );
    let result = app.run(no_shuffle(), &JsonOutput).unwrap();
    assert!(result.aggregate_path.is_none());
    assert!(!store.aggregate_path().as_std_path().exists());
}

#[test]
fn review_retries_reach_the_progress_sink() {
    let (_temp, store) = temp_store();
    let slug: StrainSlug = "alpha".parse().unwrap();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    let sink = RecordingSink::default();
    transport.push(review_url("alpha", 1), 429, json!({"error": "slow down"}));
    transport.push(
        review_url("alpha", 1),
        200,
        review_page(vec![review(10, "alpha", "2019-01-01T00:00:00Z")], 1),
    );
    let app = App::new(
        store,
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );

    let result = app.fetch_reviews(&slug, &sink).unwrap();
    assert_eq!(result.action, "fetched");
    let messages = sink.messages.lock().unwrap();
    assert!(
        messages
            .iter()
            .any(|message| message == "phase=Fetch; alpha page 1: status 429, retry 1 in 5.0s")
    );
    assert_eq!(
        *pacer.sleeps.lock().unwrap(),
        vec![Duration::from_secs(5), Duration::from_secs(7)]
    );
}

fn script_failing_first(transport: &ScriptedTransport) {
    transport.push(
        listing_url(),
        200,
        json!({"hits": {"strain": [strain(1, "bad", 100), strain(2, "good", 3)]}}),
    );
    transport.push(review_url("bad", 1), 500, json!({"error": "boom"}));
    transport.push(
        review_url("good", 1),
        200,
        review_page(vec![review(5, "good", "2022-01-01T00:00:00Z")], 1),
    );
}

#[test]
fn failure_aborts_run_without_keep_going() {
    let (_temp, store) = temp_store();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    script_failing_first(&transport);
    let app = App::new(
        store.clone(),
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );

    let err = app.run(no_shuffle(), &JsonOutput).unwrap_err();
    assert_matches!(err, HarvestError::Status { status: 500, .. });
    let bad: StrainSlug = "bad".parse().unwrap();
    let good: StrainSlug = "good".parse().unwrap();
    assert!(!store.artifact_exists(&bad));
    assert!(!store.artifact_exists(&good));
}

#[test]
fn keep_going_records_failure_and_continues() {
    let (_temp, store) = temp_store();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    script_failing_first(&transport);
    let app = App::new(
        store.clone(),
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );

    let options = RunOptions {
        shuffle: false,
        keep_going: true,
        ..RunOptions::default()
    };
    let result = app.run(options, &JsonOutput).unwrap();
    assert_eq!(result.failed, 1);
    assert_eq!(result.fetched, 1);
    assert_eq!(result.items[0].action, "failed");
    assert!(result.items[0].error.as_deref().unwrap().contains("500"));

    let bad: StrainSlug = "bad".parse().unwrap();
    let good: StrainSlug = "good".parse().unwrap();
    assert!(!store.artifact_exists(&bad));
    assert!(store.artifact_exists(&good));
}

#[test]
fn work_list_skips_harvested_strains() {
    let (_temp, store) = temp_store();
    store
        .write_snapshot(&[strain(1, "alpha", 2), strain(2, "beta", 60), strain(3, "gamma", 9)])
        .unwrap();
    let beta: StrainSlug = "beta".parse().unwrap();
    store.ensure_artifact_root().unwrap();
    store.write_artifact(&beta, &vec![vec![]]).unwrap();

    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    let app = App::new(
        store,
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );
    let strains = app.strains(false, &JsonOutput).unwrap();
    assert!(strains.from_cache);
    let queue = app.work_list(&strains.table, false);
    assert_eq!(
        queue.iter().map(StrainSlug::as_str).collect::<Vec<_>>(),
        vec!["gamma", "alpha"]
    );
    assert!(transport.calls().is_empty());
}

#[test]
fn seeded_shuffle_is_reproducible() {
    let (_temp, store) = temp_store();
    let entries = (1..=20)
        .map(|id| strain(id, &format!("s{id}"), id))
        .collect::<Vec<_>>();
    store.write_snapshot(&entries).unwrap();

    let queue_for = |store: Store| {
        let transport = ScriptedTransport::default();
        let pacer = RecordingPacer::default();
        let app = App::new(
            store,
            test_config(),
            &transport,
            &pacer,
            IdentityPool::fixed(Identity::default()),
        );
        let strains = app.strains(false, &JsonOutput).unwrap();
        app.work_list(&strains.table, true)
    };
    let first = queue_for(store.clone());
    let second = queue_for(store);
    assert_eq!(first.len(), 20);
    assert_eq!(first, second);
}

#[test]
fn fetch_reviews_skips_existing_artifact() {
    let (_temp, store) = temp_store();
    let slug: StrainSlug = "alpha".parse().unwrap();
    store.ensure_artifact_root().unwrap();
    store.write_artifact(&slug, &vec![vec![json!({"id": 1})]]).unwrap();

    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    let app = App::new(
        store,
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );
    let result = app.fetch_reviews(&slug, &JsonOutput).unwrap();
    assert_eq!(result.action, "skipped");
    assert!(transport.calls().is_empty());
}

#[test]
fn zero_reviews_still_writes_artifact_and_cools_down() {
    let (_temp, store) = temp_store();
    let slug: StrainSlug = "quiet".parse().unwrap();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    transport.push(review_url("quiet", 1), 200, review_page(vec![], 0));
    let app = App::new(
        store.clone(),
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );

    let result = app.fetch_reviews(&slug, &JsonOutput).unwrap();
    assert_eq!(result.action, "fetched");
    assert_eq!(result.pages, 1);
    assert_eq!(result.reviews, 0);
    let pages = Store::read_artifact(&store.artifact_path(&slug)).unwrap();
    assert_eq!(pages, vec![Vec::<Value>::new()]);
    assert_eq!(*pacer.sleeps.lock().unwrap(), vec![Duration::from_secs(7)]);
}

#[test]
fn refresh_discards_snapshot() {
    let (_temp, store) = temp_store();
    store.write_snapshot(&[strain(1, "stale", 4)]).unwrap();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    transport.push(
        listing_url(),
        200,
        json!({"hits": {"strain": [strain(2, "fresh", 4)]}}),
    );
    let app = App::new(
        store.clone(),
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );

    let strains = app.strains(true, &JsonOutput).unwrap();
    assert!(!strains.from_cache);
    assert!(strains.table.by_slug("fresh").is_some());
    assert!(strains.table.by_slug("stale").is_none());
    assert_eq!(transport.calls(), vec![listing_url()]);
}

#[test]
fn status_reports_store_state() {
    let (_temp, store) = temp_store();
    let slug: StrainSlug = "alpha".parse().unwrap();
    store.ensure_artifact_root().unwrap();
    store.write_artifact(&slug, &vec![vec![]]).unwrap();
    let transport = ScriptedTransport::default();
    let pacer = RecordingPacer::default();
    let app = App::new(
        store,
        test_config(),
        &transport,
        &pacer,
        IdentityPool::fixed(Identity::default()),
    );

    let status = app.status().unwrap();
    assert!(!status.snapshot_present);
    assert_eq!(status.artifacts, 1);
    assert!(!status.aggregate_present);
    assert_eq!(status.proxies, 0);
}
