use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use crate::api::{Fetcher, ListingEntry, ListingPage, PageQuery};
use crate::classify::classify;
use crate::db::{HistoryNote, SqliteStore, Storage};
use crate::error::{ItemError, StorageError};
use crate::record::{merge, CandidateRecord};
use crate::schedule::{WipeEvent, WipeScheduleAnalyzer};
use crate::stats::{Reporter, RunStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationMode {
    /// Fetch one page per invocation; meant to be called repeatedly.
    SinglePage,
    /// Follow the continuation cursor until the listing runs out.
    All,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub country: String,
    pub distance: u32,
    pub min_players: u32,
    pub page_size: u32,
    /// Servers ranked worse (numerically higher) than this are skipped.
    pub min_rank: i64,
    /// Skip servers whose last wipe is older than this many days.
    pub max_days_old: Option<i64>,
    pub page_delay: Duration,
}

impl PipelineConfig {
    pub fn first_page(&self) -> PageQuery {
        PageQuery {
            country: self.country.clone(),
            distance: self.distance,
            min_players: self.min_players,
            page_size: self.page_size,
            cursor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RankAboveLimit,
    NoWipeTime,
    StaleWipe,
    UnchangedWipe,
    NoHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Posted,
    Skipped(SkipReason),
}

enum RunState {
    Idle,
    FetchingPage(PageQuery),
    ProcessingItems(PageQuery, ListingPage),
    Done,
}

pub struct Pipeline<F, S, R> {
    config: PipelineConfig,
    fetcher: F,
    storage: S,
    reporter: R,
    analyzer: WipeScheduleAnalyzer,
    stop: Arc<AtomicBool>,
    fixed_now: Option<DateTime<Utc>>,
}

impl<F: Fetcher, S: Storage, R: Reporter> Pipeline<F, S, R> {
    pub fn new(config: PipelineConfig, fetcher: F, storage: S, reporter: R) -> Self {
        Self {
            config,
            fetcher,
            storage,
            reporter,
            analyzer: WipeScheduleAnalyzer::default(),
            stop: Arc::new(AtomicBool::new(false)),
            fixed_now: None,
        }
    }

    /// Setting the returned flag stops the run before the next item.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    #[cfg(test)]
    fn at(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Run one ingestion pass and hand the final stats to the reporter.
    pub async fn run(&self, mode: PaginationMode) -> RunStats {
        let mut stats = RunStats::start();
        let progress = match mode {
            PaginationMode::All => spinner(),
            PaginationMode::SinglePage => ProgressBar::hidden(),
        };
        let mut pages = 0usize;
        let mut state = RunState::Idle;

        loop {
            state = match state {
                RunState::Idle => RunState::FetchingPage(self.config.first_page()),
                RunState::FetchingPage(_) if self.stopped() => RunState::Done,
                RunState::FetchingPage(query) => match self.fetcher.fetch_page(&query).await {
                    Ok(page) => {
                        pages += 1;
                        info!(page = pages, servers = page.items.len(), "Fetched server list page");
                        RunState::ProcessingItems(query, page)
                    }
                    Err(e) => {
                        warn!("Server list fetch failed, ending run: {}", e);
                        stats.record_error(format!("fetch failed: {}", e));
                        RunState::Done
                    }
                },
                RunState::ProcessingItems(query, page) => {
                    for entry in &page.items {
                        if self.stopped() {
                            info!("Stop requested, ending run");
                            break;
                        }
                        self.process_entry(entry, &mut stats);
                    }
                    progress.set_message(format!(
                        "page {} | posted {} | skipped {}",
                        pages, stats.posted, stats.skipped
                    ));
                    progress.tick();

                    match (mode, page.next_cursor) {
                        (PaginationMode::All, Some(cursor)) if !self.stopped() => {
                            if !self.config.page_delay.is_zero() {
                                debug!("Pausing {:?} before next page", self.config.page_delay);
                                tokio::time::sleep(self.config.page_delay).await;
                            }
                            RunState::FetchingPage(query.with_cursor(Some(cursor)))
                        }
                        _ => RunState::Done,
                    }
                }
                RunState::Done => break,
            };
        }

        progress.finish_and_clear();
        stats.finish();
        self.reporter.report(&stats);
        stats
    }

    fn process_entry(&self, entry: &ListingEntry, stats: &mut RunStats) {
        match self.process_item(entry, stats) {
            Ok(ItemOutcome::Posted) => stats.posted += 1,
            Ok(ItemOutcome::Skipped(reason)) => {
                debug!(id = ?entry.id, ?reason, "Skipped server");
                stats.skipped += 1;
            }
            Err(ItemError::Malformed(why)) => {
                warn!(id = ?entry.id, "Skipping malformed listing item: {}", why);
                stats.skipped += 1;
            }
            Err(ItemError::Storage(e)) => {
                error!(id = ?entry.id, "Storage failure, skipping server: {}", e);
                stats.record_error(format!("server {:?}: {}", entry.id, e));
                stats.skipped += 1;
            }
        }
    }

    /// Classify, infer, merge and persist one listing item.
    pub fn process_item(
        &self,
        entry: &ListingEntry,
        stats: &mut RunStats,
    ) -> Result<ItemOutcome, ItemError> {
        let item = entry
            .attributes
            .as_ref()
            .ok_or(ItemError::Malformed("missing attributes"))?;
        let bm_id = item
            .bm_id()
            .ok_or(ItemError::Malformed("non-numeric server id"))?;

        if item.rank.is_some_and(|rank| rank > self.config.min_rank) {
            return Ok(ItemOutcome::Skipped(SkipReason::RankAboveLimit));
        }
        let Some(last_wipe) = item.last_wipe() else {
            return Ok(ItemOutcome::Skipped(SkipReason::NoWipeTime));
        };
        let now = self.now();
        if let Some(max_days) = self.config.max_days_old {
            if (now - last_wipe).num_days() > max_days {
                return Ok(ItemOutcome::Skipped(SkipReason::StaleWipe));
            }
        }

        let existing = self.storage.get_existing(bm_id)?;
        if existing.as_ref().and_then(|r| r.last_wipe) == Some(last_wipe) {
            return Ok(ItemOutcome::Skipped(SkipReason::UnchangedWipe));
        }

        let attributes = classify(item.title(), item.description());
        stats.record_attributes(&attributes);

        let event = WipeEvent {
            bm_id,
            timestamp: last_wipe,
        };
        let mut history = self.storage.get_history(bm_id)?;
        if !history.contains(&event) {
            history.push(event);
        }
        let schedule = self.analyzer.infer(&history);
        if schedule.is_empty() {
            return Ok(ItemOutcome::Skipped(SkipReason::NoHistory));
        }

        self.storage.append_history(
            &event,
            &HistoryNote {
                is_bp: self.analyzer.is_blueprint(last_wipe),
                title: item.title(),
                description: item.description(),
                attributes: &attributes,
            },
        )?;

        let next = self
            .analyzer
            .next_wipe(item.next_wipe(), item.next_wipe_full(), now);
        let candidate = CandidateRecord {
            bm_id,
            rank: item.rank,
            ip: item.address(),
            title: item.name.clone(),
            region: item
                .country
                .clone()
                .filter(|c| !c.trim().is_empty())
                .or_else(|| Some(self.config.country.clone())),
            players: item.players,
            max_players: item.max_players,
            attributes: Some(attributes),
            schedule: Some(schedule),
            last_wipe: Some(last_wipe),
            next_wipe: next.next_wipe,
            next_wipe_full: next.next_wipe_full,
            next_wipe_is_bp: Some(next.is_bp),
            next_wipe_hour: next.hour,
            next_wipe_dow: next.dow,
            next_wipe_week: next.week,
        };
        let record = merge(existing, candidate);
        stats.parsed += 1;

        self.storage.upsert(&record)?;
        debug!(
            bm_id,
            main_hour = ?record.schedule.as_ref().and_then(|s| s.main_hour),
            bp_hour = ?record.schedule.as_ref().and_then(|s| s.blueprint_hour),
            "Posted server"
        );
        Ok(ItemOutcome::Posted)
    }
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

/// Outcome of a whole-database schedule rebuild.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecomputeStats {
    pub servers: usize,
    pub updated: usize,
    pub without_history: usize,
}

/// Re-derive every stored server's schedule from its wipe history alone.
pub fn recompute_schedules(
    store: &SqliteStore,
    analyzer: &WipeScheduleAnalyzer,
) -> Result<RecomputeStats, StorageError> {
    let mut out = RecomputeStats::default();
    for bm_id in store.server_ids()? {
        out.servers += 1;
        let history = store.get_history(bm_id)?;
        let schedule = analyzer.infer(&history);
        if schedule.is_empty() {
            out.without_history += 1;
            continue;
        }
        out.updated += store.update_schedule(bm_id, &schedule)?;
    }
    info!(
        servers = out.servers,
        updated = out.updated,
        without_history = out.without_history,
        "Recomputed wipe schedules"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::api::{parse_listing, RawListingItem, ServerDetails};
    use crate::error::TransportError;
    use crate::record::ServerRecord;
    use crate::schedule::parse_timestamp;

    struct ScriptedFetcher {
        pages: Mutex<VecDeque<Result<ListingPage, TransportError>>>,
        seen: Mutex<Vec<PageQuery>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<Result<ListingPage, TransportError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn cursors(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().iter().map(|q| q.cursor.clone()).collect()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch_page(&self, query: &PageQuery) -> Result<ListingPage, TransportError> {
            self.seen.lock().unwrap().push(query.clone());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::NoData))
        }
    }

    /// Counts calls and can fail lookups for chosen servers.
    struct ProbeStorage {
        inner: SqliteStore,
        calls: Cell<usize>,
        fail_for: Option<i64>,
    }

    impl ProbeStorage {
        fn new() -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                calls: Cell::new(0),
                fail_for: None,
            }
        }

        fn tick(&self) {
            self.calls.set(self.calls.get() + 1);
        }
    }

    impl Storage for ProbeStorage {
        fn get_existing(&self, bm_id: i64) -> Result<Option<ServerRecord>, StorageError> {
            self.tick();
            if self.fail_for == Some(bm_id) {
                return Err(StorageError::Corrupt {
                    bm_id,
                    reason: "disk on fire".into(),
                });
            }
            self.inner.get_existing(bm_id)
        }

        fn get_history(&self, bm_id: i64) -> Result<Vec<WipeEvent>, StorageError> {
            self.tick();
            self.inner.get_history(bm_id)
        }

        fn append_history(
            &self,
            event: &WipeEvent,
            note: &HistoryNote<'_>,
        ) -> Result<bool, StorageError> {
            self.tick();
            self.inner.append_history(event, note)
        }

        fn upsert(&self, record: &ServerRecord) -> Result<(), StorageError> {
            self.tick();
            self.inner.upsert(record)
        }
    }

    #[derive(Default)]
    struct Collect(RefCell<Vec<RunStats>>);

    impl Reporter for Collect {
        fn report(&self, stats: &RunStats) {
            self.0.borrow_mut().push(stats.clone());
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            country: "US".into(),
            distance: 5000,
            min_players: 0,
            page_size: 25,
            min_rank: 5000,
            max_days_old: Some(150),
            page_delay: Duration::ZERO,
        }
    }

    fn now() -> DateTime<Utc> {
        parse_timestamp("2024-01-05T00:00:00.000Z").unwrap()
    }

    fn fixture_page() -> ListingPage {
        let body = std::fs::read_to_string("tests/fixtures/servers_page.json").unwrap();
        parse_listing(&body).unwrap()
    }

    fn server(id: i64, name: &str, rank: i64, last_wipe: &str) -> ListingEntry {
        ListingEntry {
            id: Some(id.to_string()),
            attributes: Some(RawListingItem {
                id: id.to_string(),
                name: Some(name.into()),
                rank: Some(rank),
                players: Some(10),
                details: Some(ServerDetails {
                    rust_last_wipe: Some(last_wipe.into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    fn page(items: Vec<ListingEntry>, next: Option<&str>) -> ListingPage {
        ListingPage {
            items,
            next_cursor: next.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn single_page_processes_fixture() {
        let fetcher = ScriptedFetcher::new(vec![Ok(fixture_page())]);
        let storage = ProbeStorage::new();
        let reporter = Collect::default();
        let pipeline = Pipeline::new(config(), &fetcher, &storage, &reporter).at(now());

        let stats = pipeline.run(PaginationMode::SinglePage).await;

        // cursor present but single-page mode stops after one fetch
        assert_eq!(fetcher.cursors(), vec![None]);
        assert_eq!((stats.parsed, stats.skipped, stats.posted), (1, 2, 1));
        assert!(stats.errors.is_empty());

        let labels: Vec<&str> = stats.attribute_counts.keys().map(String::as_str).collect();
        assert_eq!(labels, vec!["2x", "monthly", "pvp", "trio"]);

        let record = storage.inner.get_existing(12345).unwrap().unwrap();
        assert_eq!(record.ip.as_deref(), Some("192.0.2.10:28015"));
        assert_eq!(record.region.as_deref(), Some("US"));
        assert_eq!(record.next_wipe_is_bp, Some(false));
        assert_eq!(record.next_wipe, parse_timestamp("2024-01-11T19:00:00.000Z"));
        assert_eq!(record.next_wipe_hour, Some(11));
        assert_eq!(record.next_wipe_dow, Some(4));
        let schedule = record.schedule.unwrap();
        assert_eq!(schedule.blueprint_hour, Some(12));
        assert_eq!(schedule.main_hour, None);

        assert!(storage.inner.get_existing(67890).unwrap().is_none());
        assert_eq!(reporter.0.borrow().len(), 1);
    }

    #[tokio::test]
    async fn partial_entry_is_skipped_not_fatal() {
        let body = r#"{"data":[
            {"id":"1","attributes":{"id":"1","name":"monthly","rank":10,"country":"DE",
             "details":{"rust_last_wipe":"2024-01-03T18:00:00.000Z"}}},
            {"id":"2","attributes":{"name":"no id field"}}
        ]}"#;
        let fetcher = ScriptedFetcher::new(vec![Ok(parse_listing(body).unwrap())]);
        let storage = ProbeStorage::new();
        let pipeline = Pipeline::new(config(), &fetcher, &storage, Collect::default()).at(now());

        let stats = pipeline.run(PaginationMode::SinglePage).await;
        assert_eq!((stats.posted, stats.skipped), (1, 1));
        assert!(stats.errors.is_empty());

        // listing country wins over the configured filter
        let record = storage.inner.get_existing(1).unwrap().unwrap();
        assert_eq!(record.region.as_deref(), Some("DE"));
    }

    #[tokio::test]
    async fn rank_skip_touches_nothing() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(
            vec![server(1, "10x pve build", 9000, "2024-01-03T18:00:00.000Z")],
            None,
        ))]);
        let storage = ProbeStorage::new();
        let pipeline = Pipeline::new(config(), &fetcher, &storage, Collect::default()).at(now());

        let stats = pipeline.run(PaginationMode::SinglePage).await;
        assert_eq!((stats.parsed, stats.skipped, stats.posted), (0, 1, 0));
        assert_eq!(storage.calls.get(), 0);
        assert!(stats.attribute_counts.is_empty());
    }

    #[tokio::test]
    async fn run_all_follows_cursor() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page(vec![server(1, "monthly", 10, "2024-01-03T18:00:00.000Z")], Some("k2"))),
            Ok(page(vec![server(2, "weekly", 20, "2024-01-02T18:00:00.000Z")], None)),
        ]);
        let storage = ProbeStorage::new();
        let pipeline = Pipeline::new(config(), &fetcher, &storage, Collect::default()).at(now());

        let stats = pipeline.run(PaginationMode::All).await;
        assert_eq!(fetcher.cursors(), vec![None, Some("k2".to_string())]);
        assert_eq!(stats.posted, 2);
        assert_eq!(storage.inner.server_ids().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn transport_failure_ends_run_gracefully() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page(vec![server(1, "monthly", 10, "2024-01-03T18:00:00.000Z")], Some("k2"))),
            Err(TransportError::Status {
                status: 503,
                url: "https://example.invalid".into(),
            }),
        ]);
        let storage = ProbeStorage::new();
        let reporter = Collect::default();
        let pipeline = Pipeline::new(config(), &fetcher, &storage, &reporter).at(now());

        let stats = pipeline.run(PaginationMode::All).await;
        assert_eq!(stats.posted, 1);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.errors[0].contains("503"));
        assert_eq!(reporter.0.borrow().len(), 1);
    }

    #[tokio::test]
    async fn unchanged_wipe_is_skipped() {
        let item = || server(1, "monthly", 10, "2024-01-03T18:00:00.000Z");
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page(vec![item()], None)),
            Ok(page(vec![item()], None)),
        ]);
        let storage = ProbeStorage::new();
        let pipeline = Pipeline::new(config(), &fetcher, &storage, Collect::default()).at(now());

        let first = pipeline.run(PaginationMode::SinglePage).await;
        assert_eq!(first.posted, 1);
        let second = pipeline.run(PaginationMode::SinglePage).await;
        assert_eq!((second.parsed, second.skipped, second.posted), (0, 1, 0));
        assert!(second.attribute_counts.is_empty());
    }

    #[tokio::test]
    async fn history_accumulates_across_runs() {
        // Tuesday 10:00 PST twice, then a Friday
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page(vec![server(1, "biweekly", 10, "2023-12-19T18:00:00.000Z")], None)),
            Ok(page(vec![server(1, "biweekly", 10, "2023-12-26T18:00:00.000Z")], None)),
            Ok(page(vec![server(1, "", 10, "2023-12-29T22:00:00.000Z")], None)),
        ]);
        let storage = ProbeStorage::new();
        let pipeline = Pipeline::new(config(), &fetcher, &storage, Collect::default()).at(now());
        for _ in 0..3 {
            assert_eq!(pipeline.run(PaginationMode::SinglePage).await.posted, 1);
        }

        assert_eq!(storage.inner.get_history(1).unwrap().len(), 3);
        let record = storage.inner.get_existing(1).unwrap().unwrap();
        let schedule = record.schedule.unwrap();
        assert_eq!((schedule.main_dow, schedule.main_hour), (Some(2), Some(10)));
        assert_eq!((schedule.secondary_dow, schedule.secondary_hour), (Some(5), Some(14)));
        // empty title in the last run does not erase the stored one
        assert_eq!(record.title.as_deref(), Some("biweekly"));
        assert_eq!(record.last_wipe, parse_timestamp("2023-12-29T22:00:00.000Z"));
    }

    #[tokio::test]
    async fn storage_error_skips_item_only() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(
            vec![
                server(1, "monthly", 10, "2024-01-03T18:00:00.000Z"),
                server(2, "weekly", 10, "2024-01-03T18:00:00.000Z"),
            ],
            None,
        ))]);
        let storage = ProbeStorage {
            fail_for: Some(1),
            ..ProbeStorage::new()
        };
        let pipeline = Pipeline::new(config(), &fetcher, &storage, Collect::default()).at(now());

        let stats = pipeline.run(PaginationMode::SinglePage).await;
        assert_eq!((stats.skipped, stats.posted), (1, 1));
        assert_eq!(stats.errors.len(), 1);
        assert!(storage.inner.get_existing(2).unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_and_missing_wipes_skipped() {
        let mut no_wipe = server(2, "monthly", 10, "");
        if let Some(attrs) = no_wipe.attributes.as_mut() {
            attrs.details = None;
        }
        let fetcher = ScriptedFetcher::new(vec![Ok(page(
            vec![server(1, "monthly", 10, "2023-01-05T18:00:00.000Z"), no_wipe],
            None,
        ))]);
        let storage = ProbeStorage::new();
        let pipeline = Pipeline::new(config(), &fetcher, &storage, Collect::default()).at(now());

        let stats = pipeline.run(PaginationMode::SinglePage).await;
        assert_eq!((stats.skipped, stats.posted), (2, 0));
        assert_eq!(storage.calls.get(), 0);
    }

    #[tokio::test]
    async fn stop_before_run_fetches_nothing() {
        let fetcher = ScriptedFetcher::new(vec![Ok(fixture_page())]);
        let storage = ProbeStorage::new();
        let pipeline = Pipeline::new(config(), &fetcher, &storage, Collect::default()).at(now());
        pipeline.stop_handle().store(true, Ordering::Relaxed);

        let stats = pipeline.run(PaginationMode::All).await;
        assert!(fetcher.cursors().is_empty());
        assert_eq!((stats.parsed, stats.skipped, stats.posted), (0, 0, 0));
    }

    #[test]
    fn recompute_rebuilds_from_history() {
        let store = SqliteStore::open_in_memory().unwrap();
        let attrs = classify("", "");
        let note = HistoryNote {
            is_bp: false,
            title: "",
            description: "",
            attributes: &attrs,
        };
        for raw in ["2024-01-04T20:00:00.000Z", "2024-01-11T18:00:00.000Z"] {
            let event = WipeEvent {
                bm_id: 5,
                timestamp: parse_timestamp(raw).unwrap(),
            };
            store.append_history(&event, &note).unwrap();
        }
        for bm_id in [5, 6] {
            store
                .upsert(&ServerRecord {
                    bm_id,
                    ..Default::default()
                })
                .unwrap();
        }

        let out = recompute_schedules(&store, &WipeScheduleAnalyzer::default()).unwrap();
        assert_eq!(
            out,
            RecomputeStats {
                servers: 2,
                updated: 1,
                without_history: 1,
            }
        );
        let schedule = store.get_existing(5).unwrap().unwrap().schedule.unwrap();
        assert_eq!(schedule.main_hour, Some(10));
        assert_eq!(schedule.blueprint_hour, Some(12));
    }
}
