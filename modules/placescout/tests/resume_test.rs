//! Stop, checkpoint and resume across crawler instances.

mod harness;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harness::*;
use placescout::crawler::{CrawlOutcome, CrawlPhase, PhaseSelection};
use placescout::store::{Checkpoint, FORMAT_VERSION};
use placescout::testing::{saturated_outcome, MockPlaces};
use placescout::traits::QueryOutcome;
use placescout_common::CrawlError;

/// Always-saturated responder that raises `cancel` once `after` queries have
/// been answered.
fn saturated_until(after: usize, cancel: Arc<AtomicBool>) -> MockPlaces {
    let answered = AtomicUsize::new(0);
    MockPlaces::new(move |call| {
        if answered.fetch_add(1, Ordering::SeqCst) + 1 >= after {
            cancel.store(true, Ordering::SeqCst);
        }
        saturated_outcome(&point(call.lat, call.lng))
    })
}

#[tokio::test]
async fn stop_during_initial_scan_resumes_without_geocoding() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = Arc::new(AtomicBool::new(false));

    let first = TestCrawl::new(dir.path(), saturated_until(2, cancel.clone()));
    let mut crawler = {
        let deps = placescout::crawler::CrawlDeps::builder()
            .places(first.places.clone())
            .geocoder(first.geocoder.clone())
            .writer(Box::new(first.writer.clone()))
            .cancel(cancel.clone())
            .build();
        placescout::crawler::Crawler::new(first.config.clone(), deps).unwrap()
    };
    let report = crawler.run(PhaseSelection::All).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Interrupted);
    assert_eq!(crawler.phase(), CrawlPhase::Interrupted);
    assert_eq!(first.places.call_count(), 2);
    let saved = store(dir.path()).load("test_town").await.unwrap().unwrap();
    assert_eq!(saved.initial_cursor, 2);
    assert_eq!(saved.high_density_stack.len(), 2);
    assert_eq!(saved.record_ids.len(), 120);
    // Flushed before the checkpoint was written.
    assert_eq!(first.writer.ids().len(), 120);

    let second = TestCrawl::new(dir.path(), MockPlaces::always_saturated())
        .with_writer(first.writer.clone());
    let report = second.crawler().run(PhaseSelection::All).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Completed);
    assert_eq!(second.geocoder.call_count(), 0);
    assert_eq!(report.initial_scanned, INITIAL_TILES - 2);
    let expected_dives = INITIAL_TILES as u64 * DIVES_PER_SATURATED_TILE;
    assert_eq!(report.deep_dives, expected_dives);
    assert_eq!(
        first.places.call_count() + second.places.call_count(),
        INITIAL_TILES + expected_dives as usize
    );

    let ids = first.writer.ids();
    assert_no_duplicates(&ids);
    assert_eq!(ids.len(), expected_dives as usize * 60);
}

#[tokio::test]
async fn stop_during_concurrent_deep_dive_loses_and_repeats_nothing() {
    let reference_dir = tempfile::tempdir().unwrap();
    let reference = TestCrawl::new(reference_dir.path(), MockPlaces::always_saturated());
    reference.crawler().run(PhaseSelection::All).await.unwrap();
    let mut expected: Vec<String> = reference.writer.ids();
    expected.sort();

    let dir = tempfile::tempdir().unwrap();
    let cancel = Arc::new(AtomicBool::new(false));
    let places = saturated_until(INITIAL_TILES + 30, cancel.clone())
        .with_delay(Duration::from_millis(1));
    let first = TestCrawl::new(dir.path(), places).configure(|c| c.max_workers = 3);
    let mut crawler = {
        let deps = placescout::crawler::CrawlDeps::builder()
            .places(first.places.clone())
            .geocoder(first.geocoder.clone())
            .writer(Box::new(first.writer.clone()))
            .cancel(cancel.clone())
            .build();
        placescout::crawler::Crawler::new(first.config.clone(), deps).unwrap()
    };
    let report = crawler.run(PhaseSelection::All).await.unwrap();
    assert_eq!(report.outcome, CrawlOutcome::Interrupted);

    let saved = store(dir.path())
        .load("test_town_deep_dive")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.deep_count as usize, first.places.call_count() - INITIAL_TILES);
    assert_eq!(saved.processed.len() as u64, saved.deep_count);

    let second = TestCrawl::new(dir.path(), MockPlaces::always_saturated())
        .with_writer(first.writer.clone())
        .configure(|c| c.max_workers = 3);
    let report = second.crawler().run(PhaseSelection::All).await.unwrap();
    assert_eq!(report.outcome, CrawlOutcome::Completed);

    let first_points: HashSet<String> = first.query_points()[INITIAL_TILES..].iter().cloned().collect();
    let second_points: HashSet<String> = second.query_points().into_iter().collect();
    assert!(first_points.is_disjoint(&second_points), "a deep-dived tile was queried again");

    let mut ids = first.writer.ids();
    assert_no_duplicates(&ids);
    ids.sort();
    assert_eq!(ids, expected);
    assert!(!store(dir.path()).path_for("test_town").exists());
}

#[tokio::test]
async fn initial_phase_then_deep_phase() {
    let dir = tempfile::tempdir().unwrap();
    let hot = point(10.0, 20.0);
    let responder = move |call: &placescout::testing::QueryCall| {
        if point(call.lat, call.lng) == hot {
            saturated_outcome("hot")
        } else {
            QueryOutcome::empty()
        }
    };

    let initial = TestCrawl::new(dir.path(), MockPlaces::new(responder.clone()));
    let report = initial.crawler().run(PhaseSelection::Initial).await.unwrap();
    assert_eq!(report.outcome, CrawlOutcome::InitialScanComplete);
    assert_eq!(initial.places.call_count(), INITIAL_TILES);
    let saved = store(dir.path()).load("test_town").await.unwrap().unwrap();
    assert!(saved.initial_complete());
    assert_eq!(saved.high_density_stack.len(), 1);

    // Re-running the initial phase does no work.
    let again = TestCrawl::new(dir.path(), MockPlaces::new(responder.clone()))
        .with_writer(initial.writer.clone());
    let report = again.crawler().run(PhaseSelection::Initial).await.unwrap();
    assert_eq!(report.outcome, CrawlOutcome::InitialScanComplete);
    assert_eq!(again.places.call_count(), 0);

    let deep = TestCrawl::new(dir.path(), MockPlaces::new(responder))
        .with_writer(initial.writer.clone());
    let report = deep.crawler().run(PhaseSelection::Deep).await.unwrap();
    assert_eq!(report.outcome, CrawlOutcome::Completed);
    assert_eq!(deep.geocoder.call_count(), 0);
    assert_eq!(deep.places.call_count(), 5);
    assert_eq!(report.deep_dives, 5);
    assert!(!store(dir.path()).path_for("test_town").exists());
}

#[tokio::test]
async fn finished_initial_scan_with_empty_stack_needs_no_queries() {
    let dir = tempfile::tempdir().unwrap();
    let first = TestCrawl::new(dir.path(), MockPlaces::empty());
    first.crawler().run(PhaseSelection::Initial).await.unwrap();

    let second = TestCrawl::new(dir.path(), MockPlaces::empty());
    let report = second.crawler().run(PhaseSelection::All).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Completed);
    assert_eq!(second.places.call_count(), 0);
    assert_eq!(second.geocoder.call_count(), 0);
}

#[tokio::test]
async fn deep_phase_without_checkpoint_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestCrawl::new(dir.path(), MockPlaces::always_saturated());
    let mut crawler = test.crawler();

    let err = crawler.run(PhaseSelection::Deep).await.unwrap_err();

    assert!(matches!(err, CrawlError::Config(_)));
    assert_eq!(test.places.call_count(), 0);
    assert_eq!(test.geocoder.call_count(), 0);
}

#[tokio::test]
async fn checkpoint_of_another_place_type_is_refused_and_kept() {
    let dir = tempfile::tempdir().unwrap();
    let hot = point(10.0, 20.0);
    let restaurants = TestCrawl::new(
        dir.path(),
        MockPlaces::new(move |call| {
            if point(call.lat, call.lng) == hot {
                saturated_outcome("hot")
            } else {
                QueryOutcome::empty()
            }
        }),
    );
    restaurants.crawler().run(PhaseSelection::Initial).await.unwrap();
    let saved = store(dir.path()).load("test_town").await.unwrap().unwrap();
    assert_eq!(saved.place_type, "restaurant");

    let cafes = TestCrawl::new(dir.path(), MockPlaces::always_saturated())
        .configure(|c| c.place_type = "cafe".into());
    let mut crawler = cafes.crawler();
    let err = crawler.run(PhaseSelection::All).await.unwrap_err();

    assert!(matches!(err, CrawlError::Config(ref msg) if msg.contains("restaurant")));
    assert_eq!(crawler.phase(), CrawlPhase::Error);
    assert_eq!(cafes.places.call_count(), 0);
    assert_eq!(cafes.geocoder.call_count(), 0);
    assert!(cafes.writer.ids().is_empty());
    let untouched = store(dir.path()).load("test_town").await.unwrap().unwrap();
    assert_eq!(untouched, saved);

    // The restaurant crawl still resumes where it stopped.
    let resumed = TestCrawl::new(dir.path(), MockPlaces::empty())
        .with_writer(restaurants.writer.clone());
    let report = resumed.crawler().run(PhaseSelection::All).await.unwrap();
    assert_eq!(report.outcome, CrawlOutcome::Completed);
    assert_eq!(resumed.geocoder.call_count(), 0);
    assert_eq!(report.deep_dives, 1);
    assert!(resumed.places.calls().iter().all(|c| c.category == "restaurant"));
}

#[tokio::test]
async fn resume_never_requeries_processed_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let grid = initial_grid();
    let done = grid[0];
    let checkpoint = Checkpoint {
        format_version: FORMAT_VERSION.to_string(),
        timestamp: chrono::Utc::now(),
        identity: "test_town_deep_dive".into(),
        place_type: "restaurant".into(),
        initial_tiles: grid.clone(),
        initial_cursor: grid.len(),
        high_density_stack: vec![done, done],
        processed: [done.key()].into_iter().collect(),
        record_ids: vec!["hot-0".into()],
        deep_count: 1,
    };
    store(dir.path()).save(&checkpoint).await.unwrap();

    let test = TestCrawl::new(dir.path(), MockPlaces::always_saturated());
    let report = test.crawler().run(PhaseSelection::All).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Completed);
    assert_eq!(test.places.call_count(), 0);
    assert_eq!(test.geocoder.call_count(), 0);
    assert_eq!(report.skipped_tiles, 2);
    assert_eq!(report.deep_dives, 1);
    assert_eq!(report.unique_records, 1);
    assert!(!store(dir.path()).path_for("test_town_deep_dive").exists());
}
