//! End-to-end crawl scenarios against mock provider and geocoder.

mod harness;

use std::collections::HashSet;
use std::io::ErrorKind;
use std::time::Duration;

use harness::*;
use placescout::crawler::{CrawlOutcome, CrawlPhase, PhaseSelection};
use placescout::store::CsvExport;
use placescout::store::RecordWriter;
use placescout::testing::{area, place, saturated_outcome, FailingWriter, MockGeocoder, MockPlaces};
use placescout::traits::QueryOutcome;
use placescout_common::{CrawlError, Tile};

#[tokio::test]
async fn sparse_area_finishes_after_initial_scan() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestCrawl::new(
        dir.path(),
        MockPlaces::new(|call| QueryOutcome::from_records(vec![place(&point(call.lat, call.lng))], 1)),
    );
    let mut crawler = test.crawler();

    let report = crawler.run(PhaseSelection::All).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Completed);
    assert_eq!(crawler.phase(), CrawlPhase::Done);
    assert_eq!(report.initial_tiles, INITIAL_TILES);
    assert_eq!(report.deep_dives, 0);
    assert_eq!(test.places.call_count(), INITIAL_TILES);
    assert_eq!(test.geocoder.call_count(), 1);
    assert_eq!(test.writer.ids().len(), INITIAL_TILES);

    let store = store(dir.path());
    assert!(!store.path_for("test_town").exists());
    assert!(!store.path_for("test_town_deep_dive").exists());
}

#[tokio::test]
async fn overlapping_tiles_yield_one_flush_of_unique_records() {
    let dir = tempfile::tempdir().unwrap();
    let west = point(10.0, 20.0);
    let test = TestCrawl::new(
        dir.path(),
        MockPlaces::new(move |call| {
            if point(call.lat, call.lng) == west {
                QueryOutcome::from_records(vec![place("a"), place("b")], 1)
            } else {
                QueryOutcome::from_records(vec![place("a"), place("b"), place("c")], 1)
            }
        }),
    )
    .with_geocoder(MockGeocoder::new(area(10.0, 20.0, 10.0, 20.01)));

    let report = test.crawler().run(PhaseSelection::All).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Completed);
    assert_eq!(report.initial_tiles, 2);
    assert_eq!(test.places.call_count(), 2);
    assert_eq!(report.deep_dives, 0);
    assert_eq!(report.remaining_stack, 0);
    assert_eq!(report.unique_records, 3);
    let batch_sizes: Vec<usize> = test.writer.batches().iter().map(Vec::len).collect();
    assert_eq!(batch_sizes, vec![3]);
    assert_eq!(report.flushes, 1);
    let mut ids = test.writer.ids();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn storage_abort_records_the_failing_phase() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestCrawl::new(
        dir.path(),
        MockPlaces::new(|call| QueryOutcome::from_records(vec![place(&point(call.lat, call.lng))], 1)),
    )
    .configure(|c| c.chunk_size = 1);
    let deps = placescout::crawler::CrawlDeps::builder()
        .places(test.places.clone())
        .geocoder(test.geocoder.clone())
        .writer(Box::new(FailingWriter::new(10, ErrorKind::PermissionDenied)))
        .build();
    let mut crawler = placescout::crawler::Crawler::new(test.config.clone(), deps).unwrap();
    assert_eq!(crawler.failed_in(), None);

    let err = crawler.run(PhaseSelection::All).await.unwrap_err();

    assert!(err.is_unrecoverable_storage());
    assert_eq!(crawler.phase(), CrawlPhase::Error);
    assert_eq!(crawler.failed_in(), Some(CrawlPhase::InitialScan));
    assert_eq!(test.places.call_count(), 2);
}

#[tokio::test]
async fn initial_scan_visits_grid_in_row_major_order_with_circumscribing_radius() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestCrawl::new(dir.path(), MockPlaces::empty());
    test.crawler().run(PhaseSelection::All).await.unwrap();

    let grid = initial_grid();
    let calls = test.places.calls();
    assert_eq!(calls.len(), grid.len());
    for (call, tile) in calls.iter().zip(&grid) {
        assert_eq!(point(call.lat, call.lng), point(tile.lat(), tile.lng()));
        assert_eq!(call.radius_m, tile.search_radius_m());
        assert_eq!(call.category, "restaurant");
    }
    // South row first, west to east.
    assert_eq!(test.query_points()[0], point(10.0, 20.0));
    assert_eq!(test.query_points()[1], point(10.0, 20.01));
}

#[tokio::test]
async fn configured_initial_radius_applies_to_initial_scan_only() {
    let dir = tempfile::tempdir().unwrap();
    let hot = point(10.0, 20.0);
    let test = TestCrawl::new(
        dir.path(),
        MockPlaces::new(move |call| {
            if point(call.lat, call.lng) == hot && call.radius_m == 1000.0 {
                saturated_outcome("hot")
            } else {
                QueryOutcome::empty()
            }
        }),
    )
    .configure(|c| c.initial_radius_m = Some(1000.0));

    let report = test.crawler().run(PhaseSelection::All).await.unwrap();

    let calls = test.places.calls();
    assert!(calls[..INITIAL_TILES].iter().all(|c| c.radius_m == 1000.0));
    let parent = Tile::new(10.0, 20.0, 0.01).unwrap();
    assert_eq!(calls[INITIAL_TILES].radius_m, parent.search_radius_m());
    assert_eq!(report.deep_dives, 1);
}

#[tokio::test]
async fn saturated_tile_is_subdivided_depth_first_ne_first() {
    let dir = tempfile::tempdir().unwrap();
    let hot: HashSet<String> = [point(10.0, 20.0), point(10.0025, 20.0025)].into();
    let test = TestCrawl::new(
        dir.path(),
        MockPlaces::new(move |call| {
            let p = point(call.lat, call.lng);
            if hot.contains(&p) {
                saturated_outcome(&p)
            } else {
                QueryOutcome::empty()
            }
        }),
    );

    let report = test.crawler().run(PhaseSelection::All).await.unwrap();

    // Parent, its four children, and the four children of the saturated NE child.
    assert_eq!(report.deep_dives, 9);
    assert_eq!(report.subdivisions, 2);
    let deep = &test.query_points()[INITIAL_TILES..];
    assert_eq!(deep[0], point(10.0, 20.0));
    assert_eq!(deep[1], point(10.0025, 20.0025));
    assert_eq!(deep[2], point(10.00375, 20.00375));
    // Siblings of the NE child come after its whole subtree: NW, SE, SW.
    assert_eq!(deep[6], point(10.0025, 19.9975));
    assert_eq!(deep[7], point(9.9975, 20.0025));
    assert_eq!(deep[8], point(9.9975, 19.9975));

    // The initial query and the first deep dive hit the same point; its 60
    // records are only emitted once.
    assert_eq!(report.unique_records, 120);
    assert_no_duplicates(&test.writer.ids());
}

#[tokio::test]
async fn always_saturated_stops_at_min_step() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestCrawl::new(dir.path(), MockPlaces::always_saturated());

    let report = test.crawler().run(PhaseSelection::All).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Completed);
    let expected = INITIAL_TILES as u64 * DIVES_PER_SATURATED_TILE;
    assert_eq!(report.deep_dives, expected);
    assert_eq!(test.places.call_count(), INITIAL_TILES + expected as usize);
    assert_eq!(report.unique_records, expected as usize * 60);
    assert_eq!(test.writer.ids().len(), report.unique_records);
    assert_no_duplicates(&test.writer.ids());

    let smallest = Tile::new(10.0, 20.0, 0.0025).unwrap().search_radius_m();
    assert!(test
        .places
        .calls()
        .iter()
        .all(|c| c.radius_m >= smallest * 0.999));
}

#[tokio::test]
async fn deep_dive_ceiling_ends_the_crawl() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestCrawl::new(dir.path(), MockPlaces::always_saturated())
        .configure(|c| c.max_deep_dives = 5);

    let report = test.crawler().run(PhaseSelection::All).await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Completed);
    assert_eq!(report.deep_dives, 5);
    assert!(report.remaining_stack > 0);
    assert_eq!(test.places.call_count(), INITIAL_TILES + 5);
    assert!(!store(dir.path()).path_for("test_town_deep_dive").exists());
}

#[tokio::test]
async fn concurrent_workers_match_sequential_results() {
    let seq_dir = tempfile::tempdir().unwrap();
    let sequential = TestCrawl::new(seq_dir.path(), MockPlaces::always_saturated());
    let seq_report = sequential.crawler().run(PhaseSelection::All).await.unwrap();

    let par_dir = tempfile::tempdir().unwrap();
    let parallel = TestCrawl::new(
        par_dir.path(),
        MockPlaces::always_saturated().with_delay(Duration::from_millis(2)),
    )
    .configure(|c| c.max_workers = 4);
    let par_report = parallel.crawler().run(PhaseSelection::All).await.unwrap();

    assert_eq!(par_report.deep_dives, seq_report.deep_dives);
    assert_eq!(par_report.unique_records, seq_report.unique_records);

    let deep: Vec<String> = parallel.query_points()[INITIAL_TILES..].to_vec();
    let distinct: HashSet<&String> = deep.iter().collect();
    assert_eq!(distinct.len(), deep.len(), "a tile was deep-dived twice");

    let mut seq_ids = sequential.writer.ids();
    let mut par_ids = parallel.writer.ids();
    seq_ids.sort();
    par_ids.sort();
    assert_eq!(seq_ids, par_ids);
}

#[tokio::test]
async fn unknown_area_fails_without_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestCrawl::new(dir.path(), MockPlaces::empty())
        .with_geocoder(MockGeocoder::not_found());
    let mut crawler = test.crawler();

    let err = crawler.run(PhaseSelection::All).await.unwrap_err();

    assert!(matches!(err, CrawlError::NotFound(_)));
    assert_eq!(crawler.phase(), CrawlPhase::Error);
    assert_eq!(test.places.call_count(), 0);
    assert!(!store(dir.path()).path_for("test_town").exists());
}

#[tokio::test]
async fn corrupt_checkpoint_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    std::fs::create_dir_all(store.dir()).unwrap();
    let path = store.path_for("test_town_deep_dive");
    std::fs::write(&path, b"{\"format_version\": \"9.9\"}").unwrap();

    let test = TestCrawl::new(dir.path(), MockPlaces::always_saturated());
    let mut crawler = test.crawler();
    let err = crawler.run(PhaseSelection::All).await.unwrap_err();

    assert!(matches!(err, CrawlError::CorruptCheckpoint { .. }));
    assert_eq!(crawler.phase(), CrawlPhase::Error);
    assert_eq!(test.places.call_count(), 0);
    assert_eq!(test.geocoder.call_count(), 0);
    assert_eq!(std::fs::read(&path).unwrap(), b"{\"format_version\": \"9.9\"}");
}

#[tokio::test]
async fn default_writer_exports_csv_under_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestCrawl::new(
        dir.path(),
        MockPlaces::new(|call| {
            let p = point(call.lat, call.lng);
            QueryOutcome::from_records(vec![place(&format!("{p}-a")), place(&format!("{p}-b"))], 1)
        }),
    );
    let deps = placescout::crawler::CrawlDeps::builder()
        .places(test.places.clone())
        .geocoder(test.geocoder.clone())
        .build();
    let mut crawler = placescout::crawler::Crawler::new(test.config.clone(), deps).unwrap();

    let report = crawler.run(PhaseSelection::All).await.unwrap();

    let path = dir.path().join("exports/test_town_restaurant.csv");
    assert_eq!(report.destination, path.display().to_string());
    let ids = CsvExport::new(&path).existing_ids().unwrap();
    assert_eq!(ids.len(), INITIAL_TILES * 2);
    assert!(ids.contains(&format!("{}-a", point(10.0, 20.0))));
}

#[tokio::test]
async fn rerun_of_finished_crawl_appends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let first = TestCrawl::new(dir.path(), MockPlaces::always_saturated());
    first.crawler().run(PhaseSelection::All).await.unwrap();
    let written = first.writer.ids().len();

    let second = TestCrawl::new(dir.path(), MockPlaces::always_saturated())
        .with_writer(first.writer.clone());
    let report = second.crawler().run(PhaseSelection::All).await.unwrap();

    assert_eq!(report.rows_written, 0);
    assert_eq!(first.writer.ids().len(), written);
}
