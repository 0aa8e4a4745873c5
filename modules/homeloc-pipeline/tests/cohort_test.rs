//! End-to-end cohort runs against scripted graph and geocoder mocks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use homeloc_common::{
    AnalysisCategory, Confidence, FinalRecord, PipelineConfig, PostSignal, RecordSource,
};
use homeloc_pipeline::paths::CohortPaths;
use homeloc_pipeline::store::{read_json, write_json_atomic};
use homeloc_pipeline::testing::{located_page, MockGeocoder, MockGraph};
use homeloc_pipeline::{CohortRunner, PipelineDeps, RunOptions, Stage, Tier};
use serde_json::json;
use twitterapi_client::ListKind;

const COHORT: &str = "erie";

fn config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        raw_data_dir: dir.join("raw"),
        state_dir: dir.join("state"),
        final_dir: dir.join("final"),
        cohorts: vec![COHORT.to_string()],
        min_request_interval_ms: 0,
        ..Default::default()
    }
}

fn write_posts(paths: &CohortPaths) {
    let posts = json!([
        {"author": {"id": "1", "username": "selfie", "location": "Erie",
                    "public_metrics": {"followers_count": 40, "following_count": 40}}},
        {"author": {"id": "2", "username": "tagger",
                    "public_metrics": {"followers_count": 12, "following_count": 7}},
         "place": {"full_name": "Buffalo, NY"}},
        {"author": {"id": "3", "username": "starry",
                    "public_metrics": {"followers_count": 2000, "following_count": 1500}}},
        {"author": {"id": "4", "username": "rockford_fan",
                    "public_metrics": {"followers_count": 10, "following_count": 10}}},
        {"author": {"id": "5", "username": "quiet",
                    "public_metrics": {"followers_count": 5, "following_count": 5}}},
        {"author": {"id": "1", "username": "selfie", "location": "Somewhere else",
                    "public_metrics": {"followers_count": 99999, "following_count": 1}}},
    ]);
    write_json_atomic(&paths.posts(), &posts).unwrap();
}

fn graph() -> MockGraph {
    let austin = located_page(&[("f1", "Austin"), ("f2", "Austin "), ("f9", "Austin")]);
    MockGraph::new()
        .followers("starry", vec![austin])
        .followings("starry", vec![located_page(&[("f1", "Austin"), ("f2", "Austin ")])])
        .followers("rockford_fan", vec![located_page(&[("a", "nowhere")])])
        .followings("rockford_fan", vec![located_page(&[("a", "nowhere")])])
        .followers("quiet", vec![vec![]])
        .followings("quiet", vec![vec![]])
}

fn geocoder() -> MockGeocoder {
    MockGeocoder::new()
        .on("Erie", "Erie, PA")
        .on("Austin", "Austin, TX")
}

fn deps(dir: &Path, graph: Arc<MockGraph>, geocoder: Arc<MockGeocoder>) -> PipelineDeps {
    PipelineDeps::builder()
        .config(config(dir))
        .graph(graph)
        .geocoder(geocoder)
        .build()
}

fn final_records(paths: &CohortPaths) -> BTreeMap<String, FinalRecord> {
    read_json(&paths.final_records()).unwrap().unwrap()
}

#[tokio::test]
async fn full_run_places_every_user_by_priority() {
    let dir = tempfile::tempdir().unwrap();
    let graph = Arc::new(graph());
    let geocoder = Arc::new(geocoder());
    let deps = deps(dir.path(), graph.clone(), geocoder.clone());
    let runner = CohortRunner::new(COHORT, &deps);
    write_posts(runner.paths());

    runner.run(RunOptions::default()).await.unwrap();

    let records = final_records(runner.paths());
    assert_eq!(records.len(), 5);

    let selfie = &records["1"];
    assert_eq!(selfie.source, RecordSource::SelfReported);
    assert_eq!(selfie.location.as_deref(), Some("Erie, PA"));
    assert_eq!(selfie.confidence, Confidence::High);
    assert_eq!(selfie.raw_location.as_deref(), Some("Erie"));
    assert_eq!(selfie.followers_count, 40);

    let tagger = &records["2"];
    assert_eq!(tagger.source, RecordSource::Posts(PostSignal::GeoTagged));
    assert_eq!(tagger.location.as_deref(), Some("Buffalo, NY"));

    let starry = &records["3"];
    assert_eq!(starry.source, RecordSource::StarFriendAnalysis);
    assert_eq!(starry.location.as_deref(), Some("Austin, TX"));
    assert_eq!(starry.category, Some(AnalysisCategory::CityLevel));
    assert_eq!(starry.confidence, Confidence::Medium);

    let fan = &records["4"];
    assert_eq!(fan.source, RecordSource::FriendAnalysis);
    assert_eq!(fan.location.as_deref(), Some("Rockford, IL"));
    assert_eq!(fan.category, Some(AnalysisCategory::InferredFromUsername));

    let quiet = &records["5"];
    assert_eq!(quiet.source, RecordSource::FriendAnalysis);
    assert_eq!(quiet.location, None);
    assert_eq!(quiet.category, Some(AnalysisCategory::Bot));
    assert_eq!(quiet.confidence, Confidence::None);

    // "Austin" and "Austin " share one cache key.
    assert_eq!(geocoder.calls_for("Erie"), 1);
    assert_eq!(geocoder.calls_for("Austin"), 1);
    assert_eq!(geocoder.calls_for("Austin "), 0);

    // Only users routed to a tier touch the graph.
    assert_eq!(graph.list_calls("selfie", ListKind::Followers), 0);
    assert_eq!(graph.list_calls("tagger", ListKind::Followers), 0);
    assert_eq!(graph.list_calls("starry", ListKind::Followings), 1);
}

#[tokio::test]
async fn rerun_resumes_without_new_requests() {
    let dir = tempfile::tempdir().unwrap();
    let graph = Arc::new(graph());
    let geocoder = Arc::new(geocoder());
    let deps = deps(dir.path(), graph.clone(), geocoder.clone());
    let runner = CohortRunner::new(COHORT, &deps);
    write_posts(runner.paths());

    runner.run(RunOptions::default()).await.unwrap();
    let first = final_records(runner.paths());
    let graph_calls = graph.total_calls();
    let geocoder_calls = geocoder.call_count();

    runner.run(RunOptions::default()).await.unwrap();

    assert_eq!(graph.total_calls(), graph_calls);
    assert_eq!(geocoder.call_count(), geocoder_calls);
    assert_eq!(final_records(runner.paths()), first);
}

#[tokio::test]
async fn single_stages_run_in_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let graph = Arc::new(graph());
    let geocoder = Arc::new(geocoder());
    let deps = deps(dir.path(), graph.clone(), geocoder.clone());
    let runner = CohortRunner::new(COHORT, &deps);
    write_posts(runner.paths());

    for stage in [Stage::SelfReport, Stage::Posts, Stage::Tiers] {
        let options = RunOptions {
            stage: Some(stage),
            ..Default::default()
        };
        runner.run(options).await.unwrap();
    }
    assert!(runner.paths().tier_users(Tier::Star).exists());
    assert!(runner.paths().tier_users(Tier::Regular).exists());

    // Only the regular tier goes through the network stages.
    for stage in [Stage::Fetch, Stage::Friends, Stage::Geocode, Stage::Analyze] {
        let options = RunOptions {
            stage: Some(stage),
            tier: Some(Tier::Regular),
            chunk: None,
        };
        runner.run(options).await.unwrap();
    }
    assert_eq!(graph.list_calls("starry", ListKind::Followers), 0);

    runner
        .run(RunOptions {
            stage: Some(Stage::Merge),
            ..Default::default()
        })
        .await
        .unwrap();

    let records = final_records(runner.paths());
    assert_eq!(records["4"].location.as_deref(), Some("Rockford, IL"));
    assert_eq!(records["3"].source, RecordSource::Unresolved);
    assert_eq!(records["3"].location, None);
    assert_eq!(records["1"].followers_count, 40);
}

#[tokio::test]
async fn missing_posts_file_fails_the_cohort() {
    let dir = tempfile::tempdir().unwrap();
    let deps = deps(
        dir.path(),
        Arc::new(MockGraph::new()),
        Arc::new(MockGeocoder::new()),
    );
    let runner = CohortRunner::new(COHORT, &deps);

    assert!(runner.run(RunOptions::default()).await.is_err());
    assert!(!runner.paths().final_records().exists());
}
