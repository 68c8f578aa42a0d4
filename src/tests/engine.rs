use serde_json::json;

use crate::engine::{dispatch, CaptureOutcome, Command, EngineError, EngineFactory};
use crate::records::RecordDraft;
use crate::rules::RuleKind;

use super::{create_engine, create_engine_with_config};

/// Config that links almost everything, so graph assertions don't depend
/// on hash geometry.
const DENSE_GRAPH: &str = "graph:\n  min_similarity: 0.05\n";

fn draft(url: &str, title: &str, body: &str, keywords: &[&str]) -> RecordDraft {
    RecordDraft {
        url: url.to_string(),
        title: title.to_string(),
        body: body.to_string(),
        keywords: keywords.iter().map(|kw| kw.to_string()).collect(),
        ..Default::default()
    }
}

fn session_draft(url: &str, title: &str, timestamp_ms: u64, session: &str) -> RecordDraft {
    RecordDraft {
        url: url.to_string(),
        title: title.to_string(),
        timestamp_ms: Some(timestamp_ms),
        session_id: Some(session.to_string()),
        ..Default::default()
    }
}

fn stored_id(outcome: CaptureOutcome) -> u64 {
    match outcome {
        CaptureOutcome::Stored { id, .. } => id,
        CaptureOutcome::Blocked { rule_id } => panic!("capture blocked by rule {rule_id}"),
    }
}

#[test]
fn capture_then_search_ranks_by_meaning() {
    let (engine, _tmp) = create_engine();

    let cats = stored_id(
        engine
            .capture(draft(
                "https://pets.example/cats",
                "adopting cats",
                "how to adopt a shelter cat",
                &["cats", "pets"],
            ))
            .unwrap(),
    );
    engine
        .capture(draft(
            "https://pets.example/dogs",
            "walking dogs",
            "daily walks keep dogs healthy",
            &["dogs", "pets"],
        ))
        .unwrap();
    engine
        .capture(draft(
            "https://lang.example/rust",
            "rust borrow checker",
            "ownership and lifetimes explained",
            &["rust"],
        ))
        .unwrap();

    let matches = engine.search("cats", None, Some(0.0)).unwrap();
    assert!(!matches.is_empty());
    assert_eq!(matches[0].record_id, cats);
}

#[test]
fn search_on_empty_store_returns_nothing() {
    let (engine, _tmp) = create_engine();
    assert!(engine.search("anything", None, None).unwrap().is_empty());
}

#[test]
fn keyword_fallback_catches_what_vectors_miss() {
    let (engine, _tmp) = create_engine();

    engine
        .capture(draft(
            "https://pets.example/cats",
            "adopting cats",
            "",
            &["cats", "pets"],
        ))
        .unwrap();
    engine
        .capture(draft(
            "https://pets.example/dogs",
            "walking dogs",
            "",
            &["dogs", "pets"],
        ))
        .unwrap();

    // threshold no vector hit can pass, both records still come back
    // through keyword overlap
    let matches = engine.search("pets", None, Some(0.99)).unwrap();
    assert_eq!(matches.len(), 2);
    for hit in &matches {
        assert!(hit.shared_keywords.contains(&"pets".to_string()));
        assert!(hit.similarity >= 0.2 && hit.similarity < 0.3);
    }
}

#[test]
fn active_rule_blocks_capture_until_toggled() {
    let (engine, _tmp) = create_engine();

    let rule = engine
        .add_rule(RuleKind::Domain, "tracker.com".to_string())
        .unwrap();

    let outcome = engine
        .capture(draft("https://tracker.com/pixel", "pixel", "", &[]))
        .unwrap();
    match outcome {
        CaptureOutcome::Blocked { rule_id } => assert_eq!(rule_id, rule.id),
        CaptureOutcome::Stored { .. } => panic!("rule did not block the capture"),
    }

    // the toggle applies to the next capture
    engine.toggle_rule(&rule.id).unwrap();
    let outcome = engine
        .capture(draft("https://tracker.com/pixel", "pixel", "", &[]))
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::Stored { .. }));
}

#[test]
fn forget_domain_cascades_into_vectors_and_edges() {
    let (engine, _tmp) = create_engine_with_config(DENSE_GRAPH);

    engine
        .capture(draft(
            "https://old.example/a",
            "rust async runtime",
            "tokio schedules tasks",
            &["rust"],
        ))
        .unwrap();
    engine
        .capture(draft(
            "https://old.example/b",
            "rust async executor",
            "tokio drives futures",
            &["rust"],
        ))
        .unwrap();
    let keeper = stored_id(
        engine
            .capture(draft(
                "https://keep.example/c",
                "rust error handling",
                "results and question mark",
                &["rust"],
            ))
            .unwrap(),
    );

    let before = engine.stats().unwrap();
    assert_eq!(before.records, 3);
    assert_eq!(before.vectors, 3);
    assert!(before.edges > 0);

    let deleted = engine.forget_domain("old.example").unwrap();
    assert_eq!(deleted, 2);

    let after = engine.stats().unwrap();
    assert_eq!(after.records, 1);
    assert_eq!(after.vectors, 1);
    assert_eq!(after.edges, 0);

    // the survivor no longer links to anything
    assert!(engine.neighbors(keeper, None).unwrap().is_empty());
}

#[test]
fn forget_date_range_is_inclusive() {
    let (engine, _tmp) = create_engine();

    engine
        .capture(session_draft("https://a.com/1", "one", 1_000, ""))
        .unwrap();
    engine
        .capture(session_draft("https://a.com/2", "two", 5_000, ""))
        .unwrap();
    engine
        .capture(session_draft("https://a.com/3", "three", 9_000, ""))
        .unwrap();

    let deleted = engine.forget_date_range("1000..5000").unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(engine.export().unwrap().len(), 1);
}

#[test]
fn forget_command_requires_exactly_one_selector() {
    let (engine, _tmp) = create_engine();

    let response = dispatch(
        &engine,
        Command::Forget {
            domain: None,
            date_range: None,
        },
    );
    assert!(!response.success);
    assert!(response.error.unwrap().contains("exactly one"));

    let response = dispatch(
        &engine,
        Command::Forget {
            domain: Some("a.com".to_string()),
            date_range: None,
        },
    );
    assert!(response.success);
    assert_eq!(response.data.unwrap(), json!({ "deleted_count": 0 }));
}

#[test]
fn neighbors_come_back_strongest_first() {
    let (engine, _tmp) = create_engine_with_config(DENSE_GRAPH);

    let anchor = stored_id(
        engine
            .capture(draft(
                "https://docs.example/a",
                "rust async runtime tokio",
                "spawning tasks on the tokio runtime",
                &["rust", "async"],
            ))
            .unwrap(),
    );
    let twin = stored_id(
        engine
            .capture(draft(
                "https://docs.example/b",
                "rust async runtime",
                "spawning tasks on a runtime",
                &["rust", "async"],
            ))
            .unwrap(),
    );
    engine
        .capture(draft(
            "https://food.example/c",
            "sourdough starters",
            "feeding flour and water on a schedule",
            &["baking"],
        ))
        .unwrap();

    let neighbors = engine.neighbors(anchor, None).unwrap();
    assert!(!neighbors.is_empty());
    assert_eq!(neighbors[0].id, twin);
}

#[test]
fn neighbors_of_unknown_record_is_not_found() {
    let (engine, _tmp) = create_engine();
    assert!(matches!(
        engine.neighbors(42, None),
        Err(EngineError::NotFound)
    ));
}

#[test]
fn session_diff_reports_membership_and_similarity() {
    let (engine, _tmp) = create_engine();

    engine
        .capture(session_draft("https://a.com/1", "one", 1_000, "s1"))
        .unwrap();
    engine
        .capture(session_draft("https://a.com/2", "two", 2_000, "s1"))
        .unwrap();
    engine
        .capture(session_draft("https://a.com/2", "two again", 3_000, "s2"))
        .unwrap();
    engine
        .capture(session_draft("https://a.com/3", "three", 4_000, "s2"))
        .unwrap();

    let report = engine.diff_sessions("s1", "s2").unwrap();
    assert_eq!(report.diff.added, vec!["https://a.com/3".to_string()]);
    assert_eq!(report.diff.removed, vec!["https://a.com/1".to_string()]);
    assert_eq!(report.diff.modified, vec!["https://a.com/2".to_string()]);

    // 0.5 * 1/3 shared urls + 0.3 * 1.0 keywords + 0.2 * 1.0 domains
    assert!((report.similarity - 0.666_67).abs() < 1e-3);
}

#[test]
fn merge_sessions_keeps_latest_per_url_and_retags() {
    let (engine, _tmp) = create_engine();

    engine
        .capture(session_draft("https://a.com/1", "one", 1_000, "s1"))
        .unwrap();
    engine
        .capture(session_draft("https://a.com/2", "two", 2_000, "s1"))
        .unwrap();
    engine
        .capture(session_draft("https://a.com/2", "two again", 3_000, "s2"))
        .unwrap();
    engine
        .capture(session_draft("https://a.com/3", "three", 4_000, "s2"))
        .unwrap();

    let merged = engine.merge_sessions("s1", "s2").unwrap();
    assert_eq!(merged.id, "s1");
    assert_eq!(merged.start_time_ms, 1_000);

    let records = engine.export().unwrap();
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.session_id, "s1");
    }

    // the later visit of the shared url survived
    let two = records
        .iter()
        .find(|r| r.url == "https://a.com/2")
        .unwrap();
    assert_eq!(two.timestamp_ms, 3_000);

    assert_eq!(engine.stats().unwrap().sessions, 1);
    assert!(matches!(
        engine.merge_sessions("s1", "missing"),
        Err(EngineError::SessionNotFound(_))
    ));
}

#[test]
fn merging_a_session_with_itself_is_rejected() {
    let (engine, _tmp) = create_engine();
    engine
        .capture(session_draft("https://a.com/1", "one", 1_000, "s1"))
        .unwrap();
    assert!(engine.merge_sessions("s1", "s1").is_err());
}

#[test]
fn dataset_survives_restart() {
    let (engine, tmp) = create_engine_with_config(DENSE_GRAPH);

    engine
        .capture(draft(
            "https://docs.example/a",
            "rust async runtime",
            "tokio schedules tasks",
            &["rust"],
        ))
        .unwrap();
    engine
        .capture(draft(
            "https://docs.example/b",
            "rust async executor",
            "tokio drives futures",
            &["rust"],
        ))
        .unwrap();
    engine
        .add_rule(RuleKind::Keyword, "secret".to_string())
        .unwrap();

    let before = engine.stats().unwrap();
    assert!(before.edges > 0);
    drop(engine);

    let engine = EngineFactory::create_at(&tmp.path().to_string_lossy()).unwrap();
    let after = engine.stats().unwrap();
    assert_eq!(after.records, before.records);
    assert_eq!(after.vectors, before.vectors);
    assert_eq!(after.edges, before.edges);
    assert_eq!(engine.list_rules().len(), 1);

    // loaded vectors answer searches without a reindex
    assert!(!engine.search("tokio", None, Some(0.0)).unwrap().is_empty());
}

#[test]
fn reindex_rebuilds_everything() {
    let (engine, _tmp) = create_engine_with_config(DENSE_GRAPH);

    for n in 0..3 {
        engine
            .capture(draft(
                &format!("https://docs.example/{n}"),
                &format!("rust guide part {n}"),
                "ownership borrowing lifetimes",
                &["rust"],
            ))
            .unwrap();
    }

    let report = engine.reindex().unwrap();
    assert_eq!(report.records, 3);
    assert!(report.edges > 0);

    let stats = engine.stats().unwrap();
    assert_eq!(stats.vectors, 3);
    assert_eq!(stats.edges, report.edges);
}

#[test]
fn capture_embeds_inline_without_a_worker() {
    let (mut engine, _tmp) = create_engine();
    engine.shutdown();

    let outcome = engine
        .capture(draft("https://a.com/x", "solo", "no worker around", &[]))
        .unwrap();
    assert!(matches!(
        outcome,
        CaptureOutcome::Stored { embedded: true, .. }
    ));
    assert_eq!(engine.stats().unwrap().vectors, 1);
}

#[test]
fn capture_survives_a_stalled_embedding() {
    // a zero timeout expires before the worker can answer, which is the
    // stalled-worker path without the wait
    let (engine, _tmp) = create_engine_with_config("embedding:\n  timeout_secs: 0\n");

    let outcome = engine
        .capture(draft(
            "https://slow.example/a",
            "glacier photography",
            "",
            &["glacier"],
        ))
        .unwrap();
    assert!(matches!(
        outcome,
        CaptureOutcome::Stored {
            embedded: false,
            ..
        }
    ));

    // the record is keyword-searchable while its vector is missing
    let stats = engine.stats().unwrap();
    assert_eq!(stats.records, 1);
    assert_eq!(stats.vectors, 0);

    let matches = engine.search("glacier", None, None).unwrap();
    assert_eq!(matches.len(), 1);
    assert!(matches[0].similarity < 0.3);
}

#[test]
fn commands_round_trip_through_the_wire_shape() {
    let (engine, _tmp) = create_engine();

    let command: Command = serde_json::from_value(json!({
        "type": "CAPTURE",
        "record": { "url": "https://x.dev/a", "title": "alpha" },
    }))
    .unwrap();
    let response = dispatch(&engine, command);
    assert!(response.success);
    assert_eq!(response.data.unwrap()["status"], "stored");

    let command: Command = serde_json::from_str(r#"{"type": "STATS"}"#).unwrap();
    let response = dispatch(&engine, command);
    assert!(response.success);
    assert_eq!(response.data.unwrap()["records"], 1);
}
