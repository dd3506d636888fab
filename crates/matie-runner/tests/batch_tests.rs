//! Batch Coordinator Integration Tests
//!
//! Author: hephaex@gmail.com
//!
//! Tests marked `#[cfg(unix)]` run a generated `decode.sh` through a real
//! subprocess; the rest use an in-process annotator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use matie_core::{AnnotatorConfig, DocumentOutcome, MatieError, ToolRun, ToolRunStatus};
use matie_runner::{BatchCoordinator, UnitAnnotator};

fn batch(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn config_in(base: &Path) -> AnnotatorConfig {
    AnnotatorConfig {
        working_dir: base.join("work"),
        ..Default::default()
    }
}

fn workspace_entries(config: &AnnotatorConfig) -> usize {
    match std::fs::read_dir(&config.working_dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

// =============================================================================
// In-process annotator
// =============================================================================

type Respond = fn(&str, &str) -> Option<String>;

/// Writes `.ann` files computed from each input, like the decoder would
struct FakeAnnotator {
    respond: Respond,
    delay: Duration,
    seen: Mutex<Vec<(PathBuf, String)>>,
}

impl FakeAnnotator {
    fn new(respond: Respond) -> Arc<Self> {
        Self::with_delay(respond, Duration::ZERO)
    }

    fn with_delay(respond: Respond, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            respond,
            delay,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<(PathBuf, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl UnitAnnotator for FakeAnnotator {
    async fn annotate_unit(&self, unit_dir: &Path) -> ToolRun {
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;

        for entry in std::fs::read_dir(unit_dir).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let stem = path.file_stem().unwrap().to_string_lossy().into_owned();
            let text = std::fs::read_to_string(&path).unwrap();
            self.seen.lock().unwrap().push((path.clone(), text.clone()));

            if let Some(ann) = (self.respond)(&stem, &text) {
                std::fs::write(path.with_extension("ann"), ann).unwrap();
            }
        }

        ToolRun {
            unit: unit_dir.file_name().unwrap().to_string_lossy().into_owned(),
            status: ToolRunStatus::Succeeded,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        }
    }
}

/// One entity spanning the whole text
fn whole_text_entity(_stem: &str, text: &str) -> Option<String> {
    Some(format!("T1\tTEXT 0 {}\t{}\n", text.len(), text))
}

fn entity_strings(outcome: &DocumentOutcome) -> Vec<String> {
    match outcome {
        DocumentOutcome::Annotated { entities, .. } => {
            entities.iter().map(|e| e.entity_string.clone()).collect()
        }
        other => panic!("expected annotated outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_batches_with_same_key_are_isolated() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    let annotator = FakeAnnotator::with_delay(whole_text_entity, Duration::from_millis(100));
    let coordinator = BatchCoordinator::with_annotator(&config, annotator.clone());

    let (first, second) = tokio::join!(
        coordinator.annotate(batch(&[("doc1", "alpha one")])),
        coordinator.annotate(batch(&[("doc1", "beta two")])),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_ne!(first.batch_id, second.batch_id);
    assert_eq!(entity_strings(&first.documents["doc1"]), vec!["alpha one"]);
    assert_eq!(entity_strings(&second.documents["doc1"]), vec!["beta two"]);

    // Each invocation saw exactly its own batch's input, in distinct workspaces.
    let seen = annotator.seen();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0].0, seen[1].0);
    assert_ne!(seen[0].0.parent(), seen[1].0.parent());

    assert_eq!(workspace_entries(&config), 0);
}

#[tokio::test]
async fn test_missing_output_is_reported_per_key() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    fn skip_rejected(stem: &str, text: &str) -> Option<String> {
        (stem != "rejected").then(|| whole_text_entity(stem, text).unwrap())
    }
    let coordinator = BatchCoordinator::with_annotator(&config, FakeAnnotator::new(skip_rejected));

    let report = coordinator
        .annotate(batch(&[("kept", "LiFePO4 cathode"), ("rejected", "???")]))
        .await
        .unwrap();

    assert!(report.documents["kept"].is_annotated());
    match &report.documents["rejected"] {
        DocumentOutcome::Failed { kind, .. } => assert_eq!(kind, "missing_output"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(report.annotated_count(), 1);
    assert_eq!(workspace_entries(&config), 0);
}

#[tokio::test]
async fn test_malformed_annotation_does_not_fail_batch() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    fn broken_relation(stem: &str, text: &str) -> Option<String> {
        if stem == "bad" {
            Some("T1\tMAT 0 3\tabc\nR1\tBROKEN T1 T1\n".to_string())
        } else {
            whole_text_entity(stem, text)
        }
    }
    let coordinator =
        BatchCoordinator::with_annotator(&config, FakeAnnotator::new(broken_relation));

    let report = coordinator
        .annotate(batch(&[("bad", "abc"), ("good", "xyz")]))
        .await
        .unwrap();

    match &report.documents["bad"] {
        DocumentOutcome::Failed { kind, message } => {
            assert_eq!(kind, "malformed_annotation");
            assert!(message.contains("line 2"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(report.documents["good"].is_annotated());
}

#[tokio::test]
async fn test_dangling_relation_is_surfaced() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    fn dangling(_stem: &str, _text: &str) -> Option<String> {
        Some("T1\tMAT 0 3\tabc\nR1\tPART_OF Arg1:T1 Arg2:T7\nT2\tMAT 4 7\tdef\n".to_string())
    }
    let coordinator = BatchCoordinator::with_annotator(&config, FakeAnnotator::new(dangling));

    let report = coordinator.annotate(batch(&[("d", "abc def")])).await.unwrap();

    match &report.documents["d"] {
        DocumentOutcome::Annotated {
            entities,
            relations,
            warnings,
            ..
        } => {
            assert_eq!(entities.len(), 2);
            assert_eq!(relations.len(), 1);
            assert_eq!(warnings, &vec!["relation R1 Arg2 references unknown entity T7".to_string()]);
        }
        other => panic!("expected annotated outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_newlines_normalized_before_annotation() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    let annotator = FakeAnnotator::new(whole_text_entity);
    let coordinator = BatchCoordinator::with_annotator(&config, annotator.clone());

    let report = coordinator
        .annotate(batch(&[("p", "first line\nsecond line")]))
        .await
        .unwrap();

    match &report.documents["p"] {
        DocumentOutcome::Annotated { text, .. } => assert_eq!(text, "first line second line"),
        other => panic!("expected annotated outcome, got {other:?}"),
    }
    assert_eq!(annotator.seen()[0].1, "first line second line");
}

#[tokio::test]
async fn test_keys_with_slashes_map_to_flat_files() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    let annotator = FakeAnnotator::new(whole_text_entity);
    let coordinator = BatchCoordinator::with_annotator(&config, annotator.clone());

    let report = coordinator
        .annotate(batch(&[("papers/2021/abstract", "text")]))
        .await
        .unwrap();

    assert!(report.documents["papers/2021/abstract"].is_annotated());
    assert!(annotator.seen()[0].0.ends_with("papers_2021_abstract.txt"));
}

#[tokio::test]
async fn test_key_collision_rejects_batch() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    let annotator = FakeAnnotator::new(whole_text_entity);
    let coordinator = BatchCoordinator::with_annotator(&config, annotator.clone());

    let err = coordinator
        .annotate(batch(&[("a/b", "one"), ("a_b", "two")]))
        .await
        .unwrap_err();

    assert!(matches!(err, MatieError::KeyCollision { .. }));
    assert!(annotator.seen().is_empty());
    assert_eq!(workspace_entries(&config), 0);
}

#[tokio::test]
async fn test_empty_key_rejects_batch() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    let coordinator =
        BatchCoordinator::with_annotator(&config, FakeAnnotator::new(whole_text_entity));

    let err = coordinator.annotate(batch(&[("", "text")])).await.unwrap_err();
    assert!(matches!(err, MatieError::InvalidKey(_)));
}

#[tokio::test]
async fn test_large_batches_split_into_units() {
    let base = tempfile::tempdir().unwrap();
    let config = AnnotatorConfig {
        max_documents_per_unit: 2,
        ..config_in(base.path())
    };
    let coordinator =
        BatchCoordinator::with_annotator(&config, FakeAnnotator::new(whole_text_entity));

    let report = coordinator
        .annotate(batch(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")]))
        .await
        .unwrap();

    let units: Vec<&str> = report.tool_runs.iter().map(|r| r.unit.as_str()).collect();
    assert_eq!(units, vec!["unit_000", "unit_001", "unit_002"]);
    assert_eq!(report.annotated_count(), 5);
}

#[tokio::test]
async fn test_write_failure_is_reported_per_key() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    let annotator = FakeAnnotator::new(whole_text_entity);
    let coordinator = BatchCoordinator::with_annotator(&config, annotator.clone());

    // Longer than any filesystem allows for one path component.
    let long_key = "k".repeat(300);
    let report = coordinator
        .annotate(batch(&[(long_key.as_str(), "unwritable"), ("ok", "fine")]))
        .await
        .unwrap();

    assert_eq!(report.documents[&long_key].label(), "io");
    assert_eq!(entity_strings(&report.documents["ok"]), vec!["fine"]);
    assert_eq!(annotator.seen().len(), 1);
    assert_eq!(workspace_entries(&config), 0);
}

#[tokio::test]
async fn test_workspace_creation_failure_is_fatal() {
    let base = tempfile::tempdir().unwrap();
    let blocker = base.path().join("work");
    std::fs::write(&blocker, "not a directory").unwrap();
    let config = config_in(base.path());
    let coordinator =
        BatchCoordinator::with_annotator(&config, FakeAnnotator::new(whole_text_entity));

    let err = coordinator.annotate(batch(&[("a", "text")])).await.unwrap_err();
    assert!(matches!(err, MatieError::WorkspaceCreation { .. }));
}

#[tokio::test]
async fn test_empty_batch() {
    let base = tempfile::tempdir().unwrap();
    let config = config_in(base.path());
    let annotator = FakeAnnotator::new(whole_text_entity);
    let coordinator = BatchCoordinator::with_annotator(&config, annotator.clone());

    let report = coordinator.annotate(BTreeMap::new()).await.unwrap();
    assert!(report.documents.is_empty());
    assert!(report.tool_runs.is_empty());
    assert!(annotator.seen().is_empty());
}

// =============================================================================
// Decoder subprocess
// =============================================================================

#[cfg(unix)]
mod subprocess {
    use super::*;

    /// Write a non-executable decode script; the orchestrator must chmod it
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("decode.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    fn script_config(base: &Path, body: &str) -> AnnotatorConfig {
        let tool_dir = base.join("tool");
        std::fs::create_dir_all(&tool_dir).unwrap();
        write_script(&tool_dir, body);
        AnnotatorConfig {
            decode_script: PathBuf::from("./decode.sh"),
            tool_dir,
            ..config_in(base)
        }
    }

    #[tokio::test]
    async fn test_annotates_example_document() {
        let base = tempfile::tempdir().unwrap();
        let config = script_config(
            base.path(),
            r#"printf 'T1\tPERSON 0 5\tMaria\nT2\tORG 15 24\tAcme Corp\nR1\tEMPLOYS Arg1:T2 Arg2:T1\n' > "$OUTPUT_DIR/a.ann""#,
        );
        let coordinator = BatchCoordinator::from_config(&config);

        let report = coordinator
            .annotate(batch(&[("a", "Maria works at Acme Corp.")]))
            .await
            .unwrap();

        assert_eq!(report.tool_runs.len(), 1);
        assert_eq!(report.tool_runs[0].status, ToolRunStatus::Succeeded);

        let json = serde_json::to_value(&report.documents["a"]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "annotated",
                "text": "Maria works at Acme Corp.",
                "entities": [
                    {"id": "T1", "entity_type": "PERSON", "start": 0, "end": 5, "entity_string": "Maria"},
                    {"id": "T2", "entity_type": "ORG", "start": 15, "end": 24, "entity_string": "Acme Corp"}
                ],
                "relations": [
                    {"id": "R1", "relation_type": "EMPLOYS", "arg1": "T2", "arg2": "T1"}
                ]
            })
        );
        assert_eq!(workspace_entries(&config), 0);
    }

    #[tokio::test]
    async fn test_decoder_receives_environment_contract() {
        let base = tempfile::tempdir().unwrap();
        let log = base.path().join("env.log");
        let body = r#"{
  echo "MODEL_DIR=$MODEL_DIR"
  echo "VOCAB_DIR=$VOCAB_DIR"
  echo "CUDA=[$CUDA_VISIBLE_DEVICES]"
  echo "INPUT_DIR=$INPUT_DIR"
  echo "OUTPUT_DIR=$OUTPUT_DIR"
  echo "EXTRA_ARGS=$EXTRA_ARGS"
} > "@LOG@"
for f in "$INPUT_DIR"/*.txt; do : > "${f%.txt}.ann"; done"#
            .replace("@LOG@", &log.to_string_lossy());
        let config = AnnotatorConfig {
            extra_args: "--batch_size 8".to_string(),
            ..script_config(base.path(), &body)
        };

        let report = BatchCoordinator::from_config(&config)
            .annotate(batch(&[("doc", "text")]))
            .await
            .unwrap();
        assert!(report.documents["doc"].is_annotated());

        let env = std::fs::read_to_string(&log).unwrap();
        let value = |key: &str| {
            env.lines()
                .find_map(|l| l.strip_prefix(&format!("{key}=")))
                .unwrap()
                .to_string()
        };
        assert_eq!(value("MODEL_DIR"), "model");
        assert_eq!(value("VOCAB_DIR"), "vpack_mat");
        assert_eq!(value("CUDA"), "[]");
        assert_eq!(value("EXTRA_ARGS"), "--batch_size 8");
        assert_eq!(value("INPUT_DIR"), value("OUTPUT_DIR"));

        let input_dir = PathBuf::from(value("INPUT_DIR"));
        assert!(input_dir.is_absolute());
        assert!(input_dir.ends_with("unit_000"));
        assert!(input_dir.starts_with(&config.working_dir));
        assert!(!input_dir.exists());
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_partial_outputs() {
        let base = tempfile::tempdir().unwrap();
        let config = script_config(
            base.path(),
            r#"printf 'T1\tMAT 0 4\tLiFe\n' > "$OUTPUT_DIR/a.ann"
echo "decoder crashed on b" >&2
exit 3"#,
        );

        let report = BatchCoordinator::from_config(&config)
            .annotate(batch(&[("a", "LiFe electrodes"), ("b", "crashes")]))
            .await
            .unwrap();

        let run = &report.tool_runs[0];
        assert_eq!(run.status, ToolRunStatus::Failed);
        assert_eq!(run.exit_code, Some(3));
        assert!(run.stderr.contains("decoder crashed on b"));
        assert!(report.has_tool_failures());

        assert_eq!(entity_strings(&report.documents["a"]), vec!["LiFe"]);
        match &report.documents["b"] {
            DocumentOutcome::Failed { kind, .. } => assert_eq!(kind, "missing_output"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(workspace_entries(&config), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_reported_and_workspace_released() {
        let base = tempfile::tempdir().unwrap();
        let config = AnnotatorConfig {
            timeout_secs: 1,
            ..script_config(base.path(), "exec sleep 30")
        };

        let started = Instant::now();
        let report = BatchCoordinator::from_config(&config)
            .annotate(batch(&[("slow", "text")]))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(report.tool_runs[0].status, ToolRunStatus::TimedOut);
        assert!(!report.documents["slow"].is_annotated());
        assert_eq!(workspace_entries(&config), 0);
    }

    /// Whether `pid` is a live (non-zombie) process
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .map_or(false, |state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_decoder_descendants() {
        let base = tempfile::tempdir().unwrap();
        let pid_file = base.path().join("child.pid");
        let body = r#"echo "loading model" >&2
sleep 30 &
echo $! > "@PID@"
wait"#
            .replace("@PID@", &pid_file.to_string_lossy());
        let config = AnnotatorConfig {
            timeout_secs: 1,
            ..script_config(base.path(), &body)
        };

        let report = BatchCoordinator::from_config(&config)
            .annotate(batch(&[("slow", "text")]))
            .await
            .unwrap();

        let run = &report.tool_runs[0];
        assert_eq!(run.status, ToolRunStatus::TimedOut);
        assert!(run.stderr.contains("loading model"));

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while is_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!is_running(pid), "background decoder process {pid} survived");
        assert_eq!(workspace_entries(&config), 0);
    }

    #[tokio::test]
    async fn test_missing_script_yields_missing_outputs() {
        let base = tempfile::tempdir().unwrap();
        let config = AnnotatorConfig {
            decode_script: base.path().join("does-not-exist.sh"),
            ..config_in(base.path())
        };

        let report = BatchCoordinator::from_config(&config)
            .annotate(batch(&[("a", "text")]))
            .await
            .unwrap();

        assert_eq!(report.tool_runs[0].status, ToolRunStatus::SpawnFailed);
        assert_eq!(report.documents["a"].label(), "missing_output");
        assert_eq!(workspace_entries(&config), 0);
    }
}
