use consensus_harness::judge::{ParseStage, Sample, SampleFailure, SampleOutcome};
use consensus_harness::{JsonlTraceSink, SampleTrace, TraceSink};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    backend_id: String,
    sample_index: u32,
    attempts: u32,
    score: Option<f64>,
    rationale: Option<String>,
    parse_stage: Option<String>,
    failure: Option<String>,
}

fn scored(index: u32, score: f64) -> Sample {
    Sample {
        backend_id: "a".to_string(),
        index,
        attempts: 1,
        latency_ms: 12,
        outcome: SampleOutcome::Scored {
            score,
            rationale: "fine".to_string(),
            stage: ParseStage::FencedBlock,
        },
    }
}

fn timed_out(index: u32) -> Sample {
    Sample {
        backend_id: "slow".to_string(),
        index,
        attempts: 2,
        latency_ms: 30_000,
        outcome: SampleOutcome::Failed(SampleFailure::Transport {
            code: "timeout".to_string(),
            message: "timeout after 30s".to_string(),
            retryable: true,
        }),
    }
}

#[test]
fn jsonl_trace_sink_writes_one_line_per_sample_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(SampleTrace::from_sample("tc-1", "relevance", "d1", "x/a", &scored(0, 7.0)))
        .unwrap();
    sink.record(SampleTrace::from_sample("tc-1", "relevance", "d1", "x/slow", &timed_out(1)))
        .unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].backend_id, "a");
    assert_eq!(rows[0].score, Some(7.0));
    assert_eq!(rows[0].rationale.as_deref(), Some("fine"));
    assert_eq!(rows[0].parse_stage.as_deref(), Some("fenced_block"));
    assert!(rows[0].failure.is_none());

    assert_eq!(rows[1].sample_index, 1);
    assert_eq!(rows[1].attempts, 2);
    assert!(rows[1].score.is_none());
    assert!(rows[1].rationale.is_none());
    assert!(rows[1].failure.as_deref().unwrap().starts_with("timeout"));
}
