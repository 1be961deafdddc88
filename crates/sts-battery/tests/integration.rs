//! Integration tests for sts-battery.
//!
//! These tests run the whole battery end to end:
//! config → run state → parallel iterate → artifacts → metrics → summary.json.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sts_battery::state::{FINAL_REPORT, SUMMARY_JSON};
use sts_battery::universal::MIN_UNIVERSAL;
use sts_battery::{BitBuffer, MetricResult, RunConfig, RunSummary, TestId, run_battery};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_streams(seed: u64, count: usize, n: usize) -> Vec<BitBuffer> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let mut bytes = vec![0u8; n.div_ceil(8)];
            rng.fill_bytes(&mut bytes);
            BitBuffer::from_bytes(&bytes)
        })
        .collect()
}

fn config(dir: &Path, num_bitstreams: usize, threads: usize) -> RunConfig {
    RunConfig {
        n: MIN_UNIVERSAL,
        num_bitstreams,
        threads,
        output_dir: dir.to_path_buf(),
        ..RunConfig::default()
    }
}

fn read(dir: &Path, rel: &str) -> String {
    fs::read_to_string(dir.join(rel)).unwrap_or_else(|e| panic!("reading {rel}: {e}"))
}

#[test]
fn worker_count_does_not_change_artifacts() {
    init_logging();
    let streams = random_streams(7, 12, MIN_UNIVERSAL);

    let single = tempfile::tempdir().unwrap();
    let many = tempfile::tempdir().unwrap();
    let a = run_battery(config(single.path(), 12, 1), &streams).unwrap();
    let b = run_battery(config(many.path(), 12, 4), &streams).unwrap();

    for rel in ["Universal/stats.txt", "Universal/results.txt", FINAL_REPORT] {
        assert_eq!(read(single.path(), rel), read(many.path(), rel), "{rel} differs");
    }
    assert_eq!(a.tests, b.tests);
    assert_eq!(a.successful_tests, b.successful_tests);
    assert_eq!(a.max_general_sample_size, 12);
}

#[test]
fn random_streams_are_counted() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let streams = random_streams(42, 10, MIN_UNIVERSAL);
    let summary = run_battery(config(dir.path(), 10, 3), &streams).unwrap();

    let counters = summary.tests[0].counters;
    assert_eq!(counters.count, 10);
    assert_eq!(counters.valid, 10);
    assert_eq!(counters.valid_p, 10);
    assert_eq!(counters.success + counters.failure, 10);

    let results = read(dir.path(), "Universal/results.txt");
    assert_eq!(results.lines().count(), 10);
    for line in results.lines() {
        let p: f64 = line.parse().unwrap();
        assert!((0.0..=1.0).contains(&p), "p={p}");
    }
    let stats = read(dir.path(), "Universal/stats.txt");
    assert_eq!(stats.matches("\t\tp_value = ").count(), 10);
    assert_eq!(stats.matches("(a) L         = 6").count(), 10);
}

#[test]
fn all_zero_streams_fail() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let streams = vec![BitBuffer::from_bits(vec![0; MIN_UNIVERSAL]).unwrap(); 3];
    let summary = run_battery(config(dir.path(), 3, 2), &streams).unwrap();

    let universal = &summary.tests[0];
    assert_eq!(universal.counters.success, 0);
    assert_eq!(universal.counters.failure, 3);
    assert_eq!(universal.metric_results, vec![MetricResult::FailedBoth]);
    assert_eq!(summary.successful_tests, 0);

    let results = read(dir.path(), "Universal/results.txt");
    assert_eq!(results, "0.000000\n0.000000\n0.000000\n");
    let stats = read(dir.path(), "Universal/stats.txt");
    assert_eq!(stats.matches("FAILURE\t\tp_value = 0.000000\n\n").count(), 3);
    assert!(stats.contains("(d) sum       = 0.000000"));
}

#[test]
fn short_streams_disable_the_test() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let n = MIN_UNIVERSAL - 1;
    let streams = random_streams(1, 2, n);
    let cfg = RunConfig {
        n,
        ..config(dir.path(), 2, 2)
    };
    let summary = run_battery(cfg, &streams).unwrap();

    assert!(!summary.tests[0].enabled);
    assert_eq!(summary.tests[0].counters.count, 0);
    assert!(!dir.path().join("Universal").exists());
    // header only
    assert_eq!(read(dir.path(), FINAL_REPORT).lines().count(), 1);
}

#[test]
fn partitions_split_p_values_round_robin() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let streams = random_streams(3, 5, MIN_UNIVERSAL);
    let mut cfg = config(dir.path(), 5, 2);
    cfg.partitions.insert(TestId::Universal, 2);
    let summary = run_battery(cfg, &streams).unwrap();

    let results: Vec<String> = read(dir.path(), "Universal/results.txt")
        .lines()
        .map(str::to_string)
        .collect();
    let data1: Vec<String> = read(dir.path(), "Universal/data1.txt")
        .lines()
        .map(str::to_string)
        .collect();
    let data2: Vec<String> = read(dir.path(), "Universal/data2.txt")
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(data1, vec![results[0].clone(), results[2].clone(), results[4].clone()]);
    assert_eq!(data2, vec![results[1].clone(), results[3].clone()]);

    assert_eq!(summary.tests[0].partition_count, 2);
    assert_eq!(summary.tests[0].metric_results.len(), 2);
    assert_eq!(summary.max_general_sample_size, 3);
    // header plus one line per partition
    assert_eq!(read(dir.path(), FINAL_REPORT).lines().count(), 3);
}

#[test]
fn single_partition_writes_no_data_files() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let streams = random_streams(5, 2, MIN_UNIVERSAL);
    run_battery(config(dir.path(), 2, 1), &streams).unwrap();
    assert!(!dir.path().join("Universal/data1.txt").exists());
}

#[test]
fn legacy_layout() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let streams = random_streams(11, 2, MIN_UNIVERSAL);
    let cfg = RunConfig {
        legacy_output: true,
        ..config(dir.path(), 2, 2)
    };
    run_battery(cfg, &streams).unwrap();

    let stats = read(dir.path(), "Universal/stats.txt");
    assert!(stats.starts_with("\t\tUNIVERSAL STATISTICAL TEST\n"));
    assert_eq!(stats.matches("COMPUTATIONAL INFORMATION:").count(), 2);
    assert_eq!(stats.matches("(i) WARNING:  0 bits were discarded.").count(), 2);

    let report = read(dir.path(), FINAL_REPORT);
    assert!(report.contains("RESULTS FOR THE UNIFORMITY OF P-VALUES"));
    let last = report.lines().last().unwrap();
    // two samples cannot fill ten bins
    assert!(last.contains("    ----    "), "{last}");
    assert!(last.ends_with("\t Universal"), "{last}");
}

#[test]
fn results_files_can_be_disabled() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let streams = random_streams(13, 3, MIN_UNIVERSAL);
    let cfg = RunConfig {
        write_results: false,
        ..config(dir.path(), 3, 2)
    };
    let summary = run_battery(cfg, &streams).unwrap();

    assert!(!dir.path().join("Universal").exists());
    assert_eq!(summary.tests[0].counters.count, 3);
    assert_eq!(summary.tests[0].metric_results.len(), 1);
    assert_eq!(read(dir.path(), FINAL_REPORT).lines().count(), 2);
}

#[test]
fn summary_json_matches_returned_summary() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let streams = random_streams(17, 4, MIN_UNIVERSAL);
    let cfg = config(dir.path(), 4, 2);
    let summary = run_battery(cfg.clone(), &streams).unwrap();

    let parsed: RunSummary = serde_json::from_str(&read(dir.path(), SUMMARY_JSON)).unwrap();
    assert_eq!(parsed, summary);
    assert_eq!(parsed.config, cfg);
    assert_eq!(parsed.sts_battery_version, sts_battery::VERSION);
    assert_eq!(parsed.tests[0].name, "Universal");
    assert_eq!(parsed.id.len(), 36);
}

#[test]
fn config_file_drives_a_run() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let path = dir.path().join("run.json");
    fs::write(
        &path,
        format!(
            r#"{{"n": {MIN_UNIVERSAL}, "num_bitstreams": 2, "threads": 2, "output_dir": {:?}}}"#,
            out.to_str().unwrap()
        ),
    )
    .unwrap();

    let cfg = RunConfig::from_path(&path).unwrap();
    let summary = run_battery(cfg, &random_streams(19, 2, MIN_UNIVERSAL)).unwrap();
    assert_eq!(summary.tests[0].counters.count, 2);
    assert!(out.join(SUMMARY_JSON).exists());
}
