use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::trace;
use mapreduce::app::wc;
use mapreduce::codec::open_records;
use mapreduce::{Job, JobReport, Master, MasterConfig, RetryPolicy, Worker, Workspace};
use tempfile::TempDir;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(10);

fn write_inputs(dir: &Path, texts: &[&str]) -> PathBuf {
    let input = dir.join("input");
    fs::create_dir(&input).unwrap();
    for (i, text) in texts.iter().enumerate() {
        fs::write(input.join(format!("{}.txt", i)), text).unwrap();
    }
    input
}

fn book() -> Vec<String> {
    let words = [
        "accumulate", "barrier", "checkpoint", "distributed", "elsewhere",
        "fragment", "gathering", "heartbeat", "idempotent", "journal",
        "keyspace", "listener", "mapreduce", "network", "ordering",
    ];
    (0..6)
        .map(|f| {
            (0..200)
                .map(|i| words[(i * 7 + f * 3) % words.len()])
                .collect::<Vec<_>>()
                .join(if f % 2 == 0 { " " } else { "\n" })
        })
        .collect()
}

fn merged(path: &Path) -> BTreeMap<String, String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| {
            let (k, v) = l.split_once(": ").unwrap();
            (k.to_string(), v.to_string())
        })
        .collect()
}

async fn run_sequential(dir: &Path, input: &Path, name: &str, n_reduce: usize) -> JobReport {
    let job = Job::from_dir(name, input, n_reduce).unwrap();
    Master::sequential(job, Workspace::new(dir.join(name)), wc::app())
        .wait()
        .await
        .unwrap()
}

fn spawn_worker(master: &str, workspace: &Workspace, nrpc: Option<usize>) -> JoinHandle<usize> {
    let worker = Worker {
        address: "127.0.0.1:0".into(),
        master: master.to_owned(),
        workspace: workspace.clone(),
        app: wc::app(),
        nrpc,
        timeout: TIMEOUT,
    };
    tokio::spawn(async move { worker.launch().await.unwrap() })
}

fn config() -> MasterConfig {
    MasterConfig {
        timeout: TIMEOUT,
        retry: RetryPolicy::unlimited(),
    }
}

#[tokio::test]
async fn test_sequential_word_count() {
    let _ = pretty_env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let input = write_inputs(
        dir.path(),
        &[
            "distributed a distributed b distributed",
            "x distributed y distributed",
        ],
    );

    let report = run_sequential(dir.path(), &input, "wcnt_seq", 3).await;
    assert_eq!(report.stats, vec![2 + 3]);
    assert_eq!(
        report.output,
        dir.path().join("wcnt_seq").join("mrtmp.wcnt_seq")
    );

    let out = merged(&report.output);
    assert_eq!(out.get("distributed").map(String::as_str), Some("5"));
    assert!(out.keys().all(|k| k.len() >= 8), "{:?}", out);

    // The word lands in exactly one reduce output.
    let ws = Workspace::new(dir.path().join("wcnt_seq"));
    let mut found = 0;
    for r in 0..3 {
        for kv in open_records(&ws.reduce_output_path("wcnt_seq", r)).unwrap() {
            let kv = kv.unwrap();
            trace!("reduce #{}: {:?}", r, kv);
            if kv.key == "distributed" {
                found += 1;
            }
        }
    }
    assert_eq!(found, 1);
}

#[tokio::test]
async fn test_invalid_utf8_input_is_counted() {
    let _ = pretty_env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input");
    fs::create_dir(&input).unwrap();
    fs::write(input.join("0.txt"), b"distributed distributed \xff\xfe").unwrap();

    let report = run_sequential(dir.path(), &input, "lossy", 2).await;
    let out = merged(&report.output);
    assert_eq!(out.get("distributed").map(String::as_str), Some("2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distributed_matches_sequential() {
    let _ = pretty_env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let texts = book();
    let input = write_inputs(dir.path(), &texts.iter().map(String::as_str).collect::<Vec<_>>());

    let expected = run_sequential(dir.path(), &input, "seq", 4).await;

    let ws = Workspace::new(dir.path().join("dist"));
    let job = Job::from_dir("dist", &input, 4).unwrap();
    let master = Master::distributed(job, ws.clone(), "127.0.0.1:0", config())
        .await
        .unwrap();
    let workers: Vec<_> = (0..3)
        .map(|_| spawn_worker(master.address(), &ws, None))
        .collect();

    let report = master.wait().await.unwrap();
    assert_eq!(
        fs::read_to_string(&report.output).unwrap(),
        fs::read_to_string(&expected.output).unwrap()
    );
    assert_eq!(report.stats.len(), 3);
    assert_eq!(report.stats.iter().sum::<usize>(), texts.len() + 4);

    let mut ran = 0;
    for w in workers {
        ran += w.await.unwrap();
    }
    assert_eq!(ran, texts.len() + 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_failure() {
    let _ = pretty_env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let texts = book();
    let input = write_inputs(dir.path(), &texts.iter().map(String::as_str).collect::<Vec<_>>());

    let expected = run_sequential(dir.path(), &input, "seq", 3).await;

    let ws = Workspace::new(dir.path().join("fail"));
    let job = Job::from_dir("fail", &input, 3).unwrap();
    let master = Master::distributed(job, ws.clone(), "127.0.0.1:0", config())
        .await
        .unwrap();

    // Registers first, then refuses every connection.
    let broken = spawn_worker(master.address(), &ws, Some(0));
    assert_eq!(broken.await.unwrap(), 0);
    let healthy: Vec<_> = (0..2)
        .map(|_| spawn_worker(master.address(), &ws, None))
        .collect();

    let report = master.wait().await.unwrap();
    assert_eq!(merged(&report.output), merged(&expected.output));

    // The broken worker cannot be shut down and is left out.
    assert_eq!(report.stats.len(), 2);
    assert_eq!(report.stats.iter().sum::<usize>(), texts.len() + 3);
    for w in healthy {
        w.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_cap_fails_job() {
    let _ = pretty_env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let input = write_inputs(
        dir.path(),
        &["distributed systems", "partition tolerance", "eventual consistency"],
    );

    let ws = Workspace::new(dir.path().join("capped"));
    let job = Job::from_dir("capped", &input, 1).unwrap();
    let master = Master::distributed(
        job,
        ws.clone(),
        "127.0.0.1:0",
        MasterConfig {
            timeout: TIMEOUT,
            retry: RetryPolicy {
                max_attempts: Some(1),
            },
        },
    )
    .await
    .unwrap();

    // The only worker dies on its first task; the others wait in vain.
    spawn_worker(master.address(), &ws, Some(0)).await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(30), master.wait())
        .await
        .expect("job hung after a task gave up")
        .unwrap_err();
    assert!(err.to_string().contains("failed 1 times"), "{:#}", err);
}
