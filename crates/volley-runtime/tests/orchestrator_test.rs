//! Flow orchestration scenarios driven through StoreValue runners.
//!
//! Every runner file stores one entry whose bucket is the executor's
//! `label` thread value; the recording store tracks when each store call ran
//! and how many were in progress at once.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use volley_config::{DocumentFormat, FlowDoc, parse_document};
use volley_flow::{Flow, FlowError};
use volley_host::{
  Collaborators, ConfigAuthFactor, ConfigTargetFactor, CsvOutputFactor, HostError, ImportRequest,
  ImportedValue, ReqwestSender, Store, StoreEntry, TmplFactor,
};
use volley_runtime::{Runtime, RuntimeError, ValueStore};

const STORE_RUNNER: &str = r#"
kind: StoreValue
data:
  - bucket_id: "{{ ThreadValues.label }}"
    key: k
    value: {{ Dynamic.CallCount }}
"#;

const MEMORY_RUNNER: &str = r#"
kind: MemoryValue
data:
  - key: greeting
    value: "hi {{ Values.name }}"
"#;

const GROUP_RUNNER: &str = r#"
kind: Flow
step:
  flows:
    - id: grouped
      type: file
      file: store.yaml
      thread_only_values: [{ key: label, value: grouped }]
"#;

struct Templates(HashMap<String, String>);

#[async_trait]
impl TmplFactor for Templates {
  async fn factorize(&self, path: &str) -> Result<String, HostError> {
    self.0.get(path).cloned().ok_or_else(|| HostError::NotFound {
      kind: "template",
      id: path.to_string(),
    })
  }
}

#[derive(Debug, Clone)]
struct Span {
  label: String,
  value: Value,
  start: Instant,
  end: Instant,
}

struct RecordingStore {
  hold: Duration,
  active: AtomicUsize,
  max_active: AtomicUsize,
  spans: Mutex<Vec<Span>>,
}

impl RecordingStore {
  fn new(hold: Duration) -> Arc<Self> {
    Arc::new(Self {
      hold,
      active: AtomicUsize::new(0),
      max_active: AtomicUsize::new(0),
      spans: Mutex::new(Vec::new()),
    })
  }

  fn spans(&self) -> Vec<Span> {
    self.spans.lock().unwrap().clone()
  }

  fn span(&self, label: &str) -> Span {
    self
      .spans()
      .into_iter()
      .find(|span| span.label == label)
      .unwrap_or_else(|| panic!("no span for {label}"))
  }
}

struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

#[async_trait]
impl Store for RecordingStore {
  async fn store(&self, entries: Vec<StoreEntry>) -> Result<(), HostError> {
    let entry = entries.into_iter().next().unwrap();
    if entry.bucket_id == "fail" {
      return Err(HostError::Remote("store rejected".to_string()));
    }

    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    let _active = Active(&self.active);
    self.max_active.fetch_max(now, Ordering::SeqCst);

    let start = Instant::now();
    tokio::time::sleep(self.hold).await;
    self.spans.lock().unwrap().push(Span {
      label: entry.bucket_id,
      value: entry.value,
      start,
      end: Instant::now(),
    });
    Ok(())
  }

  async fn import(&self, _requests: Vec<ImportRequest>) -> Result<Vec<ImportedValue>, HostError> {
    Ok(Vec::new())
  }
}

fn runtime(store: Arc<RecordingStore>, output: &Path) -> Runtime {
  let templates = HashMap::from([
    ("store.yaml".to_string(), STORE_RUNNER.to_string()),
    ("memory.yaml".to_string(), MEMORY_RUNNER.to_string()),
    ("group.yaml".to_string(), GROUP_RUNNER.to_string()),
  ]);
  Runtime::new(Collaborators {
    store,
    auth: Arc::new(ConfigAuthFactor::new(HashMap::new(), None)),
    output: Arc::new(CsvOutputFactor::new(output)),
    target: Arc::new(ConfigTargetFactor::new(HashMap::new())),
    templates: Arc::new(Templates(templates)),
    sender: Arc::new(ReqwestSender::new()),
  })
}

fn flow(yaml: &str) -> Flow {
  let doc: FlowDoc = parse_document(yaml, DocumentFormat::Yaml, "flow.yaml").unwrap();
  Flow::from_doc(&doc).unwrap()
}

async fn run(
  store: Arc<RecordingStore>,
  flow: &Flow,
  cancel: CancellationToken,
) -> Result<(), RuntimeError> {
  let dir = tempfile::tempdir().unwrap();
  runtime(store, dir.path())
    .run_flow(flow, Arc::new(ValueStore::new()), dir.path(), cancel)
    .await
}

#[tokio::test]
async fn test_positive_concurrency_bounds_executors() {
  let store = RecordingStore::new(Duration::from_millis(50));
  let flow = flow(
    r#"
concurrency: 2
flows:
  - id: a
    type: file
    file: store.yaml
    count: 6
    thread_only_values: [{ key: label, value: a }]
"#,
  );

  run(store.clone(), &flow, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(store.spans().len(), 6);
  assert_eq!(store.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_negative_concurrency_runs_whole_cohort() {
  let store = RecordingStore::new(Duration::from_millis(100));
  let flow = flow(
    r#"
concurrency: -1
flows:
  - id: a
    type: file
    file: store.yaml
    count: 4
    thread_only_values: [{ key: label, value: a }]
"#,
  );

  run(store.clone(), &flow, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(store.max_active.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_sequential_runs_in_declared_order() {
  let store = RecordingStore::new(Duration::from_millis(5));
  let flow = flow(
    r#"
flows:
  - id: c
    type: file
    file: store.yaml
    thread_only_values: [{ key: label, value: c }]
  - id: a
    type: file
    file: store.yaml
    thread_only_values: [{ key: label, value: a }]
  - id: b
    type: file
    file: store.yaml
    thread_only_values: [{ key: label, value: b }]
"#,
  );

  run(store.clone(), &flow, CancellationToken::new())
    .await
    .unwrap();

  let labels: Vec<String> = store.spans().into_iter().map(|s| s.label).collect();
  assert_eq!(labels, vec!["c", "a", "b"]);
  assert_eq!(store.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dependent_waits_for_terminated() {
  let flow = flow(
    r#"
concurrency: -1
flows:
  - id: b
    type: file
    file: store.yaml
    depends_on: [{ flow: a, event: "sys:terminated" }]
    thread_only_values: [{ key: label, value: b }]
  - id: a
    type: file
    file: store.yaml
    thread_only_values: [{ key: label, value: a }]
"#,
  );

  for _ in 0..100 {
    let store = RecordingStore::new(Duration::from_millis(2));
    run(store.clone(), &flow, CancellationToken::new())
      .await
      .unwrap();
    assert!(store.span("b").start >= store.span("a").end);
  }
}

#[tokio::test]
async fn test_dependent_on_start_overlaps() {
  let store = RecordingStore::new(Duration::from_millis(200));
  let flow = flow(
    r#"
concurrency: -1
flows:
  - id: a
    type: file
    file: store.yaml
    thread_only_values: [{ key: label, value: a }]
  - id: b
    type: file
    file: store.yaml
    depends_on: [{ flow: a, event: "sys:start" }]
    thread_only_values: [{ key: label, value: b }]
"#,
  );

  run(store.clone(), &flow, CancellationToken::new())
    .await
    .unwrap();

  assert!(store.span("b").start < store.span("a").end);
  assert_eq!(store.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_first_error_cancels_cohort() {
  let store = RecordingStore::new(Duration::from_secs(30));
  let flow = flow(
    r#"
concurrency: -1
flows:
  - id: slow
    type: file
    file: store.yaml
    count: 3
    thread_only_values: [{ key: label, value: slow }]
  - id: bad
    type: file
    file: store.yaml
    thread_only_values: [{ key: label, value: fail }]
"#,
  );

  let result = tokio::time::timeout(
    Duration::from_secs(5),
    run(store.clone(), &flow, CancellationToken::new()),
  )
  .await
  .expect("cohort was not cancelled");

  match result {
    Err(RuntimeError::Node { node_id, source }) => {
      assert_eq!(node_id, "bad");
      assert!(matches!(*source, RuntimeError::Host(HostError::Remote(_))));
    }
    other => panic!("unexpected result: {other:?}"),
  }
  assert!(store.spans().is_empty());
  assert_eq!(store.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_ends_run_cleanly() {
  let store = RecordingStore::new(Duration::from_secs(30));
  let flow = flow(
    r#"
concurrency: 2
flows:
  - id: a
    type: file
    file: store.yaml
    count: 4
    thread_only_values: [{ key: label, value: a }]
"#,
  );

  let metrics = tokio::runtime::Handle::current().metrics();
  let baseline = metrics.num_alive_tasks();

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  let timer = tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.cancel();
  });

  let result = tokio::time::timeout(Duration::from_secs(5), run(store.clone(), &flow, cancel))
    .await
    .expect("run ignored cancellation");
  assert!(result.is_ok());
  assert_eq!(store.active.load(Ordering::SeqCst), 0);

  timer.await.unwrap();
  tokio::time::timeout(Duration::from_secs(1), async {
    while metrics.num_alive_tasks() > baseline {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("executor tasks outlived the run");
}

#[tokio::test]
async fn test_unknown_dependency_fails_before_running() {
  let store = RecordingStore::new(Duration::ZERO);
  let flow = flow(
    r#"
flows:
  - id: a
    type: file
    file: store.yaml
    depends_on: [{ flow: ghost, event: "sys:terminated" }]
    thread_only_values: [{ key: label, value: a }]
"#,
  );

  let err = run(store.clone(), &flow, CancellationToken::new())
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    RuntimeError::Flow(FlowError::UnknownDependency { ref id, ref dependency })
      if id == "a" && dependency == "ghost"
  ));
  assert!(store.spans().is_empty());
}

#[tokio::test]
async fn test_nested_flow_increments_call_count() {
  let store = RecordingStore::new(Duration::ZERO);
  let flow = flow(
    r#"
flows:
  - id: top
    type: file
    file: store.yaml
    thread_only_values: [{ key: label, value: top }]
  - id: group
    type: flow
    concurrency: -1
    flows:
      - id: inner
        type: file
        file: store.yaml
        thread_only_values: [{ key: label, value: inner }]
"#,
  );

  run(store.clone(), &flow, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(store.span("top").value, json!(1));
  assert_eq!(store.span("inner").value, json!(2));
}

#[tokio::test]
async fn test_flow_runner_keeps_call_count() {
  let store = RecordingStore::new(Duration::ZERO);
  let flow = flow(
    r#"
flows:
  - id: outer
    type: file
    file: group.yaml
"#,
  );

  run(store.clone(), &flow, CancellationToken::new())
    .await
    .unwrap();

  // The file runs at call count 1; its children run one level deeper.
  assert_eq!(store.span("grouped").value, json!(2));
}

#[tokio::test]
async fn test_declared_values_visible_to_earlier_siblings() {
  let store = RecordingStore::new(Duration::ZERO);
  let dir = tempfile::tempdir().unwrap();
  let flow = flow(
    r#"
flows:
  - id: greet
    type: file
    file: memory.yaml
  - id: later
    type: file
    file: store.yaml
    count: 3
    values: [{ key: name, value: ada }]
    thread_only_values: [{ key: label, value: later }]
"#,
  );

  let values = Arc::new(ValueStore::new());
  runtime(store.clone(), dir.path())
    .run_flow(&flow, values.clone(), dir.path(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(values.get("greeting"), Some(json!("hi ada")));
  assert_eq!(store.spans().len(), 3);
}

/// A random DAG where node `i` may depend on any node `j < i`, declared in
/// reverse so dependents usually come first.
fn random_dag(rng: &mut StdRng, size: usize) -> (String, Vec<usize>, Vec<Vec<usize>>) {
  let mut counts = Vec::with_capacity(size);
  let mut edges = Vec::with_capacity(size);
  for i in 0..size {
    counts.push(rng.random_range(1..=3));
    edges.push((0..i).filter(|_| rng.random_bool(0.3)).collect::<Vec<_>>());
  }

  let mut yaml = String::from("concurrency: -1\nflows:\n");
  for i in (0..size).rev() {
    let depends: Vec<String> = edges[i]
      .iter()
      .map(|j| format!("{{ flow: n{j}, event: \"sys:terminated\" }}"))
      .collect();
    yaml.push_str(&format!(
      "  - id: n{i}\n    type: file\n    file: store.yaml\n    count: {}\n    depends_on: [{}]\n    thread_only_values: [{{ key: label, value: n{i} }}]\n",
      counts[i],
      depends.join(", "),
    ));
  }
  (yaml, counts, edges)
}

#[tokio::test]
async fn test_random_dags_respect_every_edge() {
  for seed in 0..20 {
    let mut rng = StdRng::seed_from_u64(seed);
    let (yaml, counts, edges) = random_dag(&mut rng, 8);
    let store = RecordingStore::new(Duration::from_millis(2));
    run(store.clone(), &flow(&yaml), CancellationToken::new())
      .await
      .unwrap();

    let spans = store.spans();
    let of = |i: usize| -> Vec<Span> {
      let label = format!("n{i}");
      spans.iter().filter(|s| s.label == label).cloned().collect()
    };
    for (i, deps) in edges.iter().enumerate() {
      let runs = of(i);
      assert_eq!(runs.len(), counts[i], "seed {seed}: n{i} ran {} times", runs.len());
      for &j in deps {
        // The latch opens on the first terminated executor of the dependency.
        let first_end = of(j).iter().map(|s| s.end).min().unwrap();
        for span in &runs {
          assert!(span.start >= first_end, "seed {seed}: n{i} started before n{j} terminated");
        }
      }
    }
  }
}

#[tokio::test]
async fn test_mkdir_and_global_values() {
  let store = RecordingStore::new(Duration::ZERO);
  let dir = tempfile::tempdir().unwrap();
  let flow = flow(
    r#"
flows:
  - id: a
    type: file
    file: store.yaml
    count: 2
    mkdir: true
    thread_only_values: [{ key: label, value: a }]
  - id: greet
    type: file
    file: memory.yaml
    mkdir: true
    values: [{ key: name, value: ada }]
"#,
  );

  let values = Arc::new(ValueStore::new());
  runtime(store.clone(), dir.path())
    .run_flow(&flow, values.clone(), dir.path(), CancellationToken::new())
    .await
    .unwrap();

  assert!(dir.path().join("a_0").is_dir());
  assert!(dir.path().join("a_1").is_dir());
  assert!(dir.path().join("greet").is_dir());
  assert_eq!(values.get("name"), Some(json!("ada")));
  assert_eq!(values.get("greeting"), Some(json!("hi ada")));
}
