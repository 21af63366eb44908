use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use serde_json::Value;
use volley_config::{AppConfig, DocumentFormat, EncryptDef, FlowDoc, load_document, render_document};
use volley_flow::Flow;
use volley_host::{
  Collaborators, ConfigAuthFactor, ConfigTargetFactor, CsvOutputFactor, FsTemplates, ImportRequest,
  MemoryStore, ReqwestSender, Store, StoreEntry, clear_outputs,
};
use volley_master::SessionManager;
use volley_runtime::{Runtime, ValueStore};
use volley_wire::EncrypterRegistry;
use volley_worker::{WorkerListener, WorkerServer};

const DEFAULT_CONFIG: &str = "volley.yaml";

/// Volley - distributed load testing driven by flow files
#[derive(Parser)]
#[command(name = "volley")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Application config (default: ./volley.yaml, then the user config dir)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a flow file on this machine as the master
  Run {
    /// Path to the flow file (YAML or JSON)
    flow_file: PathBuf,
  },

  /// Serve commands from a master
  Worker {
    /// Listen address, overriding `worker.address` from the config
    #[arg(long)]
    address: Option<String>,
  },

  /// Inspect and edit the persisted store snapshot
  Store {
    #[command(subcommand)]
    command: StoreCommands,
  },

  /// Manage files written by runs
  Output {
    #[command(subcommand)]
    command: OutputCommands,
  },

  /// Print the resolved configuration
  Config {
    /// Print JSON instead of YAML
    #[arg(long)]
    json: bool,
  },
}

#[derive(Subcommand)]
enum StoreCommands {
  /// List buckets with their entry counts
  List,

  /// Remove every entry, or only those of one bucket
  Clear {
    #[arg(short, long)]
    bucket: Option<String>,
  },

  /// Work with single entries
  #[command(alias = "obj")]
  Object {
    #[command(subcommand)]
    command: ObjectCommands,
  },
}

#[derive(Subcommand)]
enum ObjectCommands {
  /// List the keys of a bucket
  List {
    #[arg(short, long)]
    bucket: String,
  },

  /// Print one value as JSON
  Get {
    #[arg(short, long)]
    bucket: String,
    key: String,
    /// Encrypter id the value was stored with
    #[arg(short, long)]
    encrypt: Option<String>,
  },

  /// Store a value; text that is not valid JSON is kept as a string
  Put {
    #[arg(short, long)]
    bucket: String,
    key: String,
    value: String,
    /// Encrypter id to store the value with
    #[arg(short, long)]
    encrypt: Option<String>,
  },

  /// Remove one value
  Delete {
    #[arg(short, long)]
    bucket: String,
    key: String,
  },
}

#[derive(Subcommand)]
enum OutputCommands {
  /// Remove output roots under `output.base_path`
  Clear {
    /// Output roots to remove
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    roots: Vec<String>,
    /// Remove everything under the output directory
    #[arg(short = 'A', long)]
    all: bool,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let config = load_config(cli.config.as_deref())?;

  match cli.command {
    Some(Commands::Run { flow_file }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_flow(config, flow_file))?;
    }
    Some(Commands::Worker { address }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_worker(config, address))?;
    }
    Some(Commands::Store { command }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_store(config, command))?;
    }
    Some(Commands::Output {
      command: OutputCommands::Clear { roots, all },
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      let roots = if all { Vec::new() } else { roots };
      let removed = rt
        .block_on(clear_outputs(&config.output.base_path, &roots))
        .context("failed to clear outputs")?;
      println!("removed {removed} output entries");
    }
    Some(Commands::Config { json }) => {
      let format = if json { DocumentFormat::Json } else { DocumentFormat::Yaml };
      print!("{}", render_document(&config, format)?);
    }
    None => {
      println!("volley - use --help to see available commands");
    }
  }

  Ok(())
}

/// An explicit `--config` must exist; otherwise the first default found is
/// used, falling back to built-in defaults.
fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
  if let Some(path) = explicit {
    return load_document(path)
      .with_context(|| format!("failed to load config: {}", path.display()));
  }

  let candidates = std::iter::once(PathBuf::from(DEFAULT_CONFIG))
    .chain(dirs::config_dir().map(|dir| dir.join("volley").join(DEFAULT_CONFIG)));
  for path in candidates {
    if path.is_file() {
      return load_document(&path)
        .with_context(|| format!("failed to load config: {}", path.display()));
    }
  }
  Ok(AppConfig::default())
}

/// Cancel `cancel` on Ctrl-C.
fn cancel_on_interrupt(cancel: &CancellationToken) {
  let cancel = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupt_received");
      cancel.cancel();
    }
  });
}

async fn run_flow(config: AppConfig, flow_file: PathBuf) -> Result<()> {
  let doc: FlowDoc = load_document(&flow_file)
    .with_context(|| format!("failed to load flow file: {}", flow_file.display()))?;
  let flow = Flow::from_doc(&doc)
    .with_context(|| format!("invalid flow file: {}", flow_file.display()))?;

  let encrypters =
    EncrypterRegistry::from_config(&config.encrypters).context("invalid encrypter config")?;
  let store = Arc::new(match &config.store.path {
    Some(path) => MemoryStore::load(path, encrypters.clone())
      .await
      .with_context(|| format!("failed to load store: {}", path.display()))?,
    None => MemoryStore::new(encrypters.clone()),
  });

  let output_root = std::path::absolute(&config.output.base_path)
    .context("failed to resolve output directory")?;
  tokio::fs::create_dir_all(&output_root)
    .await
    .with_context(|| format!("failed to create output directory: {}", output_root.display()))?;

  let cancel = CancellationToken::new();
  cancel_on_interrupt(&cancel);

  let sessions = Arc::new(SessionManager::new(
    config.environment.clone(),
    encrypters,
    cancel.clone(),
  ));
  let runtime = Runtime::new(Collaborators {
    store: store.clone(),
    auth: Arc::new(ConfigAuthFactor::new(
      config.auths.clone(),
      config.default_auth.clone(),
    )),
    output: Arc::new(CsvOutputFactor::new(&output_root)),
    target: Arc::new(ConfigTargetFactor::new(config.targets.clone())),
    templates: Arc::new(FsTemplates::new(config.loader.base_path.clone())),
    sender: Arc::new(ReqwestSender::new()),
  })
  .with_sessions(sessions);

  info!(flow = %flow_file.display(), nodes = flow.nodes.len(), output = %output_root.display(), "run_started");
  let result = runtime
    .run_flow(&flow, Arc::new(ValueStore::new()), &output_root, cancel)
    .await;
  let shutdown = runtime.shutdown().await;

  if let Some(path) = &config.store.path {
    store
      .save(path)
      .await
      .with_context(|| format!("failed to save store: {}", path.display()))?;
  }

  result.context("flow run failed")?;
  shutdown.context("worker shutdown failed")?;
  info!("run_completed");
  Ok(())
}

async fn run_worker(config: AppConfig, address: Option<String>) -> Result<()> {
  let address = address.unwrap_or_else(|| config.worker.address.clone());
  let encrypters =
    EncrypterRegistry::from_config(&config.encrypters).context("invalid encrypter config")?;
  let listener = WorkerListener::bind(
    &address,
    config.worker.tls.as_ref(),
    &config.worker.encrypt,
    &encrypters,
  )
  .await
  .with_context(|| format!("failed to start worker on {address}"))?;

  let server = Arc::new(WorkerServer::new(
    config.environment.clone(),
    Arc::new(ReqwestSender::new()),
  ));
  let cancel = CancellationToken::new();
  cancel_on_interrupt(&cancel);

  info!(address = %listener.local_addr()?, environment = %config.environment, "worker_listening");
  listener
    .run(server, cancel)
    .await
    .context("worker stopped with an error")
}

fn encrypt_with(id: Option<String>) -> EncryptDef {
  EncryptDef {
    enabled: id.is_some(),
    encrypt_id: id,
  }
}

/// Store maintenance works on the snapshot at `store.path` and writes it back
/// after any change.
async fn run_store(config: AppConfig, command: StoreCommands) -> Result<()> {
  let Some(path) = config.store.path.as_deref() else {
    bail!("store.path is not configured");
  };
  let encrypters =
    EncrypterRegistry::from_config(&config.encrypters).context("invalid encrypter config")?;
  let store = MemoryStore::load(path, encrypters)
    .await
    .with_context(|| format!("failed to load store: {}", path.display()))?;

  let changed = match command {
    StoreCommands::List => {
      for (bucket, count) in store.buckets() {
        println!("{bucket}\t{count}");
      }
      false
    }
    StoreCommands::Clear { bucket } => {
      let removed = store.clear(bucket.as_deref());
      println!("removed {removed} entries");
      removed > 0
    }
    StoreCommands::Object {
      command: ObjectCommands::List { bucket },
    } => {
      for key in store.keys(&bucket) {
        println!("{key}");
      }
      false
    }
    StoreCommands::Object {
      command: ObjectCommands::Get {
        bucket,
        key,
        encrypt,
      },
    } => {
      let imported = store
        .import(vec![ImportRequest {
          bucket_id: bucket,
          store_key: key,
          encrypt: encrypt_with(encrypt),
        }])
        .await?;
      for value in imported {
        println!("{}", serde_json::to_string_pretty(&value.value)?);
      }
      false
    }
    StoreCommands::Object {
      command: ObjectCommands::Put {
        bucket,
        key,
        value,
        encrypt,
      },
    } => {
      let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
      store
        .store(vec![StoreEntry {
          bucket_id: bucket,
          store_key: key,
          value,
          encrypt: encrypt_with(encrypt),
        }])
        .await?;
      true
    }
    StoreCommands::Object {
      command: ObjectCommands::Delete { bucket, key },
    } => {
      if !store.remove(&bucket, &key) {
        bail!("no value at {bucket}/{key}");
      }
      true
    }
  };

  if changed {
    store
      .save(path)
      .await
      .with_context(|| format!("failed to save store: {}", path.display()))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_store_object_arguments() {
    let cli = Cli::try_parse_from([
      "volley", "store", "obj", "put", "-b", "users", "token", "{\"n\":1}", "-e", "wire",
    ])
    .unwrap();
    let Some(Commands::Store {
      command: StoreCommands::Object {
        command: ObjectCommands::Put {
          bucket,
          key,
          value,
          encrypt,
        },
      },
    }) = cli.command
    else {
      panic!("expected store object put");
    };
    assert_eq!((bucket.as_str(), key.as_str()), ("users", "token"));
    assert_eq!(value, "{\"n\":1}");
    assert_eq!(encrypt.as_deref(), Some("wire"));

    assert!(Cli::try_parse_from(["volley", "store", "object", "get", "token"]).is_err());
  }

  #[test]
  fn test_output_clear_needs_roots_or_all() {
    assert!(Cli::try_parse_from(["volley", "output", "clear"]).is_err());
    assert!(Cli::try_parse_from(["volley", "output", "clear", "-A", "login_0"]).is_err());
    assert!(Cli::try_parse_from(["volley", "output", "clear", "--all"]).is_ok());
    assert!(Cli::try_parse_from(["volley", "output", "clear", "login_0", "login_1"]).is_ok());
  }

  #[test]
  fn test_encrypt_with() {
    assert_eq!(encrypt_with(None), EncryptDef::default());
    assert_eq!(encrypt_with(Some("k".to_string())).active_id(), Some("k"));
  }
}
