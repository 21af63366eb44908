use std::collections::HashSet;
use std::sync::Arc;

use volley_config::{DependsOnDef, ExecutorDef, FlowDoc, FlowStepDef, ValueDef};
use volley_event::Event;

use crate::error::FlowError;

/// A validated flow: the top-level concurrency policy and its nodes.
#[derive(Debug, Clone)]
pub struct Flow {
  pub concurrency: i64,
  pub nodes: Vec<Arc<FlowNode>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowNode {
  pub id: String,
  pub depends_on: Vec<Dependency>,
  pub kind: NodeKind,
  /// Number of executors materialized per run, at least 1.
  pub count: usize,
  pub mkdir: bool,
  pub values: Vec<Binding>,
  pub thread_only_values: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
  LocalFile {
    file: String,
  },
  NestedFlow {
    concurrency: i64,
    children: Vec<Arc<FlowNode>>,
  },
  RemoteCommand {
    file: String,
    executors: Vec<RemoteExecutor>,
  },
}

impl NodeKind {
  pub fn name(&self) -> &'static str {
    match self {
      NodeKind::LocalFile { .. } => "file",
      NodeKind::NestedFlow { .. } => "flow",
      NodeKind::RemoteCommand { .. } => "slaveCmd",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
  pub flow_id: String,
  pub event: Event,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
  pub key: String,
  pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteExecutor {
  pub slave_id: String,
  /// Output subdirectory on the master; `None` discards worker records.
  pub output_path: Option<String>,
  pub inherit_values: bool,
  pub additional_values: Vec<Binding>,
  pub additional_thread_only_values: Vec<Binding>,
}

impl Flow {
  /// Validate a flow document. Ids must be unique across the whole tree,
  /// including nested flows.
  pub fn from_doc(doc: &FlowDoc) -> Result<Self, FlowError> {
    let mut seen = HashSet::new();
    Ok(Self {
      concurrency: doc.concurrency.unwrap_or(0),
      nodes: validate_steps(&doc.flows, &mut seen)?,
    })
  }

  /// Every node in the tree, depth first.
  pub fn walk(&self) -> Vec<&Arc<FlowNode>> {
    let mut out = Vec::new();
    collect(&self.nodes, &mut out);
    out
  }
}

fn collect<'a>(nodes: &'a [Arc<FlowNode>], out: &mut Vec<&'a Arc<FlowNode>>) {
  for node in nodes {
    out.push(node);
    if let NodeKind::NestedFlow { children, .. } = &node.kind {
      collect(children, out);
    }
  }
}

fn validate_steps(
  steps: &[FlowStepDef],
  seen: &mut HashSet<String>,
) -> Result<Vec<Arc<FlowNode>>, FlowError> {
  steps
    .iter()
    .enumerate()
    .map(|(index, step)| validate_step(index, step, seen).map(Arc::new))
    .collect()
}

fn validate_step(
  index: usize,
  step: &FlowStepDef,
  seen: &mut HashSet<String>,
) -> Result<FlowNode, FlowError> {
  let id = step.id.clone().ok_or_else(|| FlowError::MissingField {
    node: format!("#{index}"),
    field: "id",
  })?;
  if !seen.insert(id.clone()) {
    return Err(FlowError::DuplicateId(id));
  }

  let kind_name = step.kind.as_deref().ok_or_else(|| missing(&id, "type"))?;
  let (kind, count) = match kind_name {
    "file" => {
      let file = step.file.clone().ok_or_else(|| missing(&id, "file"))?;
      let count = step.count.unwrap_or(1);
      if count < 0 {
        return Err(FlowError::InvalidCount { id, count });
      }
      (NodeKind::LocalFile { file }, count)
    }
    "flow" => {
      let children = validate_steps(&step.flows, seen)?;
      let kind = NodeKind::NestedFlow {
        concurrency: step.concurrency.unwrap_or(0),
        children,
      };
      (kind, 1)
    }
    "slaveCmd" => {
      let file = step.file.clone().ok_or_else(|| missing(&id, "file"))?;
      let executors = step
        .executors
        .iter()
        .map(|def| validate_executor(&id, def))
        .collect::<Result<Vec<_>, _>>()?;
      (NodeKind::RemoteCommand { file, executors }, 1)
    }
    other => {
      return Err(FlowError::InvalidKind {
        id,
        kind: other.to_string(),
      });
    }
  };

  let depends_on = step
    .depends_on
    .iter()
    .map(|dep| validate_dependency(&id, dep))
    .collect::<Result<Vec<_>, _>>()?;

  Ok(FlowNode {
    values: validate_bindings(&id, &step.values)?,
    thread_only_values: validate_bindings(&id, &step.thread_only_values)?,
    id,
    depends_on,
    kind,
    // A count of zero still runs once.
    count: usize::try_from(count).unwrap_or(1).max(1),
    mkdir: step.mkdir,
  })
}

fn validate_dependency(id: &str, dep: &DependsOnDef) -> Result<Dependency, FlowError> {
  let flow_id = dep.flow.clone().ok_or_else(|| missing(id, "depends_on.flow"))?;
  let event = dep.event.clone().ok_or_else(|| missing(id, "depends_on.event"))?;
  Ok(Dependency {
    flow_id,
    event: Event::from(event),
  })
}

fn validate_bindings(id: &str, defs: &[ValueDef]) -> Result<Vec<Binding>, FlowError> {
  defs
    .iter()
    .map(|def| {
      Ok(Binding {
        key: def.key.clone().ok_or_else(|| missing(id, "values.key"))?,
        value: def.value.clone().ok_or_else(|| missing(id, "values.value"))?,
      })
    })
    .collect()
}

fn validate_executor(id: &str, def: &ExecutorDef) -> Result<RemoteExecutor, FlowError> {
  let slave_id = def
    .slave_id
    .clone()
    .ok_or_else(|| missing(id, "executors.slave_id"))?;
  let output_path = if def.output.enabled {
    Some(
      def
        .output
        .root_path
        .clone()
        .ok_or_else(|| missing(id, "executors.output.root_path"))?,
    )
  } else {
    None
  };

  Ok(RemoteExecutor {
    slave_id,
    output_path,
    inherit_values: def.inherit_values,
    additional_values: validate_bindings(id, &def.additional_values)?,
    additional_thread_only_values: validate_bindings(id, &def.additional_thread_only_values)?,
  })
}

fn missing(id: &str, field: &'static str) -> FlowError {
  FlowError::MissingField {
    node: id.to_string(),
    field,
  }
}
