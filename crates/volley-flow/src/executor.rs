use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::node::FlowNode;

/// One repetition-indexed run instance of a flow node.
#[derive(Debug, Clone)]
pub struct Executor {
  pub node: Arc<FlowNode>,
  pub index: usize,
  pub output_root: PathBuf,
}

impl FlowNode {
  /// Materialize this node's executors under `root`.
  ///
  /// With `mkdir`, each executor gets `{root}/{id}` (single) or
  /// `{root}/{id}_{index}` (repeated); otherwise all share `root`.
  pub fn expand(self: &Arc<Self>, root: &Path) -> Vec<Executor> {
    (0..self.count)
      .map(|index| {
        let output_root = match (self.mkdir, self.count > 1) {
          (true, true) => root.join(format!("{}_{}", self.id, index)),
          (true, false) => root.join(&self.id),
          (false, _) => root.to_path_buf(),
        };
        Executor {
          node: Arc::clone(self),
          index,
          output_root,
        }
      })
      .collect()
  }
}
