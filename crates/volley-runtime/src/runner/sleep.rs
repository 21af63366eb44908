use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use volley_config::{SleepAfter, SleepDef, parse_duration};

use crate::error::RuntimeError;

/// Parsed sleep directives of one runner document.
#[derive(Debug, Default)]
pub(crate) struct Sleeps {
  values: Vec<(SleepAfter, Duration)>,
}

impl Sleeps {
  pub(crate) fn compile(def: &SleepDef) -> Result<Self, RuntimeError> {
    if !def.enabled {
      return Ok(Self::default());
    }
    let values = def
      .values
      .iter()
      .map(|value| Ok((value.after, parse_duration(&value.duration)?)))
      .collect::<Result<Vec<_>, RuntimeError>>()?;
    Ok(Self { values })
  }

  /// Sleep for every directive bound to `after`, in declared order.
  ///
  /// Returns early when `cancel` fires.
  pub(crate) async fn wait(&self, after: SleepAfter, cancel: &CancellationToken) {
    for (_, duration) in self.values.iter().filter(|(a, _)| *a == after) {
      debug!(after = ?after, duration_ms = duration.as_millis() as u64, "runner_sleep");
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(*duration) => {}
      }
    }
  }
}
