use std::sync::Arc;

use crate::auth::AuthFactor;
use crate::http::RequestSender;
use crate::output::OutputFactor;
use crate::store::Store;
use crate::target::TargetFactor;
use crate::template::TmplFactor;

/// Everything a runner needs from its host, bundled so it can be swapped
/// wholesale for a worker-side remote set.
#[derive(Clone)]
pub struct Collaborators {
  pub store: Arc<dyn Store>,
  pub auth: Arc<dyn AuthFactor>,
  pub output: Arc<dyn OutputFactor>,
  pub target: Arc<dyn TargetFactor>,
  pub templates: Arc<dyn TmplFactor>,
  pub sender: Arc<dyn RequestSender>,
}
