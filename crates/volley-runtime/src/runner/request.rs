use std::sync::Arc;

use tracing::{info, warn};
use volley_config::{AuthRef, AuthValue, OneExecDoc, RequestDef};
use volley_host::{Collaborators, ExtractorEntry, HostError, HttpRequest, HttpResponse};

use crate::error::RuntimeError;

/// Where and as whom a request is sent. Resolved once per request definition.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
  pub base_url: String,
  pub auth: Option<AuthValue>,
}

impl Endpoint {
  pub(crate) async fn resolve(
    collaborators: &Collaborators,
    target_id: &str,
    auth: &AuthRef,
  ) -> Result<Self, RuntimeError> {
    let target = collaborators.target.factorize(target_id).await?;
    let auth = if auth.enabled {
      let credential = match &auth.auth_id {
        Some(auth_id) => collaborators.auth.factorize(auth_id, false).await?,
        None => collaborators.auth.factorize("", true).await?,
      };
      Some(credential)
    } else {
      None
    };
    Ok(Self {
      base_url: target.url,
      auth,
    })
  }

  /// Build the HTTP request for `def` against this endpoint.
  pub(crate) fn request(&self, def: &RequestDef) -> HttpRequest {
    let mut request = HttpRequest::new(def.method.clone(), join_url(&self.base_url, &def.endpoint));
    request.headers = sorted(&def.headers);
    request.query = sorted(&def.query);
    request.body = def.body.clone();
    if let Some(auth) = &self.auth {
      request = request.with_auth(auth.clone());
    }
    request
  }
}

fn sorted(map: &std::collections::HashMap<String, String>) -> Vec<(String, String)> {
  let mut pairs: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
  pairs.sort();
  pairs
}

fn join_url(base: &str, endpoint: &str) -> String {
  if endpoint.is_empty() {
    return base.to_string();
  }
  format!(
    "{}/{}",
    base.trim_end_matches('/'),
    endpoint.trim_start_matches('/')
  )
}

/// Header of the record a single request writes.
const ONE_EXEC_HEADER: [&str; 3] = ["StatusCode", "ResponseTime", "Body"];

/// Send one request, record it and persist extracted values.
pub(crate) async fn one_execute(
  collaborators: &Collaborators,
  file: &str,
  output_root: &str,
  doc: OneExecDoc,
) -> Result<(), RuntimeError> {
  let extractors = doc
    .store_data
    .iter()
    .map(|def| {
      let extractor = def
        .extractor
        .compile()
        .map_err(|source| RuntimeError::Condition {
          file: file.to_string(),
          source,
        })?;
      Ok(ExtractorEntry {
        bucket_id: def.bucket_id.clone(),
        store_key: def.store_key.clone(),
        extractor: Arc::new(extractor),
        encrypt: def.encrypt.clone(),
      })
    })
    .collect::<Result<Vec<_>, RuntimeError>>()?;

  let endpoint = Endpoint::resolve(collaborators, &doc.request.target_id, &doc.auth).await?;
  let response = collaborators
    .sender
    .send(endpoint.request(&doc.request))
    .await?;
  info!(
    target_id = %doc.request.target_id,
    status = response.status,
    elapsed_ms = response.elapsed.as_millis() as u64,
    "request_completed"
  );

  if doc.output.enabled {
    write_response(collaborators, output_root, &doc.output.ids, &response).await?;
  }

  if !extractors.is_empty() {
    let body = response
      .json()
      .map_err(|e| HostError::Encoding(e.to_string()))?;
    collaborators
      .store
      .store_with_extractor(&body, &extractors)
      .await?;
  }
  Ok(())
}

async fn write_response(
  collaborators: &Collaborators,
  output_root: &str,
  ids: &[String],
  response: &HttpResponse,
) -> Result<(), RuntimeError> {
  let record = vec![
    response.status.to_string(),
    response.elapsed.as_millis().to_string(),
    response.text(),
  ];
  let header: Vec<String> = ONE_EXEC_HEADER.iter().map(|s| s.to_string()).collect();
  for id in ids {
    let mut writer = collaborators.output.factorize(id, output_root).await?;
    writer.write(&header)?;
    writer.write(&record)?;
    if let Err(e) = writer.flush() {
      warn!(output_id = %id, error = %e, "output_flush_failed");
    }
  }
  Ok(())
}
