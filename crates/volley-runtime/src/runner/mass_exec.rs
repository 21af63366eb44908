//! The repeated-request loop behind `MassExecute` runners.
//!
//! Each request definition drives its own loop; all loops of one runner run
//! concurrently and the runner fails with the first loop that stops for a
//! reason its `success_break` does not accept.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use volley_config::{DocumentFormat, MassExecDoc, MassRequestDef, RequestDef, parse_document, parse_duration};
use volley_host::{Collaborators, HostError, HttpRequest, HttpResponse, RecordWriter, RequestSender};
use volley_matcher::{
  BodyConditions, IntConditions, IntScope, MatchError, TerminateReason, TerminateRules,
  TerminateType,
};

use super::Invocation;
use super::request::Endpoint;
use crate::error::RuntimeError;
use crate::render::{RenderContext, render};

/// Columns of every record a request loop writes.
const RECORD_HEADER: [&str; 6] = [
  "Count",
  "StatusCode",
  "ResponseTime",
  "Success",
  "SendDatetime",
  "ReceivedDatetime",
];

pub(crate) async fn run(
  collaborators: &Collaborators,
  invocation: &Invocation,
  template: &str,
  format: DocumentFormat,
  doc: MassExecDoc,
  cancel: &CancellationToken,
) -> Result<(), RuntimeError> {
  let run_id = Uuid::new_v4();
  let template: Arc<str> = Arc::from(template);
  let context = invocation.context();

  let mut loops = Vec::with_capacity(doc.requests.len());
  for (index, def) in doc.requests.iter().enumerate() {
    let output_root = Path::new(&invocation.output_root)
      .join(format!("{run_id}_{index}"))
      .to_string_lossy()
      .into_owned();
    let mut writers = Vec::new();
    if doc.output.enabled {
      for id in &doc.output.ids {
        writers.push(collaborators.output.factorize(id, &output_root).await?);
      }
    }

    let endpoint = Endpoint::resolve(collaborators, &def.request.target_id, &doc.auth).await?;
    let source = RequestSource {
      file: invocation.file.clone(),
      rerender: template.contains("RequestLoopCount"),
      template: template.clone(),
      format,
      context: context.clone(),
      index,
      initial: def.request.clone(),
    };
    loops.push(RequestLoop::compile(
      index,
      &invocation.file,
      def,
      source,
      endpoint,
      collaborators.sender.clone(),
      writers,
    )?);
  }

  futures::future::join_all(loops.into_iter().map(|l| l.run(cancel)))
    .await
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .map(|_| ())
}

/// Produces the request definition for each iteration.
///
/// Templates that reference `Dynamic.RequestLoopCount` are rendered again per
/// iteration; everything else reuses the definition rendered up front.
struct RequestSource {
  file: String,
  rerender: bool,
  template: Arc<str>,
  format: DocumentFormat,
  context: RenderContext,
  index: usize,
  initial: RequestDef,
}

impl RequestSource {
  fn definition(&self, count: u64) -> Result<RequestDef, RuntimeError> {
    if !self.rerender {
      return Ok(self.initial.clone());
    }
    let mut context = self.context.clone();
    context.dynamic.request_loop_count = Some(count);
    let rendered = render(&self.file, &self.template, &context)?;
    let doc: MassExecDoc = parse_document(&rendered, self.format, &self.file)?;
    doc
      .requests
      .into_iter()
      .nth(self.index)
      .map(|def| def.request)
      .ok_or_else(|| RuntimeError::InvalidRunner {
        file: self.file.clone(),
        message: format!("request {} disappeared after rendering", self.index),
      })
  }
}

struct Breaks {
  sys_error: bool,
  parse_error: bool,
  write_error: bool,
  status: IntConditions,
  body: BodyConditions,
}

struct Excludes {
  count: IntConditions,
  status: IntConditions,
  body: BodyConditions,
}

struct Outcome {
  count: u64,
  sent_at: DateTime<Utc>,
  received_at: DateTime<Utc>,
  result: Result<HttpResponse, HostError>,
}

struct RequestLoop {
  index: usize,
  source: RequestSource,
  endpoint: Endpoint,
  sender: Arc<dyn RequestSender>,
  interval: Duration,
  await_prev: bool,
  time_limit: Option<Duration>,
  count_limit: Option<u64>,
  breaks: Breaks,
  excludes: Excludes,
  success: TerminateRules,
  writers: Vec<Box<dyn RecordWriter>>,
}

impl RequestLoop {
  fn compile(
    index: usize,
    file: &str,
    def: &MassRequestDef,
    source: RequestSource,
    endpoint: Endpoint,
    sender: Arc<dyn RequestSender>,
    writers: Vec<Box<dyn RecordWriter>>,
  ) -> Result<Self, RuntimeError> {
    let condition = |source: MatchError| RuntimeError::Condition {
      file: file.to_string(),
      source,
    };
    let interval = def
      .interval
      .as_deref()
      .map(parse_duration)
      .transpose()?
      .unwrap_or_default();
    let time_limit = def.break_on.time.as_deref().map(parse_duration).transpose()?;

    Ok(Self {
      index,
      source,
      endpoint,
      sender,
      interval,
      await_prev: def.await_prev_response,
      time_limit,
      count_limit: def.break_on.count,
      breaks: Breaks {
        sys_error: def.break_on.sys_error,
        parse_error: def.break_on.parse_error,
        write_error: def.break_on.write_error,
        status: IntConditions::compile(&def.break_on.status_code, IntScope::StatusCode)
          .map_err(condition)?,
        body: BodyConditions::compile(&def.break_on.response_body).map_err(condition)?,
      },
      excludes: Excludes {
        count: IntConditions::compile(&def.record_exclude_filter.count, IntScope::Count)
          .map_err(condition)?,
        status: IntConditions::compile(&def.record_exclude_filter.status_code, IntScope::StatusCode)
          .map_err(condition)?,
        body: BodyConditions::compile(&def.record_exclude_filter.response_body)
          .map_err(condition)?,
      },
      success: TerminateRules::parse(&def.success_break).map_err(condition)?,
      writers,
    })
  }

  #[instrument(name = "request_loop", skip_all, fields(index = self.index, target_id = %self.source.initial.target_id))]
  async fn run(mut self, cancel: &CancellationToken) -> Result<(), RuntimeError> {
    let header: Vec<String> = RECORD_HEADER.iter().map(|s| s.to_string()).collect();
    self.write(&header)?;

    let reason = self.drive(cancel).await;
    for writer in &mut self.writers {
      if let Err(e) = writer.flush() {
        warn!(error = %e, "output_flush_failed");
      }
    }

    // A cancelled run is never a failed loop.
    if reason.kind == TerminateType::Context || self.success.matches(&reason) {
      info!(reason = %reason, "request_loop_succeeded");
      Ok(())
    } else {
      warn!(reason = %reason, "request_loop_failed");
      Err(RuntimeError::Terminated {
        index: self.index,
        reason,
      })
    }
  }

  /// Send requests until a termination reason is produced.
  async fn drive(&mut self, cancel: &CancellationToken) -> TerminateReason {
    if self.count_limit == Some(0) {
      return TerminateReason::new(TerminateType::Count);
    }

    let deadline = self.time_limit.map(|limit| Instant::now() + limit);
    let mut in_flight = FuturesUnordered::new();
    let mut sent: u64 = 0;
    let mut next_send = Instant::now();

    loop {
      let can_send = (!self.await_prev || in_flight.is_empty())
        && self.count_limit.is_none_or(|limit| sent < limit);

      tokio::select! {
        biased;
        _ = cancel.cancelled() => return TerminateReason::new(TerminateType::Context),
        _ = until(deadline) => return TerminateReason::new(TerminateType::Time),
        Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
          if let Some(reason) = self.process(outcome) {
            return reason;
          }
        }
        _ = tokio::time::sleep_until(next_send), if can_send => {
          sent += 1;
          let definition = match self.source.definition(sent) {
            Ok(definition) => definition,
            Err(e) => {
              warn!(count = sent, error = %e, "request_create_failed");
              return TerminateReason::new(TerminateType::CreateRequestError);
            }
          };
          in_flight.push(send(self.sender.clone(), self.endpoint.request(&definition), sent));
          next_send = Instant::now() + self.interval;
        }
      }
    }
  }

  /// Record one response and decide whether the loop stops.
  fn process(&mut self, outcome: Outcome) -> Option<TerminateReason> {
    let count = outcome.count;
    let response = outcome.result.as_ref().ok();
    let status = response.map(|r| i64::from(r.status));
    let body: Option<Result<Value, serde_json::Error>> = response.map(HttpResponse::json);
    let parsed = body.as_ref().and_then(|b| b.as_ref().ok());

    let mut excluded = self.excludes.count.first_match(count as i64).is_some()
      || status.is_some_and(|s| self.excludes.status.first_match(s).is_some());
    if let (false, Some(value)) = (excluded, parsed) {
      match self.excludes.body.first_match(value) {
        Ok(matched) => excluded = matched.is_some(),
        Err((id, e)) => {
          warn!(count, condition_id = %id, error = %e, "record_filter_failed");
          return Some(TerminateReason::with_param(
            TerminateType::ResponseBodyWriteFilterError,
            id,
          ));
        }
      }
    }

    if !excluded {
      let record = record(&outcome);
      if let Err(e) = self.write(&record) {
        warn!(count, error = %e, "record_write_failed");
        if self.breaks.write_error {
          return Some(TerminateReason::new(TerminateType::WriteError));
        }
      }
    }

    if let Err(e) = &outcome.result {
      warn!(count, error = %e, "request_send_failed");
      if self.breaks.sys_error {
        return Some(TerminateReason::new(TerminateType::SystemError));
      }
    }
    if let Some(Err(e)) = &body {
      debug!(count, error = %e, "response_not_json");
      if self.breaks.parse_error {
        return Some(TerminateReason::new(TerminateType::ParseError));
      }
    }

    if self.count_limit == Some(count) {
      return Some(TerminateReason::new(TerminateType::Count));
    }

    if let Some(value) = parsed {
      match self.breaks.body.first_match(value) {
        Ok(Some(id)) => {
          return Some(TerminateReason::with_param(TerminateType::ResponseBody, id));
        }
        Ok(None) => {}
        Err((id, e)) => {
          warn!(count, condition_id = %id, error = %e, "break_filter_failed");
          return Some(TerminateReason::with_param(
            TerminateType::ResponseBodyBreakFilterError,
            id,
          ));
        }
      }
    }

    status
      .and_then(|s| self.breaks.status.first_match(s))
      .map(|id| TerminateReason::with_param(TerminateType::StatusCode, id))
  }

  fn write(&mut self, record: &[String]) -> Result<(), HostError> {
    for writer in &mut self.writers {
      writer.write(record)?;
    }
    Ok(())
  }
}

async fn send(sender: Arc<dyn RequestSender>, request: HttpRequest, count: u64) -> Outcome {
  let sent_at = Utc::now();
  let result = sender.send(request).await;
  Outcome {
    count,
    sent_at,
    received_at: Utc::now(),
    result,
  }
}

async fn until(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}

fn record(outcome: &Outcome) -> Vec<String> {
  let (status, elapsed) = match &outcome.result {
    Ok(response) => (response.status.to_string(), response.elapsed),
    Err(_) => (
      String::new(),
      (outcome.received_at - outcome.sent_at)
        .to_std()
        .unwrap_or_default(),
    ),
  };
  vec![
    outcome.count.to_string(),
    status,
    elapsed.as_millis().to_string(),
    outcome.result.is_ok().to_string(),
    outcome.sent_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    outcome.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
  ]
}
