//! Request bridge: turns one inbound command into one downstream HTTP call.
//!
//! `predict` commands POST their payload to the fixed `forward.post_url` and
//! answer with the raw body text. `handle` commands pick method and path
//! themselves (joined onto `forward.base_url`) and answer with a base64 body
//! plus every response header.
//!
//! [`RequestBridge::forward`] never fails: every outcome is folded into a
//! [`CommandResponse`] carrying the command's correlation id.

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Method;
use tracing::{error, info, warn};

use crate::config::ForwardConfig;
use crate::error::RelayError;
use crate::protocol::{Command, CommandResponse, HandleCommand, HeaderCollection, PredictCommand};

pub struct RequestBridge {
    http: reqwest::Client,
    post_url: String,
    base_url: String,
    fail_on_status: bool,
}

impl RequestBridge {
    /// Build the bridge. Certificate verification is disabled.
    pub fn new(config: &ForwardConfig, timeout: Duration) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            post_url: config.post_url.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fail_on_status: config.fail_on_status,
        })
    }

    /// Forward `command` and produce its one response.
    pub async fn forward(&self, command: &Command) -> CommandResponse {
        let started = Instant::now();
        let result = match command {
            Command::Predict(c) => self.forward_predict(c).await,
            Command::Handle(c) => self.forward_handle(c).await,
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let id = command.id();
        let timestamp = command.timestamp();

        match result {
            Ok(response) => {
                info!(
                    id,
                    %timestamp,
                    path = self.target_of(command),
                    elapsed_ms,
                    "==> command forwarded"
                );
                response
            }
            Err(e @ RelayError::SerializationFailure(_)) => {
                error!(id, %timestamp, kind = e.kind(), "Cannot encode command payload: {e}");
                CommandResponse::failure(id)
            }
            Err(e) => {
                warn!(
                    id,
                    %timestamp,
                    kind = e.kind(),
                    elapsed_ms,
                    "x=x command failed: {e}"
                );
                CommandResponse::failure(id)
            }
        }
    }

    fn target_of<'a>(&'a self, command: &'a Command) -> &'a str {
        match command {
            Command::Predict(_) => &self.post_url,
            Command::Handle(c) => &c.path,
        }
    }

    async fn forward_predict(&self, cmd: &PredictCommand) -> Result<CommandResponse, RelayError> {
        let body = serde_json::to_vec(&cmd.data)?;
        let resp = self
            .http
            .post(&self.post_url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let resp = self.check_status(resp)?;
        let bytes = resp.bytes().await?;
        Ok(CommandResponse {
            id: cmd.id.clone(),
            success: true,
            data: String::from_utf8_lossy(&bytes).into_owned(),
            header: None,
        })
    }

    async fn forward_handle(&self, cmd: &HandleCommand) -> Result<CommandResponse, RelayError> {
        let method = Method::from_bytes(cmd.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| RelayError::malformed("handle", format!("invalid HTTP method `{}`", cmd.method)))?;
        let url = join_url(&self.base_url, &cmd.path);

        let mut req = self.http.request(method, url);
        if let Some(data) = cmd.data.as_ref().filter(|d| !d.is_null()) {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(data)?);
        }
        let resp = self.check_status(req.send().await?)?;
        let header = collect_headers(resp.headers());
        let bytes = resp.bytes().await?;
        Ok(CommandResponse {
            id: cmd.id.clone(),
            success: true,
            data: BASE64.encode(&bytes),
            header: Some(header),
        })
    }

    fn check_status(&self, resp: reqwest::Response) -> Result<reqwest::Response, RelayError> {
        if self.fail_on_status {
            Ok(resp.error_for_status()?)
        } else {
            Ok(resp)
        }
    }
}

/// `base` (no trailing slash) + `path`, inserting the `/` if missing.
fn join_url(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

fn collect_headers(headers: &HeaderMap) -> HeaderCollection {
    let mut out = HeaderCollection::new();
    for (name, value) in headers {
        out.entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

/// `x-foo-bar` → `X-Foo-Bar`
fn canonical_header_key(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
