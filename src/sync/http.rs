use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::RpcClient;
use crate::config::Config;
use crate::error::RpcError;

/// Replays calls against the backend's `/api/method/<method>` endpoint.
#[derive(Clone)]
pub struct HttpRpc {
  client: reqwest::Client,
  base: Url,
  auth: Option<String>,
}

impl HttpRpc {
  pub fn new(config: &Config) -> Result<Self> {
    let url = config
      .backend
      .url
      .as_deref()
      .ok_or_else(|| eyre!("backend.url is not configured"))?;

    let base = base_url(url)?;
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.sync.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let auth = Config::get_api_credentials().map(|(key, secret)| format!("token {}:{}", key, secret));

    Ok(Self { client, base, auth })
  }

  fn endpoint(&self, method: &str) -> Result<Url, RpcError> {
    method_url(&self.base, method)
  }
}

fn base_url(url: &str) -> Result<Url> {
  let mut base = Url::parse(url).map_err(|e| eyre!("Invalid backend url {}: {}", url, e))?;
  // Joining replaces the last path segment unless the base ends in a slash
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  Ok(base)
}

fn method_url(base: &Url, method: &str) -> Result<Url, RpcError> {
  base
    .join(&format!("api/method/{}", method))
    .map_err(|e| RpcError::Transport(format!("invalid method '{}': {}", method, e)))
}

impl RpcClient for HttpRpc {
  async fn call(&self, method: &str, args: &Value) -> Result<Value, RpcError> {
    let url = self.endpoint(method)?;

    let mut request = self
      .client
      .post(url)
      .header(CONTENT_TYPE, "application/json")
      .header(ACCEPT, "application/json")
      .body(args.to_string());
    if let Some(auth) = &self.auth {
      request = request.header(AUTHORIZATION, auth.as_str());
    }

    let response = request
      .send()
      .await
      .map_err(|e| RpcError::Transport(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
      .text()
      .await
      .map_err(|e| RpcError::Transport(e.to_string()))?;

    parse_response(status, &body)
  }
}

/// Interpret a method response. The payload lives under `message`; a body
/// carrying `exc` or `exc_type` is a server-side failure even with a 2xx status.
fn parse_response(status: u16, body: &str) -> Result<Value, RpcError> {
  let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);

  if !(200..300).contains(&status) {
    return Err(RpcError::Rejected {
      status,
      message: error_message(&parsed).unwrap_or_else(|| snippet(body)),
    });
  }

  if parsed.get("exc").is_some() || parsed.get("exc_type").is_some() {
    return Err(RpcError::Server(
      error_message(&parsed).unwrap_or_else(|| snippet(body)),
    ));
  }

  Ok(parsed.get("message").cloned().unwrap_or(Value::Null))
}

fn error_message(body: &Value) -> Option<String> {
  ["exception", "exc_type", "message"]
    .iter()
    .find_map(|field| body.get(*field).and_then(Value::as_str))
    .map(String::from)
}

fn snippet(body: &str) -> String {
  body.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_success_returns_message() {
    let body = json!({ "message": { "name": "ACC-SINV-0001" } }).to_string();
    assert_eq!(
      parse_response(200, &body),
      Ok(json!({ "name": "ACC-SINV-0001" }))
    );
  }

  #[test]
  fn test_exception_in_ok_response_is_failure() {
    let body = json!({
      "exc_type": "ValidationError",
      "exception": "frappe.exceptions.ValidationError: Stock not available"
    })
    .to_string();
    assert_eq!(
      parse_response(200, &body),
      Err(RpcError::Server(
        "frappe.exceptions.ValidationError: Stock not available".into()
      ))
    );
  }

  #[test]
  fn test_http_error_keeps_status() {
    let err = parse_response(502, "<html>Bad Gateway</html>").unwrap_err();
    assert_eq!(
      err,
      RpcError::Rejected {
        status: 502,
        message: "<html>Bad Gateway</html>".into()
      }
    );
  }

  #[test]
  fn test_endpoint_keeps_base_path() {
    let base = base_url("https://erp.example.com/site").unwrap();
    assert_eq!(
      method_url(&base, "posawesome.api.invoices.submit_invoice")
        .unwrap()
        .as_str(),
      "https://erp.example.com/site/api/method/posawesome.api.invoices.submit_invoice"
    );
  }

  #[test]
  fn test_missing_backend_url_is_an_error() {
    assert!(HttpRpc::new(&Config::default()).is_err());
  }
}
