use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::GatewayConfig,
    error::Error,
    types::{ExecutionRequest, ExecutionResult, LanguageProfile},
    Result,
};

/// Best-effort cancellation calls get their own short timeout so a dying
/// upstream cannot hold the task.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(2);

/// Client for the remote execution service. Owns the HTTP connection pool,
/// per-attempt timeouts, and the bounded retry policy.
pub struct ExecutionClient {
    http: Client,
    api_url: String,
    api_key: Option<String>,
    max_retries: u32,
    retry_base_delay: Duration,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    request_id: String,
    backend: &'a str,
    version: &'a str,
    code: &'a str,
    stdin: &'a str,
    compiler_flags: &'a [String],
    runtime_flags: &'a [String],
    optimize: bool,
}

#[derive(Deserialize)]
struct RunResponse {
    #[serde(default)]
    compile_output: String,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    signal: Option<String>,
    #[serde(default)]
    elapsed_ms: u64,
}

#[derive(Deserialize)]
struct BackendInfo {
    name: String,
    version: String,
    language: String,
}

/// Outcome of a single network attempt.
enum Attempt {
    Ok(RunResponse),
    Transient(String),
    Fatal(Error),
}

impl ExecutionClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.attempt_timeout)
            .build()
            .map_err(Error::HttpClient)?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
        })
    }

    /// Run a submission remotely, bounded by `deadline` for the whole
    /// compile + run. On deadline expiry a best-effort upstream cancel is
    /// issued and `Timeout` returned; the cancel is never awaited.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        deadline: Duration,
    ) -> Result<ExecutionResult> {
        match time::timeout(deadline, self.execute_with_retries(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Request {} exceeded the {}s soft deadline, cancelling upstream",
                    request.id,
                    deadline.as_secs()
                );
                self.spawn_cancel(request.id);
                Err(Error::Timeout(deadline))
            }
        }
    }

    async fn execute_with_retries(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let body = RunRequest {
            request_id: request.id.to_string(),
            backend: &request.profile.backend_id,
            version: &request.profile.compiler_version,
            code: &request.source,
            stdin: request.stdin.as_deref().unwrap_or(""),
            compiler_flags: &request.options.compiler_flags,
            runtime_flags: &request.options.runtime_flags,
            optimize: request.options.optimize,
        };

        let mut last_transient = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt);
                debug!(
                    "Retrying request {} (attempt {}/{}) after {:?}",
                    request.id, attempt, self.max_retries, delay
                );
                time::sleep(delay).await;
            }

            match self.run_attempt(&body).await {
                Attempt::Ok(response) => {
                    return Ok(ExecutionResult {
                        request_id: request.id,
                        exit_code: response.exit_code,
                        signal: response.signal,
                        stdout: response.stdout,
                        stderr: response.stderr,
                        compile_output: response.compile_output,
                        duration: Duration::from_millis(response.elapsed_ms),
                    });
                }
                Attempt::Transient(reason) => {
                    debug!("Transient upstream failure for {}: {}", request.id, reason);
                    last_transient = reason;
                }
                Attempt::Fatal(e) => return Err(e),
            }
        }

        Err(Error::UpstreamUnavailable(last_transient))
    }

    async fn run_attempt(&self, body: &RunRequest<'_>) -> Attempt {
        let mut call = self
            .http
            .post(format!("{}/api/run", self.api_url))
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            call = call.header("x-api-key", key);
        }

        let response = match call.json(body).send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Transient(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            match response.json::<RunResponse>().await {
                Ok(parsed) => Attempt::Ok(parsed),
                Err(e) => Attempt::Transient(format!("malformed response: {e}")),
            }
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Attempt::Transient(format!("upstream returned {status}"))
        } else {
            let message = response.text().await.unwrap_or_default();
            Attempt::Fatal(Error::Api {
                status_code: status.as_u16(),
                message,
            })
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_base_delay * 2u32.saturating_pow(attempt - 1);
        let jitter_cap = (base / 2).max(Duration::from_millis(1));
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..jitter_cap);
        base + jitter
    }

    fn spawn_cancel(&self, request_id: Uuid) {
        let mut call = self
            .http
            .post(format!("{}/api/cancel", self.api_url))
            .timeout(CANCEL_TIMEOUT)
            .json(&serde_json::json!({ "request_id": request_id.to_string() }));
        if let Some(key) = &self.api_key {
            call = call.header("x-api-key", key);
        }
        tokio::spawn(async move {
            match call.send().await {
                Ok(response) => debug!("Upstream cancel returned {}", response.status()),
                Err(e) => debug!("Upstream cancel failed: {}", e),
            }
        });
    }

    /// Issue a best-effort upstream cancel without waiting for confirmation.
    pub fn cancel_job(&self, request_id: Uuid) {
        self.spawn_cancel(request_id);
    }

    /// Fetch the service's backend list and turn it into language profiles,
    /// one per language. Head builds are skipped, they are not functional
    /// upstream.
    pub async fn fetch_profiles(&self) -> Result<Vec<LanguageProfile>> {
        let mut call = self.http.get(format!("{}/api/list", self.api_url));
        if let Some(key) = &self.api_key {
            call = call.header("x-api-key", key);
        }
        let response = call
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status_code: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let backends: Vec<BackendInfo> = response.json().await.map_err(Error::HttpClient)?;
        let mut seen = HashSet::new();
        let mut profiles = Vec::new();
        for backend in backends {
            if backend.name.to_lowercase().contains("head") {
                continue;
            }
            let alias = backend.language.to_lowercase();
            if alias.is_empty() || !seen.insert(alias.clone()) {
                continue;
            }
            profiles.push(LanguageProfile {
                alias,
                backend_id: backend.name,
                compiler_version: backend.version,
                display_name: backend.language,
            });
        }
        info!("Fetched {} language profiles from upstream", profiles.len());
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionOptions;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_url: String) -> GatewayConfig {
        let mut config = GatewayConfig::new(api_url).with_api_key("test_api_key");
        config.max_retries = 2;
        config.retry_base_delay = Duration::from_millis(5);
        config
    }

    fn test_request() -> ExecutionRequest {
        ExecutionRequest::new(
            1,
            100,
            Arc::new(LanguageProfile {
                alias: "python".to_string(),
                backend_id: "cpython-3.12".to_string(),
                compiler_version: "3.12.1".to_string(),
                display_name: "Python".to_string(),
            }),
            "print(1+1)".to_string(),
            None,
            ExecutionOptions::default(),
        )
    }

    #[tokio::test]
    async fn successful_run_is_normalized() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/run"))
            .and(header("x-api-key", "test_api_key"))
            .and(body_partial_json(json!({
                "backend": "cpython-3.12",
                "code": "print(1+1)"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "compile_output": "",
                "stdout": "2\n",
                "stderr": "",
                "exit_code": 0,
                "elapsed_ms": 17
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ExecutionClient::new(&test_config(mock_server.uri())).unwrap();
        let request = test_request();
        let result = client
            .execute(&request, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.request_id, request.id);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "2\n");
        assert_eq!(result.signal, None);
        assert_eq!(result.duration, Duration::from_millis(17));
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/run"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad request shape"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ExecutionClient::new(&test_config(mock_server.uri())).unwrap();
        let result = client.execute(&test_request(), Duration::from_secs(5)).await;

        assert!(matches!(
            result,
            Err(Error::Api {
                status_code: 422,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_succeed() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/run"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/run"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "stdout": "ok\n",
                "exit_code": 0,
                "elapsed_ms": 3
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ExecutionClient::new(&test_config(mock_server.uri())).unwrap();
        let result = client
            .execute(&test_request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.stdout, "ok\n");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/run"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3) // initial attempt + max_retries
            .mount(&mock_server)
            .await;

        let client = ExecutionClient::new(&test_config(mock_server.uri())).unwrap();
        let result = client.execute(&test_request(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn soft_deadline_times_out_and_cancels_upstream() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/run"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_json(json!({ "stdout": "", "exit_code": 0 })),
            )
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/cancel"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ExecutionClient::new(&test_config(mock_server.uri())).unwrap();
        let request = test_request();
        let result = client.execute(&request, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        // the cancel call is detached; give it a moment before the mock
        // server verifies expectations on drop
        time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn fetch_profiles_skips_head_builds_and_dedupes_languages() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "name": "cpython-3.12", "version": "3.12.1", "language": "Python" },
                { "name": "cpython-head", "version": "3.14-dev", "language": "Python" },
                { "name": "cpython-3.11", "version": "3.11.8", "language": "Python" },
                { "name": "gcc-13", "version": "13.2.0", "language": "C++" }
            ])))
            .mount(&mock_server)
            .await;

        let client = ExecutionClient::new(&test_config(mock_server.uri())).unwrap();
        let profiles = client.fetch_profiles().await.unwrap();

        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].alias, "python");
        assert_eq!(profiles[0].backend_id, "cpython-3.12");
        assert_eq!(profiles[1].alias, "c++");
    }
}
