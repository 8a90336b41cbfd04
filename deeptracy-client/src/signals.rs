//! Signal delivery

use deeptracy_core::domain::property::PropertySet;
use deeptracy_core::domain::signal::{Method, SignalEvent};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::BackendClient;
use crate::error::{ClientError, Result};

/// Outcome of [`BackendClient::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalResult {
    /// The condition did not hold; nothing was sent
    Skipped,
    /// The backend accepted the signal
    Delivered { status: u16 },
}

impl BackendClient {
    /// Render and deliver a signal
    ///
    /// Skips the call when the signal's condition does not hold. On success,
    /// every configured harvest copies a field of the JSON response into
    /// `props`.
    ///
    /// # Arguments
    /// * `signal` - The signal to deliver
    /// * `props` - Properties of the sending build
    pub async fn send(&self, signal: &SignalEvent, props: &mut PropertySet) -> Result<SignalResult> {
        if !signal.condition.holds(props) {
            debug!("Skipping signal '{}': condition not met", signal.name);
            return Ok(SignalResult::Skipped);
        }

        let rendered = signal.render(props)?;
        let url = format!("{}{}", self.base_url, rendered.path);

        debug!("Sending signal '{}': {} {}", signal.name, rendered.method, url);

        let mut request = match rendered.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
        };
        if let Some(body) = &rendered.body {
            request = request.json(body);
        }

        let response = self.check_status(request.send().await?).await?;
        let status = response.status().as_u16();

        if !signal.harvest.is_empty() {
            let body: JsonValue = response.json().await.map_err(|e| {
                ClientError::ParseError(format!("Failed to parse JSON response: {}", e))
            })?;

            for harvest in &signal.harvest {
                let value = body.get(&harvest.field).cloned().ok_or_else(|| {
                    ClientError::ParseError(format!(
                        "Response to '{}' has no field '{}'",
                        signal.name, harvest.field
                    ))
                })?;
                props.insert_json(&harvest.property, value)?;
            }
        }

        info!("Signal '{}' delivered (status {})", signal.name, status);
        Ok(SignalResult::Delivered { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{post, put};
    use axum::{Json, Router};
    use deeptracy_core::domain::property::Property;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<(String, JsonValue)>>>;

    async fn spawn_backend() -> (String, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));

        let app = Router::new()
            .route(
                "/analysis/",
                post(|State(calls): State<Calls>, Json(body): Json<JsonValue>| async move {
                    calls.lock().unwrap().push(("register".to_string(), body));
                    Json(json!({"id": "a-100"}))
                }),
            )
            .route(
                "/analysis/{id}/extraction/{event}",
                put(
                    |State(calls): State<Calls>,
                     Path((id, event)): Path<(String, String)>,
                     body: axum::body::Bytes| async move {
                        let body = serde_json::from_slice(&body).unwrap_or(JsonValue::Null);
                        calls.lock().unwrap().push((format!("{}/{}", id, event), body));
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route(
                "/analysis/{id}/{execution}/dependencies",
                post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            )
            .with_state(calls.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), calls)
    }

    #[tokio::test]
    async fn test_send_renders_payload() {
        let (url, calls) = spawn_backend().await;
        let client = BackendClient::new(url);
        let mut props = PropertySet::new()
            .with(Property::AnalysisId, "a-1")
            .unwrap()
            .with(Property::TaskCount, 0_i64)
            .unwrap();

        let result = client
            .send(&analysis::extraction_succeeded(), &mut props)
            .await
            .unwrap();

        assert_eq!(result, SignalResult::Delivered { status: 204 });
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "a-1/succeeded");
        assert_eq!(calls[0].1, json!({"task_count": 0}));
    }

    #[tokio::test]
    async fn test_send_skips_when_condition_fails() {
        let (url, calls) = spawn_backend().await;
        let client = BackendClient::new(url);
        let mut props = PropertySet::new()
            .with(Property::AnalysisId, "a-1")
            .unwrap()
            .with(Property::TaskCount, 3_i64)
            .unwrap();

        let result = client
            .send(&analysis::extraction_failed(), &mut props)
            .await
            .unwrap();

        assert_eq!(result, SignalResult::Skipped);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_harvests_response_fields() {
        let (url, calls) = spawn_backend().await;
        let client = BackendClient::new(url);
        let mut props = PropertySet::new()
            .with(Property::Repo, "https://example.com/r.git")
            .unwrap()
            .with(Property::Commit, "main")
            .unwrap()
            .with(Property::Notify, "")
            .unwrap();

        client
            .send(&analysis::register_analysis(), &mut props)
            .await
            .unwrap();

        assert_eq!(props.analysis_id(), Some("a-100"));
        let calls = calls.lock().unwrap();
        assert_eq!(
            calls[0].1,
            json!({"repo": "https://example.com/r.git", "commit": "main", "notify": ""})
        );
    }

    #[tokio::test]
    async fn test_send_reports_server_errors() {
        let (url, _calls) = spawn_backend().await;
        let client = BackendClient::new(url);
        let mut props = PropertySet::new()
            .with(Property::AnalysisId, "a-1")
            .unwrap()
            .with(Property::ExecutionId, "e-1")
            .unwrap()
            .with(Property::Dependencies, json!([]))
            .unwrap();

        let err = client
            .send(&analysis::dependencies_report(), &mut props)
            .await
            .unwrap_err();

        assert!(err.is_server_error());
    }

    #[tokio::test]
    async fn test_send_reports_missing_properties() {
        let (url, calls) = spawn_backend().await;
        let client = BackendClient::new(url);
        let mut props = PropertySet::new();

        let err = client
            .send(&analysis::extraction_started(), &mut props)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Render(_)));
        assert!(calls.lock().unwrap().is_empty());
    }
}
