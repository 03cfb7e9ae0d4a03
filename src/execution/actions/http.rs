//! `http_request` executor.

use log::{debug, error};
use reqwest::Method;
use serde_json::Value;

use super::{truncate_detail, StepContext};
use crate::error::{ExecutorError, StepError};
use crate::pipeline::{Coercion, Template, TemplateValue};
use crate::scope::{Scope, StepOutput};

/// Header carrying the run id to called services for correlation.
pub const RUN_ID_HEADER: &str = "X-Callflow-Run";

fn classify(url: &str, error: reqwest::Error) -> ExecutorError {
    if error.is_timeout() {
        ExecutorError::NetworkTimeout {
            url: url.to_string(),
        }
    } else if error.is_builder() {
        ExecutorError::InvalidParameter(error.to_string())
    } else {
        ExecutorError::Network(error.to_string())
    }
}

pub(crate) async fn send_request(
    url: &Template,
    method: &Method,
    headers: &[(String, Template)],
    body: Option<&TemplateValue>,
    scope: &Scope,
    ctx: &StepContext<'_>,
) -> Result<StepOutput, StepError> {
    let url = url.render(scope, Coercion::Text)?;
    let body = body.map(|b| b.resolve(scope)).transpose()?;

    let mut request = ctx
        .integrations
        .http()
        .request(method.clone(), &url)
        .header(RUN_ID_HEADER, ctx.run_id.to_string());
    for (name, value) in headers {
        request = request.header(name.as_str(), value.render(scope, Coercion::Text)?);
    }
    if let Some(body) = &body {
        request = request.json(body);
    }

    debug!("[{}] {}: {} {}", ctx.run_id, ctx.step, method, url);
    let response = request.send().await.map_err(|e| classify(&url, e))?;
    let status = response.status();
    let text = response.text().await.map_err(|e| classify(&url, e))?;

    if !status.is_success() {
        error!(
            "[{}] {}: {} {} returned {}",
            ctx.run_id, ctx.step, method, url, status
        );
        return Err(ExecutorError::HttpStatus {
            status: status.as_u16(),
            body: truncate_detail(&text, 500),
        }
        .into());
    }

    let result = serde_json::from_str(&text).unwrap_or(Value::String(text));
    Ok(StepOutput::new(result, Value::from(status.as_u16())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::ComplianceWindow;
    use crate::execution::actions::Integrations;
    use crate::run::RunId;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scope() -> Scope {
        let mut params = BTreeMap::new();
        params.insert("full_name".to_string(), json!("Ivan Petrov"));
        params.insert("phone_number".to_string(), json!("+79001234567"));
        Scope::with_params(params)
    }

    async fn call(
        url: &str,
        headers: &[(String, Template)],
        body: Option<Value>,
    ) -> Result<StepOutput, StepError> {
        let integrations = Integrations::new(ComplianceWindow::default());
        let cancel = CancellationToken::new();
        let ctx = StepContext {
            run_id: RunId::new(),
            step: "make_call",
            cancel: &cancel,
            integrations: &integrations,
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        };
        let body = body.map(|b| TemplateValue::parse(&b).unwrap());
        send_request(
            &Template::parse(url).unwrap(),
            &Method::POST,
            headers,
            body.as_ref(),
            &scope(),
            &ctx,
        )
        .await
    }

    #[tokio::test]
    async fn test_json_body_is_resolved_and_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ari/channels"))
            .and(header_exists(RUN_ID_HEADER))
            .and(body_json(json!({
                "endpoint": "PJSIP/+79001234567@beeline-trunk",
                "app": "debtor_calls"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "ch-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let output = call(
            &format!("{}/ari/channels", server.uri()),
            &[],
            Some(json!({
                "endpoint": "PJSIP/{{ params.phone_number }}@beeline-trunk",
                "app": "debtor_calls"
            })),
        )
        .await
        .unwrap();

        assert_eq!(output.status, json!(201));
        assert_eq!(output.result, json!({"id": "ch-1"}));
    }

    #[tokio::test]
    async fn test_templated_headers_and_text_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Debtor", "Ivan Petrov"))
            .respond_with(ResponseTemplate::new(200).set_body_string("queued"))
            .mount(&server)
            .await;

        let headers = vec![(
            "X-Debtor".to_string(),
            Template::parse("{{ params.full_name }}").unwrap(),
        )];
        let output = call(&server.uri(), &headers, None).await.unwrap();
        assert_eq!(output.result, json!("queued"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_executor_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("trunk busy"))
            .mount(&server)
            .await;

        let err = call(&server.uri(), &[], None).await.unwrap_err();
        assert_eq!(
            err,
            StepError::Executor(ExecutorError::HttpStatus {
                status: 503,
                body: "trunk busy".into()
            })
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Nothing listens on port 9 locally.
        let err = call("http://127.0.0.1:9/tts", &[], None).await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Executor(ExecutorError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_url_fails_before_sending() {
        let err = call("http://tts/{{ params.voice }}", &[], None).await.unwrap_err();
        assert!(matches!(err, StepError::Resolution(_)));
    }
}
