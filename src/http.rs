//! HTTP step execution.

use crate::error::{EngineError, Result};
use crate::model::{GlobalHeader, RequestInfo, ResponseInfo};
use crate::step::{BodySpec, HttpRequestSpec};
use crate::variables::{stringify, Resolver, VariablePool};
use indexmap::IndexMap;
use reqwest::{Client, Method as ReqMethod};
use serde_json::Value;
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Where a request is sent and with which shared headers.
#[derive(Debug, Clone, Copy)]
pub struct HttpTarget<'a> {
    pub base_url: &'a str,
    pub verify_ssl: bool,
    pub global_headers: &'a [GlobalHeader],
}

/// Request captured before sending, plus the response or the transport
/// error that prevented one.
#[derive(Debug)]
pub struct HttpExchange {
    pub request: RequestInfo,
    pub response: Result<ResponseInfo>,
}

#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    insecure_client: Client,
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let insecure_client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client: Client::new(),
            insecure_client,
            timeout,
        })
    }

    /// Render and send `spec`. Non-2xx responses are not errors.
    #[instrument(skip_all, fields(method = %spec.method, url = %spec.url))]
    pub async fn send(
        &self,
        spec: &HttpRequestSpec,
        target: HttpTarget<'_>,
        resolver: &Resolver<'_>,
        pool: &VariablePool,
    ) -> HttpExchange {
        let mut request = RequestInfo {
            method: spec.method.clone(),
            url: spec.url.clone(),
            ..Default::default()
        };

        let prepared = match self.prepare(spec, target, resolver, pool, &mut request) {
            Ok(prepared) => prepared,
            Err(e) => {
                return HttpExchange {
                    request,
                    response: Err(e),
                }
            }
        };

        debug!("Sending request to {}", request.url);
        let response = self.execute(prepared).await;
        if let Ok(resp) = &response {
            debug!("Received response with status: {}", resp.status);
        }
        HttpExchange { request, response }
    }

    fn prepare(
        &self,
        spec: &HttpRequestSpec,
        target: HttpTarget<'_>,
        resolver: &Resolver<'_>,
        pool: &VariablePool,
        info: &mut RequestInfo,
    ) -> Result<reqwest::RequestBuilder> {
        let url = resolver.render_string(&spec.url, pool)?;
        info.url = url.clone();
        let mut url = join_url(target.base_url, &url)?;

        let params = render_pairs(&spec.params, resolver, pool)?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }
        info.url = url.to_string();

        // Global headers apply only when the step does not set them.
        let mut headers = render_pairs(&spec.headers, resolver, pool)?;
        for header in target.global_headers.iter().filter(|h| h.is_enabled) {
            if !has_header(&headers, &header.name) {
                let value = resolver.render_string(&header.value, pool)?;
                headers.insert(header.name.clone(), value);
            }
        }

        let method = ReqMethod::from_bytes(spec.method.as_bytes())
            .map_err(|_| EngineError::Definition(format!("invalid http method '{}'", spec.method)))?;
        let client = if target.verify_ssl {
            &self.client
        } else {
            &self.insecure_client
        };
        let builder = client.request(method, url).timeout(self.timeout);
        let (mut builder, body, content_type) = attach_body(&spec.body, resolver, pool, builder)?;
        if let Some(content_type) = content_type {
            if !has_header(&headers, "content-type") {
                headers.insert("Content-Type".to_string(), content_type.to_string());
            }
        }

        for (name, value) in &headers {
            builder = builder.header(name, value);
        }

        info.headers = headers;
        info.body = body;
        Ok(builder)
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<ResponseInfo> {
        let started = Instant::now();
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers: IndexMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let bytes = response.bytes().await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        Ok(ResponseInfo {
            status,
            headers,
            content_size: bytes.len(),
            body: Some(String::from_utf8_lossy(&bytes).into_owned()),
            elapsed_ms,
        })
    }
}

/// Join a relative url onto `base`; absolute urls pass through.
pub fn join_url(base: &str, url: &str) -> Result<reqwest::Url> {
    if url.contains("://") || base.trim().is_empty() {
        return reqwest::Url::parse(url)
            .map_err(|e| EngineError::Transport(format!("invalid url '{url}': {e}")));
    }

    let mut base = reqwest::Url::parse(base)
        .map_err(|e| EngineError::Transport(format!("invalid base_url '{base}': {e}")))?;
    if url.is_empty() {
        return Ok(base);
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(url.trim_start_matches('/'))
        .map_err(|e| EngineError::Transport(format!("failed to join '{base}' with '{url}': {e}")))
}

/// Attach the body; returns the builder, the captured body text and the
/// implied content type.
fn attach_body(
    spec: &BodySpec,
    resolver: &Resolver<'_>,
    pool: &VariablePool,
    builder: reqwest::RequestBuilder,
) -> Result<(reqwest::RequestBuilder, Option<String>, Option<&'static str>)> {
    match spec {
        BodySpec::None => Ok((builder, None, None)),
        BodySpec::Json(value) => {
            let text = serde_json::to_string(&resolver.render(value, pool)?)?;
            Ok((builder.body(text.clone()), Some(text), Some("application/json")))
        }
        BodySpec::Raw(value) => {
            let (text, content_type) = match resolver.render(value, pool)? {
                Value::String(s) => {
                    let is_json = serde_json::from_str::<Value>(&s).is_ok();
                    (s, is_json.then_some("application/json"))
                }
                other => (serde_json::to_string(&other)?, Some("application/json")),
            };
            Ok((builder.body(text.clone()), Some(text), content_type))
        }
        BodySpec::Form(fields) => {
            let pairs = render_pairs(fields, resolver, pool)?;
            let text = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs.iter())
                .finish();
            Ok((
                builder.body(text.clone()),
                Some(text),
                Some("application/x-www-form-urlencoded"),
            ))
        }
        BodySpec::Multipart(fields) => {
            let pairs = render_pairs(fields, resolver, pool)?;
            let mut form = reqwest::multipart::Form::new();
            let mut text = String::new();
            for (name, value) in &pairs {
                form = form.text(name.clone(), value.clone());
                let _ = writeln!(text, "{name}={value}");
            }
            // multipart sets its own boundary content type
            Ok((builder.multipart(form), Some(text.trim_end().to_string()), None))
        }
    }
}

fn render_pairs(
    pairs: &IndexMap<String, Value>,
    resolver: &Resolver<'_>,
    pool: &VariablePool,
) -> Result<IndexMap<String, String>> {
    pairs
        .iter()
        .map(|(k, v)| Ok((k.clone(), stringify(&resolver.render(v, pool)?))))
        .collect()
}

fn has_header(headers: &IndexMap<String, String>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

/// Human-readable request/response dump attached to a step result.
pub fn format_exchange(request: &RequestInfo, response: Option<&ResponseInfo>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "> {} {}", request.method, request.url);
    for (k, v) in &request.headers {
        let _ = writeln!(out, "> {k}: {v}");
    }
    if let Some(body) = &request.body {
        let _ = writeln!(out, ">\n{body}");
    }
    match response {
        Some(resp) => {
            let _ = writeln!(
                out,
                "\n< {} ({} ms, {} bytes)",
                resp.status, resp.elapsed_ms, resp.content_size
            );
            for (k, v) in &resp.headers {
                let _ = writeln!(out, "< {k}: {v}");
            }
            if let Some(body) = &resp.body {
                let _ = writeln!(out, "<\n{body}");
            }
        }
        None => out.push_str("\n< no response\n"),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("http://api.test", "/users").unwrap().as_str(),
            "http://api.test/users"
        );
        assert_eq!(
            join_url("http://api.test/v1", "users/1").unwrap().as_str(),
            "http://api.test/v1/users/1"
        );
        assert_eq!(
            join_url("http://api.test/v1/", "/users").unwrap().as_str(),
            "http://api.test/v1/users"
        );
        assert_eq!(
            join_url("http://api.test", "https://other.test/x").unwrap().as_str(),
            "https://other.test/x"
        );
        assert!(join_url("", "/relative").is_err());
    }

    #[test]
    fn test_raw_body_content_type_follows_json_decoding() {
        let functions = crate::functions::FunctionRegistry::default();
        let resolver = Resolver::lenient(&functions);
        let pool = VariablePool::new();
        let client = Client::new();

        for (content, expected) in [
            ("123", Some("application/json")),
            ("true", Some("application/json")),
            (r#"{"a": 1}"#, Some("application/json")),
            ("[1, 2]", Some("application/json")),
            ("hello", None),
            ("", None),
        ] {
            let builder = client.post("http://api.test/raw");
            let spec = BodySpec::Raw(Value::String(content.to_string()));
            let (_, body, content_type) = attach_body(&spec, &resolver, &pool, builder).unwrap();
            assert_eq!(body.as_deref(), Some(content));
            assert_eq!(content_type, expected, "raw body {content:?}");
        }
    }

    #[test]
    fn test_format_exchange() {
        let request = RequestInfo {
            method: "GET".into(),
            url: "http://api.test/get".into(),
            headers: [("Accept".to_string(), "*/*".to_string())].into_iter().collect(),
            body: None,
        };
        let text = format_exchange(&request, None);
        assert!(text.starts_with("> GET http://api.test/get\n> Accept: */*"));
        assert!(text.ends_with("< no response\n"));
    }
}
