//! Remote service handles.
//!
//! `service.discover(endpoint)` yields an immutable handle; `:http()` opens a
//! request/response client speaking JSON over the standard verbs, `:rpc()` is
//! a reserved unary-RPC surface. Endpoint resolution is pluggable so a real
//! discovery client can be wired in by the embedding process; the default
//! resolver passes endpoints through as base URLs.
//!
//! Transport failures follow the lenient contract scripts expect: the call
//! evaluates to `nil` and the failure is logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::HostType;
use crate::value::{HostValue, NativeFunction, Table, TableKey, UserData, Value};

pub const TAG: &str = "service";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_JSON_DEPTH: usize = 16;

/// Maps a discovered endpoint name to a base URL.
pub trait Resolver: Send + Sync {
    fn resolve(&self, endpoint: &str) -> Result<String, String>;
}

/// Treats the endpoint itself as the base URL, defaulting to http.
pub struct PassthroughResolver;

impl Resolver for PassthroughResolver {
    fn resolve(&self, endpoint: &str) -> Result<String, String> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            Ok(endpoint.to_string())
        } else {
            Ok(format!("http://{endpoint}"))
        }
    }
}

enum Payload {
    Service { endpoint: String },
    Http { base: String, client: reqwest::blocking::Client },
    Rpc { endpoint: String },
}

pub struct ServiceType {
    resolver: Arc<dyn Resolver>,
}

impl ServiceType {
    pub fn new(resolver: Arc<dyn Resolver>) -> ServiceType {
        ServiceType { resolver }
    }

    pub fn with_passthrough() -> ServiceType {
        ServiceType::new(Arc::new(PassthroughResolver))
    }

    fn open_http(&self, endpoint: &str) -> Result<Value, String> {
        let base = self.resolver.resolve(endpoint)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| format!("failed to build http client: {e}"))?;
        Ok(Value::UserData(UserData::new(TAG, Payload::Http { base, client })))
    }
}

impl HostType for ServiceType {
    fn name(&self) -> &'static str {
        TAG
    }

    fn install(&self, globals: &mut HashMap<String, Value>) {
        let mut table = Table::new();
        table.set(
            TableKey::Str("discover".into()),
            Value::Native(NativeFunction::new("service.discover", |_ctx, args| {
                let Some(Value::Str(endpoint)) = args.first() else {
                    return Err("discover expects an endpoint string".to_string());
                };
                if endpoint.is_empty() {
                    return Err("endpoint should not be empty".to_string());
                }
                Ok(vec![Value::UserData(UserData::new(
                    TAG,
                    Payload::Service {
                        endpoint: endpoint.to_string(),
                    },
                ))])
            })),
        );
        globals.insert(TAG.to_string(), Value::table(table));
    }

    fn to_host(&self, ud: &UserData) -> Option<HostValue> {
        match ud.downcast_ref::<Payload>() {
            Some(Payload::Service { endpoint }) | Some(Payload::Rpc { endpoint }) => {
                Some(HostValue::Str(endpoint.clone()))
            }
            _ => None,
        }
    }

    fn to_display(&self, ud: &UserData) -> String {
        match ud.downcast_ref::<Payload>() {
            Some(Payload::Service { endpoint }) => format!("<service {endpoint}>"),
            Some(Payload::Http { base, .. }) => format!("<http client {base}>"),
            Some(Payload::Rpc { endpoint }) => format!("<rpc client {endpoint}>"),
            None => format!("<{TAG}>"),
        }
    }

    fn call_method(&self, name: &str, recv: &Value, args: &[Value]) -> Result<Vec<Value>, String> {
        let Value::UserData(ud) = recv else {
            return Err("service handle expected".to_string());
        };
        let Some(payload) = ud.downcast_ref::<Payload>() else {
            return Err("corrupt service userdata".to_string());
        };
        match payload {
            Payload::Service { endpoint } => match name {
                "endpoint" => Ok(vec![Value::string(endpoint.clone())]),
                "http" => match self.open_http(endpoint) {
                    Ok(handle) => Ok(vec![handle]),
                    Err(err) => {
                        tracing::warn!(endpoint = %endpoint, error = %err, "failed to open http client");
                        Ok(vec![Value::Nil])
                    }
                },
                "rpc" => Ok(vec![Value::UserData(UserData::new(
                    TAG,
                    Payload::Rpc {
                        endpoint: endpoint.clone(),
                    },
                ))]),
                other => Err(format!("unknown method '{other}' on service")),
            },
            Payload::Http { base, client } => match name {
                "get" | "post" | "put" | "delete" => {
                    Ok(vec![http_request(client, base, name, args)])
                }
                other => Err(format!("unknown method '{other}' on http client")),
            },
            Payload::Rpc { .. } => match name {
                // Reserved: unary RPC invocation is intentionally unimplemented.
                "invoke" => Err("rpc invoke is not implemented".to_string()),
                other => Err(format!("unknown method '{other}' on rpc client")),
            },
        }
    }
}

fn http_request(
    client: &reqwest::blocking::Client,
    base: &str,
    verb: &str,
    args: &[Value],
) -> Value {
    let Some(Value::Str(path)) = args.first() else {
        tracing::warn!(verb, "http request needs a path string");
        return Value::Nil;
    };
    let url = join_url(base, path);
    let method = match verb {
        "get" => reqwest::Method::GET,
        "post" => reqwest::Method::POST,
        "put" => reqwest::Method::PUT,
        _ => reqwest::Method::DELETE,
    };
    let mut request = client.request(method, &url);
    if let Some(body) = args.get(1) {
        match value_to_json(body, 0) {
            Ok(json) => request = request.json(&json),
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "invalid request body");
                return Value::Nil;
            }
        }
    }
    match request.send().and_then(|r| r.error_for_status()) {
        Ok(response) => match response.json::<serde_json::Value>() {
            Ok(json) => json_to_value(&json),
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "failed to decode response body");
                Value::Nil
            }
        },
        Err(err) => {
            tracing::warn!(url = %url, error = %err, "failed to invoke remote method");
            Value::Nil
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn value_to_json(value: &Value, depth: usize) -> Result<serde_json::Value, String> {
    if depth > MAX_JSON_DEPTH {
        return Err("request body nested too deeply".to_string());
    }
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Str(s) => serde_json::Value::from(s.to_string()),
        Value::Table(table) => {
            let mut map = serde_json::Map::new();
            for (key, entry) in &table.borrow().entries {
                map.insert(key.render(), value_to_json(entry, depth + 1)?);
            }
            serde_json::Value::Object(map)
        }
        other => return Err(format!("{} values cannot be sent", other.kind())),
    })
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::string(s.clone()),
        serde_json::Value::Array(items) => {
            let mut table = Table::new();
            for item in items {
                table.append(json_to_value(item));
            }
            Value::table(table)
        }
        serde_json::Value::Object(map) => {
            let mut table = Table::new();
            for (key, entry) in map {
                table.set(TableKey::Str(key.clone()), json_to_value(entry));
            }
            Value::table(table)
        }
    }
}
