//! MCP Server implementation for SAP Gateway OData
//!
//! Exposes the connector operations as tools. Every tool answers with a JSON
//! object; failures become `{"success": false, "error": ...}`.

use crate::connector::{QueryRequest, SapConnector};
use crate::error::ConnectorError;
use crate::mcp::protocol::*;
use crate::odata::{OutputFormat, QueryOptions};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// MCP Server for SAP Gateway
pub struct SapMcpServer {
    connector: Arc<SapConnector>,
}

impl SapMcpServer {
    /// Create a new MCP server instance
    pub fn new(connector: Arc<SapConnector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &Arc<SapConnector> {
        &self.connector
    }

    /// Get list of available tools
    pub fn get_tools(&self) -> Vec<Tool> {
        use ParamType::{Integer, String as Str};

        vec![
            Tool {
                name: "sap_list_services".to_string(),
                description: "List all SAP OData services configured in the service catalog, with their entity sets and key fields".to_string(),
                input_schema: create_tool_schema(vec![]),
            },
            Tool {
                name: "sap_query".to_string(),
                description: "Query an SAP OData entity set with optional filters. Returns 'results' and 'count' in json_compact format.".to_string(),
                input_schema: create_tool_schema(vec![
                    ("service", Str, "Service id from the catalog, e.g., 'sales_order'", true),
                    ("entity_set", Str, "Entity set name, e.g., 'zsd004Set'", true),
                    ("filter", Str, "OData filter expression, e.g., \"Status eq 'OPEN'\"", false),
                    ("select", Str, "Comma-separated fields to select, e.g., 'OrderID,Status'", false),
                    ("top", Integer, "Maximum records to return (0 returns no rows)", false),
                    ("skip", Integer, "Number of records to skip (for pagination)", false),
                    ("orderby", Str, "Sort order, e.g., 'OrderID desc'", false),
                    ("expand", Str, "Comma-separated navigation properties to expand", false),
                    ("format", Str, "'json' for the raw OData response, 'json_compact' (default) strips metadata", false),
                ]),
            },
            Tool {
                name: "sap_get_entity".to_string(),
                description: "Retrieve a single entity from an SAP OData service by its key".to_string(),
                input_schema: create_tool_schema(vec![
                    ("service", Str, "Service id from the catalog, e.g., 'sales_order'", true),
                    ("entity_set", Str, "Entity set name, e.g., 'zsd004Set'", true),
                    ("entity_key", Str, "Key value, e.g., '91000092'", true),
                    ("select", Str, "Comma-separated fields to select", false),
                ]),
            },
            Tool {
                name: "sap_authenticate".to_string(),
                description: "Authenticate with SAP Gateway using the configured credentials".to_string(),
                input_schema: create_tool_schema(vec![]),
            },
            Tool {
                name: "sap_reload_services".to_string(),
                description: "Reload the service catalog from disk. Use this after services.yaml has changed.".to_string(),
                input_schema: create_tool_schema(vec![]),
            },
        ]
    }

    /// Handle a tool call
    pub async fn call_tool(&self, name: &str, args: &HashMap<String, Value>) -> CallToolResult {
        CallToolResult::json(&self.dispatch(name, args).await)
    }

    /// Run a tool and return its JSON result. Never fails: errors are folded
    /// into `{"success": false, "error": ...}`.
    pub async fn dispatch(&self, name: &str, args: &HashMap<String, Value>) -> Value {
        let result = match name {
            "sap_list_services" => to_json(&self.connector.list_services()),
            "sap_query" => self.query(args).await,
            "sap_get_entity" => self.get_entity(args).await,
            "sap_authenticate" => match self.connector.authenticate().await {
                Ok(result) => to_json(&result),
                Err(e) => Err(e),
            },
            "sap_reload_services" => self.reload_services(),
            _ => Err(ConnectorError::InvalidArgument(format!("Unknown tool: {}", name))),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!("Tool {} failed: {}", name, e);
            json!({ "success": false, "error": e.to_string() })
        })
    }

    /// Dispatch one JSON-RPC request. Returns `None` for notifications.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let notification = request.is_notification();

        let response = match request.method.as_str() {
            "initialize" => {
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: ServerCapabilities {
                        tools: Some(ToolsCapability {
                            list_changed: Some(false),
                        }),
                    },
                    server_info: ServerInfo {
                        name: "sap-odata-mcp".to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                };
                JsonRpcResponse::from_serializable(id, &result)
            }

            "initialized" | "notifications/initialized" => {
                JsonRpcResponse::success(id, json!({}))
            }

            "tools/list" => {
                let result = ListToolsResult {
                    tools: self.get_tools(),
                };
                JsonRpcResponse::from_serializable(id, &result)
            }

            "tools/call" => {
                let params: CallToolParams = match request.params {
                    Some(p) => match serde_json::from_value(p) {
                        Ok(params) => params,
                        Err(e) => {
                            return Some(JsonRpcResponse::error(
                                id,
                                INVALID_PARAMS,
                                &format!("Invalid params: {}", e),
                            ));
                        }
                    },
                    None => {
                        return Some(JsonRpcResponse::error(id, INVALID_PARAMS, "Missing params"));
                    }
                };

                tracing::debug!("Calling tool {}", params.name);
                let args = params.arguments.unwrap_or_default();
                let result = self.call_tool(&params.name, &args).await;
                JsonRpcResponse::from_serializable(id, &result)
            }

            "ping" => JsonRpcResponse::success(id, json!({})),

            method => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                &format!("Method not found: {}", method),
            ),
        };

        if notification {
            None
        } else {
            Some(response)
        }
    }

    async fn query(&self, args: &HashMap<String, Value>) -> Result<Value, ConnectorError> {
        let format = match optional_str(args, "format") {
            Some(f) => f
                .parse::<OutputFormat>()
                .map_err(ConnectorError::InvalidArgument)?,
            None => OutputFormat::default(),
        };

        let request = QueryRequest {
            service: required_str(args, "service")?,
            entity_set: required_str(args, "entity_set")?,
            options: QueryOptions {
                select: optional_list(args, "select"),
                filter: optional_str(args, "filter"),
                top: parse_number_arg(args, "top")?,
                skip: parse_number_arg(args, "skip")?,
                orderby: optional_str(args, "orderby"),
                expand: optional_list(args, "expand"),
            },
            format,
        };

        self.connector.query(&request).await
    }

    async fn get_entity(&self, args: &HashMap<String, Value>) -> Result<Value, ConnectorError> {
        let service = required_str(args, "service")?;
        let entity_set = required_str(args, "entity_set")?;
        let entity_key = required_str(args, "entity_key")?;
        let select = optional_list(args, "select");

        let result = self
            .connector
            .get_entity(&service, &entity_set, &entity_key, select.as_deref())
            .await?;
        to_json(&result)
    }

    fn reload_services(&self) -> Result<Value, ConnectorError> {
        let catalog = self.connector.reload_catalog()?;
        Ok(json!({
            "success": true,
            "count": catalog.len(),
            "services": catalog.list_ids(),
            "source": catalog.source().map(|p| p.display().to_string()),
        }))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ConnectorError> {
    serde_json::to_value(value)
        .map_err(|e| ConnectorError::Internal(format!("Failed to serialize result: {}", e)))
}

fn required_str(args: &HashMap<String, Value>, key: &str) -> Result<String, ConnectorError> {
    optional_str(args, key)
        .ok_or_else(|| ConnectorError::InvalidArgument(format!("Missing required parameter: {}", key)))
}

/// String argument; numbers are accepted and rendered as text
fn optional_str(args: &HashMap<String, Value>, key: &str) -> Option<String> {
    match args.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Comma-separated list argument
fn optional_list(args: &HashMap<String, Value>, key: &str) -> Option<Vec<String>> {
    let fields: Vec<String> = match args.get(key)? {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .collect(),
        Value::String(s) => s.split(',').map(|f| f.trim().to_string()).collect(),
        _ => return None,
    };

    let fields: Vec<String> = fields.into_iter().filter(|f| !f.is_empty()).collect();
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

/// Parse a non-negative number argument (handles both string and number types)
fn parse_number_arg(args: &HashMap<String, Value>, key: &str) -> Result<Option<u32>, ConnectorError> {
    let invalid = |raw: &Value| {
        ConnectorError::InvalidArgument(format!(
            "{} must be a non-negative integer, got {}",
            key, raw
        ))
    };

    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(v @ Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(v)),
        Some(v @ Value::String(s)) => s.trim().parse::<u32>().map(Some).map_err(|_| invalid(v)),
        Some(v) => Err(invalid(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialResolver;
    use crate::catalog::ServiceCatalog;
    use crate::config::{RuntimeConfig, SecretsSection, Settings};
    use crate::odata::session::CSRF_HEADER;
    use wiremock::matchers::{header, method, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CATALOG: &str = r#"
services:
  - id: sales_order
    name: Sales Order Service
    path: /sap/opu/odata/sap/ZSD004_SRV
    entities:
      - name: zsd004Set
        key_field: OrderID
  - id: flight
    name: Flight Demo
    path: /sap/opu/odata/iwfnd/RMTSAMPLEFLIGHT
"#;

    fn server(host: &str) -> SapMcpServer {
        let mut settings = Settings::default();
        settings.set("SAP_HOST", host);
        settings.set("SAP_USERNAME", "user");
        settings.set("SAP_PASSWORD", "pw");
        let secrets = SecretsSection {
            enabled: false,
            ..Default::default()
        };

        let connector = SapConnector::new(
            Arc::new(CredentialResolver::new(settings, secrets)),
            ServiceCatalog::from_yaml(CATALOG).unwrap(),
            RuntimeConfig {
                retry_delay_ms: 1,
                ..Default::default()
            },
        );
        SapMcpServer::new(Arc::new(connector))
    }

    fn args(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_number_arg() {
        let a = args(json!({ "top": 5, "skip": "10", "zero": 0, "neg": -1, "bad": "x" }));
        assert_eq!(parse_number_arg(&a, "top").unwrap(), Some(5));
        assert_eq!(parse_number_arg(&a, "skip").unwrap(), Some(10));
        assert_eq!(parse_number_arg(&a, "zero").unwrap(), Some(0));
        assert_eq!(parse_number_arg(&a, "missing").unwrap(), None);
        assert!(parse_number_arg(&a, "neg").is_err());
        assert!(parse_number_arg(&a, "bad").is_err());
    }

    #[test]
    fn test_optional_list() {
        let a = args(json!({ "select": "OrderID, Status,,", "arr": ["A", " B "], "empty": "" }));
        assert_eq!(
            optional_list(&a, "select"),
            Some(vec!["OrderID".to_string(), "Status".to_string()])
        );
        assert_eq!(
            optional_list(&a, "arr"),
            Some(vec!["A".to_string(), "B".to_string()])
        );
        assert_eq!(optional_list(&a, "empty"), None);
    }

    struct Unserializable;

    impl serde::Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not representable"))
        }
    }

    #[test]
    fn test_serialization_failure_is_internal() {
        let err = to_json(&Unserializable).unwrap_err();
        assert!(matches!(err, ConnectorError::Internal(_)));
        assert_eq!(
            err.to_string(),
            "Internal error: Failed to serialize result: not representable"
        );
    }

    #[test]
    fn test_tools_listed() {
        let names: Vec<String> = server("sap").get_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "sap_list_services",
                "sap_query",
                "sap_get_entity",
                "sap_authenticate",
                "sap_reload_services"
            ]
        );
    }

    #[tokio::test]
    async fn test_list_services_tool() {
        let result = server("sap")
            .dispatch("sap_list_services", &HashMap::new())
            .await;
        assert_eq!(result["success"], true);
        assert_eq!(result["count"], 2);
        assert_eq!(result["services"][1]["id"], "flight");
    }

    #[tokio::test]
    async fn test_unknown_service_is_structured_failure() {
        let result = server("sap")
            .dispatch(
                "sap_query",
                &args(json!({ "service": "x", "entity_set": "y" })),
            )
            .await;
        assert_eq!(
            result,
            json!({
                "success": false,
                "error": "Service 'x' not found. Available: sales_order, flight"
            })
        );
    }

    #[tokio::test]
    async fn test_missing_parameter_is_structured_failure() {
        let result = server("sap")
            .dispatch("sap_get_entity", &args(json!({ "service": "sales_order" })))
            .await;
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "Invalid argument: Missing required parameter: entity_set");
    }

    #[tokio::test]
    async fn test_transport_failure_is_structured() {
        let result = server("http://127.0.0.1:9")
            .dispatch(
                "sap_get_entity",
                &args(json!({
                    "service": "sales_order",
                    "entity_set": "zsd004Set",
                    "entity_key": "91000092"
                })),
            )
            .await;
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("HTTP error"));
    }

    #[tokio::test]
    async fn test_query_and_get_entity_tools() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header(CSRF_HEADER, "Fetch"))
            .respond_with(ResponseTemplate::new(200).insert_header(CSRF_HEADER, "tok"))
            .expect(1)
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"/zsd004Set$"))
            .and(query_param("$top", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "d": { "results": [] } })))
            .expect(1)
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"/zsd004Set\(91000092\)$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "d": { "__metadata": { "type": "T" }, "OrderID": "91000092" }
            })))
            .expect(1)
            .mount(&mock)
            .await;

        let server = server(&mock.uri());

        let query = server
            .dispatch(
                "sap_query",
                &args(json!({ "service": "sales_order", "entity_set": "zsd004Set", "top": 0 })),
            )
            .await;
        assert_eq!(query, json!({ "results": [], "count": 0 }));

        let entity = server
            .dispatch(
                "sap_get_entity",
                &args(json!({
                    "service": "sales_order",
                    "entity_set": "zsd004Set",
                    "entity_key": "91000092"
                })),
            )
            .await;
        assert_eq!(entity["success"], true);
        assert_eq!(entity["key_field"], "OrderID");
        assert_eq!(entity["data"]["d"]["OrderID"], "91000092");
    }

    #[tokio::test]
    async fn test_handle_request_round() {
        let server = server("sap");

        let init: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}
        }))
        .unwrap();
        let response = server.handle_request(init).await.unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "sap-odata-mcp");

        let notification: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(server.handle_request(notification).await.is_none());

        let call: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": { "name": "sap_query", "arguments": { "service": "nope", "entity_set": "x" } }
        }))
        .unwrap();
        let response = server.handle_request(call).await.unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);

        let unknown: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 3, "method": "resources/list"
        }))
        .unwrap();
        let response = server.handle_request(unknown).await.unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_query_tool_forwards_orderby_and_expand() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header(CSRF_HEADER, "Fetch"))
            .respond_with(ResponseTemplate::new(200).insert_header(CSRF_HEADER, "tok"))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"/zsd004Set$"))
            .and(query_param("$orderby", "OrderID desc"))
            .and(query_param("$expand", "ToItems,ToCustomer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "d": { "results": [{
                "__metadata": { "type": "T" },
                "OrderID": "2",
                "ToCustomer": { "__metadata": { "type": "C" }, "Name": "ACME" },
                "ToItems": { "results": [{ "__metadata": { "type": "I" }, "Item": "10" }] },
                "ToNotes": { "__deferred": { "uri": "n" } }
            }]}})))
            .expect(1)
            .mount(&mock)
            .await;

        let result = server(&mock.uri())
            .dispatch(
                "sap_query",
                &args(json!({
                    "service": "sales_order",
                    "entity_set": "zsd004Set",
                    "orderby": "OrderID desc",
                    "expand": "ToItems, ToCustomer"
                })),
            )
            .await;

        assert_eq!(
            result,
            json!({
                "results": [{
                    "OrderID": "2",
                    "ToCustomer": { "Name": "ACME" },
                    "ToItems": { "results": [{ "Item": "10" }] }
                }],
                "count": 1
            })
        );
    }
}
