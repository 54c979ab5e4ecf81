//! Tool definitions and registry for the MCP server.
//!
//! Every tool is a thin consumer of the [`ConnectionManager`]: it validates
//! its arguments, borrows a page handle for one scoped callback, and formats
//! the result. Argument validation happens before any automation I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::connection::{ConnectOptions, ConnectionManager};
use crate::driver::{Element, Page};
use crate::error::{Error, Result};
use crate::protocol::{ToolCallResult, ToolDefinition};

/// Upper bound for the timed-wait tool.
const MAX_TIMED_WAIT: Duration = Duration::from_secs(60);

/// Tool trait for implementing MCP tools.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult>;
}

/// Context passed to tools during execution.
pub struct ToolContext {
    /// The shared connection manager. Tools never hold a session themselves.
    pub manager: Arc<ConnectionManager>,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    context: Arc<ToolContext>,
}

impl ToolRegistry {
    /// Create a registry with the built-in Mini Program tools.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let context = Arc::new(ToolContext { manager });
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();

        let built_in: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ConnectTool),
            Arc::new(DisconnectTool),
            Arc::new(PageDataTool),
            Arc::new(SetPageDataTool),
            Arc::new(CallMethodTool),
            Arc::new(ElementTool),
            Arc::new(ElementsTool),
            Arc::new(WaitForTool),
            Arc::new(WaitTool),
        ];
        for tool in built_in {
            tools.insert(tool.definition().name.clone(), tool);
        }

        Self { tools, context }
    }

    /// Get tool definitions.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        tool.execute(arguments, &self.context).await
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))
}

/// JSON schema fragment for the shared `connection` override argument.
fn connection_schema() -> Value {
    json!({
        "type": "object",
        "description": "Optional connection overrides",
        "properties": {
            "wsEndpoint": {
                "type": "string",
                "description": "Automation endpoint, e.g. ws://127.0.0.1:9420"
            },
            "port": {
                "type": "integer",
                "description": "Automation port on localhost"
            },
            "connectTimeoutMs": {
                "type": "integer",
                "description": "Connection timeout in milliseconds"
            },
            "reconnect": {
                "type": "boolean",
                "description": "Discard any live session and connect from scratch"
            }
        }
    })
}

async fn summarize(element: &Element, include_wxml: bool, attributes: &[String]) -> Result<Value> {
    let mut summary = json!({ "tagName": element.tag_name });
    let text = element.text().await.unwrap_or_default();
    if !text.is_empty() {
        summary["text"] = json!(text);
    }
    if include_wxml {
        summary["wxml"] = json!(element.outer_wxml().await?);
    }
    if !attributes.is_empty() {
        let mut values = serde_json::Map::new();
        for name in attributes {
            // Absent attributes are skipped rather than reported as null.
            if let Some(value) = element.attribute(name).await? {
                values.insert(name.clone(), json!(value));
            }
        }
        summary["attributes"] = Value::Object(values);
    }
    Ok(summary)
}

fn pretty(value: &Value) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| Error::Internal(e.to_string()))
}

// ============================================================================
// Built-in Tools
// ============================================================================

/// Tool for establishing (or re-establishing) the automation connection.
pub struct ConnectTool;

#[async_trait::async_trait]
impl Tool for ConnectTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "miniprogram_connect".into(),
            description: "Connect to the Mini Program running in WeChat DevTools. Reuses an existing connection unless reconnect is true.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "wsEndpoint": {
                        "type": "string",
                        "description": "Automation endpoint, e.g. ws://127.0.0.1:9420"
                    },
                    "port": {
                        "type": "integer",
                        "description": "Automation port on localhost"
                    },
                    "connectTimeoutMs": {
                        "type": "integer",
                        "description": "Connection timeout in milliseconds"
                    },
                    "reconnect": {
                        "type": "boolean",
                        "description": "Discard any live session and connect from scratch"
                    }
                },
                "required": []
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let options: ConnectOptions = parse_args(arguments)?;

        let session = context.manager.ensure_connection(Some(options)).await?;
        let page = Page::current(session).await?;

        Ok(ToolCallResult::text(format!(
            "Connected to Mini Program automation endpoint.\n\n- **Current page**: {}",
            page.path
        )))
    }
}

/// Tool for releasing the automation connection.
pub struct DisconnectTool;

#[async_trait::async_trait]
impl Tool for DisconnectTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "miniprogram_disconnect".into(),
            description: "Disconnect from the Mini Program. Safe to call when no connection exists.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    async fn execute(&self, _arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        context.manager.close().await;
        Ok(ToolCallResult::text("Disconnected from the Mini Program."))
    }
}

/// Tool for reading page data.
pub struct PageDataTool;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageDataArgs {
    /// Dotted path selecting a sub-field of the data, e.g. `user.name`.
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    connection: Option<ConnectOptions>,
}

#[async_trait::async_trait]
impl Tool for PageDataTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "miniprogram_page_data".into(),
            description: "Get the data of the current page, optionally narrowed to a dotted path.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Dotted path within page data, e.g. user.name"
                    },
                    "connection": connection_schema()
                },
                "required": []
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: PageDataArgs = parse_args(arguments)?;

        let data = context
            .manager
            .with_page(args.connection, |page| async move {
                page.data(args.path.as_deref()).await
            })
            .await?;

        Ok(ToolCallResult::text(pretty(&data)?))
    }
}

/// Tool for writing page data.
pub struct SetPageDataTool;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPageDataArgs {
    /// Object merged into page data, same semantics as `Page.setData`.
    data: Value,
    #[serde(default)]
    connection: Option<ConnectOptions>,
}

#[async_trait::async_trait]
impl Tool for SetPageDataTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "miniprogram_set_page_data".into(),
            description: "Set data on the current page. Keys may use dotted paths, same as Page.setData.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "data": {
                        "type": "object",
                        "description": "Object merged into the page data"
                    },
                    "connection": connection_schema()
                },
                "required": ["data"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: SetPageDataArgs = parse_args(arguments)?;
        let keys: Vec<String> = match args.data.as_object() {
            Some(map) if !map.is_empty() => map.keys().cloned().collect(),
            Some(_) => return Err(Error::InvalidParams("data must not be empty".into())),
            None => return Err(Error::InvalidParams("data must be an object".into())),
        };

        context
            .manager
            .with_page(args.connection, |page| async move {
                page.set_data(args.data).await
            })
            .await?;

        Ok(ToolCallResult::text(format!(
            "Page data updated: {}",
            keys.join(", ")
        )))
    }
}

/// Tool for invoking a page method.
pub struct CallMethodTool;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallMethodArgs {
    /// Method name defined on the page instance.
    method: String,
    /// Positional JSON arguments.
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    connection: Option<ConnectOptions>,
}

#[async_trait::async_trait]
impl Tool for CallMethodTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "miniprogram_call_method".into(),
            description: "Call a method defined on the current page and return its result.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "method": {
                        "type": "string",
                        "description": "Method name defined on the page instance"
                    },
                    "args": {
                        "type": "array",
                        "description": "Positional JSON arguments"
                    },
                    "connection": connection_schema()
                },
                "required": ["method"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: CallMethodArgs = parse_args(arguments)?;
        if args.method.is_empty() {
            return Err(Error::InvalidParams("method must not be empty".into()));
        }

        let method = args.method.clone();
        let result = context
            .manager
            .with_page(args.connection, |page| async move {
                page.call_method(&args.method, args.args).await
            })
            .await?;

        Ok(ToolCallResult::text(format!(
            "Result of `{}`:\n{}",
            method,
            pretty(&result)?
        )))
    }
}

/// Tool for querying a single element.
pub struct ElementTool;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElementArgs {
    /// WXML selector, e.g. `.list-item` or `view > button`.
    selector: String,
    /// Include the raw outer WXML markup in the summary.
    #[serde(default)]
    include_wxml: bool,
    /// Attribute names to read from the element.
    #[serde(default)]
    attributes: Vec<String>,
    #[serde(default)]
    connection: Option<ConnectOptions>,
}

#[async_trait::async_trait]
impl Tool for ElementTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "miniprogram_element".into(),
            description: "Find one element on the current page by selector and summarize it.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "selector": {
                        "type": "string",
                        "description": "WXML selector"
                    },
                    "includeWxml": {
                        "type": "boolean",
                        "description": "Include the raw outer WXML markup"
                    },
                    "attributes": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Attribute names to read from the element"
                    },
                    "connection": connection_schema()
                },
                "required": ["selector"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ElementArgs = parse_args(arguments)?;
        if args.selector.is_empty() {
            return Err(Error::InvalidParams("selector must not be empty".into()));
        }

        let selector = args.selector.clone();
        let summary = context
            .manager
            .with_page(args.connection, |page| async move {
                match page.element(&args.selector).await? {
                    Some(element) => Ok(Some(
                        summarize(&element, args.include_wxml, &args.attributes).await?,
                    )),
                    None => Ok(None),
                }
            })
            .await?;

        match summary {
            Some(summary) => Ok(ToolCallResult::text(pretty(&summary)?)),
            None => Ok(ToolCallResult {
                content: vec![crate::protocol::ContentItem::text(format!(
                    "No element matched selector `{selector}`."
                ))],
                is_error: true,
            }),
        }
    }
}

/// Tool for querying all elements matching a selector.
pub struct ElementsTool;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElementsArgs {
    selector: String,
    #[serde(default)]
    include_wxml: bool,
    #[serde(default)]
    attributes: Vec<String>,
    #[serde(default)]
    connection: Option<ConnectOptions>,
}

#[async_trait::async_trait]
impl Tool for ElementsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "miniprogram_elements".into(),
            description: "Find all elements on the current page matching a selector and summarize them.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "selector": {
                        "type": "string",
                        "description": "WXML selector"
                    },
                    "includeWxml": {
                        "type": "boolean",
                        "description": "Include the raw outer WXML markup of each element"
                    },
                    "attributes": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Attribute names to read from each element"
                    },
                    "connection": connection_schema()
                },
                "required": ["selector"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ElementsArgs = parse_args(arguments)?;
        if args.selector.is_empty() {
            return Err(Error::InvalidParams("selector must not be empty".into()));
        }

        let selector = args.selector.clone();
        let summaries = context
            .manager
            .with_page(args.connection, |page| async move {
                let elements = page.elements(&args.selector).await?;
                let mut summaries = Vec::with_capacity(elements.len());
                for element in &elements {
                    summaries.push(summarize(element, args.include_wxml, &args.attributes).await?);
                }
                Ok(summaries)
            })
            .await?;

        Ok(ToolCallResult::text(format!(
            "{} element(s) matched `{}`:\n{}",
            summaries.len(),
            selector,
            pretty(&json!(summaries))?
        )))
    }
}

/// Tool for waiting until a selector matches.
pub struct WaitForTool;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitForArgs {
    selector: String,
    /// Wait deadline in milliseconds; defaults to the global timeout.
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    connection: Option<ConnectOptions>,
}

#[async_trait::async_trait]
impl Tool for WaitForTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "miniprogram_wait_for".into(),
            description: "Wait until an element matching the selector appears on the current page.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "selector": {
                        "type": "string",
                        "description": "WXML selector"
                    },
                    "timeoutMs": {
                        "type": "integer",
                        "description": "Wait deadline in milliseconds (defaults to the global timeout)"
                    },
                    "connection": connection_schema()
                },
                "required": ["selector"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: WaitForArgs = parse_args(arguments)?;
        if args.selector.is_empty() {
            return Err(Error::InvalidParams("selector must not be empty".into()));
        }
        let timeout = args
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| context.manager.default_timeout());

        let selector = args.selector.clone();
        let summary = context
            .manager
            .with_page(args.connection, |page| async move {
                let element = page.wait_for(&args.selector, timeout).await?;
                summarize(&element, false, &[]).await
            })
            .await?;

        Ok(ToolCallResult::text(format!(
            "Element matched `{}`:\n{}",
            selector,
            pretty(&summary)?
        )))
    }
}

/// Tool for a plain timed wait.
pub struct WaitTool;

#[derive(Debug, Deserialize)]
struct WaitArgs {
    /// Milliseconds to wait.
    ms: u64,
}

#[async_trait::async_trait]
impl Tool for WaitTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "miniprogram_wait".into(),
            description: "Wait for a fixed number of milliseconds (at most 60000).".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ms": {
                        "type": "integer",
                        "description": "Milliseconds to wait (at most 60000)"
                    }
                },
                "required": ["ms"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, _context: &ToolContext) -> Result<ToolCallResult> {
        let args: WaitArgs = parse_args(arguments)?;
        let wait = Duration::from_millis(args.ms);
        if wait > MAX_TIMED_WAIT {
            return Err(Error::InvalidParams(format!(
                "ms must be at most {}",
                MAX_TIMED_WAIT.as_millis()
            )));
        }

        tokio::time::sleep(wait).await;
        Ok(ToolCallResult::text(format!("Waited {} ms.", args.ms)))
    }
}
