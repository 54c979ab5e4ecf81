//! MCP server validation tests.
//!
//! Exercises JSON-RPC 2.0 protocol compliance against an in-process server.
//! No DevTools instance is required: none of these requests reach the
//! automation endpoint (validation and protocol errors short-circuit first).

use std::time::Duration;

use serde_json::{json, Value};

use wechat_miniprogram_mcp::{ConnectConfig, McpServer};

fn server() -> McpServer {
    // Port 1 is never a DevTools endpoint; any accidental connect attempt
    // fails fast instead of hanging.
    McpServer::new(ConnectConfig::new(
        "ws://127.0.0.1:1",
        Duration::from_millis(200),
    ))
}

async fn request(server: &McpServer, payload: Value) -> Value {
    let response = server
        .handle_message(&payload.to_string())
        .await
        .expect("request should produce a response");
    serde_json::to_value(response).expect("response should serialize")
}

async fn initialize(server: &McpServer) -> Value {
    request(
        server,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "0.1.0" }
            }
        }),
    )
    .await
}

// ============================================================================
// Protocol Compliance Tests
// ============================================================================

#[tokio::test]
async fn test_initialize_handshake() {
    let server = server();
    let response = initialize(&server).await;

    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 1);
    assert!(response.get("error").is_none(), "should not have error");

    let result = &response["result"];
    assert!(result.get("protocolVersion").is_some());
    assert_eq!(result["serverInfo"]["name"], "miniprogram-mcp");
    assert!(result["capabilities"].get("tools").is_some());
}

#[tokio::test]
async fn test_initialize_requires_params() {
    let server = server();
    let response = request(
        &server,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }),
    )
    .await;

    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn test_list_tools() {
    let server = server();
    initialize(&server).await;

    let response = request(
        &server,
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    assert!(response.get("error").is_none(), "should not have error");

    let tools = response["result"]["tools"]
        .as_array()
        .expect("tools should be an array");
    let names: Vec<&str> = tools
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();

    for expected in [
        "miniprogram_connect",
        "miniprogram_disconnect",
        "miniprogram_page_data",
        "miniprogram_set_page_data",
        "miniprogram_call_method",
        "miniprogram_element",
        "miniprogram_elements",
        "miniprogram_wait_for",
        "miniprogram_wait",
    ] {
        assert!(names.contains(&expected), "missing tool {expected}");
    }

    for tool in tools {
        assert!(tool["description"].as_str().is_some());
        assert_eq!(tool["inputSchema"]["type"], "object");
    }
}

#[tokio::test]
async fn test_tools_require_initialization() {
    let server = server();

    let response = request(
        &server,
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    assert!(response.get("error").is_some(), "should require initialize");

    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": { "name": "miniprogram_wait", "arguments": { "ms": 1 } }
        }),
    )
    .await;
    assert!(response.get("error").is_some(), "should require initialize");
}

#[tokio::test]
async fn test_ping() {
    let server = server();
    let response = request(
        &server,
        json!({ "jsonrpc": "2.0", "id": 7, "method": "ping" }),
    )
    .await;

    assert!(response.get("error").is_none());
    assert_eq!(response["result"], json!({}));
}

#[tokio::test]
async fn test_notifications_produce_no_response() {
    let server = server();
    let response = server
        .handle_message(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }).to_string())
        .await;
    assert!(response.is_none());
}

// ============================================================================
// Error Handling Tests
// ============================================================================

#[tokio::test]
async fn test_unknown_method_error() {
    let server = server();
    let response = request(
        &server,
        json!({ "jsonrpc": "2.0", "id": 99, "method": "nonexistent/method" }),
    )
    .await;

    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn test_parse_error() {
    let server = server();
    let response = server
        .handle_message("this is not json")
        .await
        .expect("parse failure should produce an error response");

    let value = serde_json::to_value(response).unwrap();
    assert_eq!(value["error"]["code"], -32700);
}

#[tokio::test]
async fn test_unknown_tool_error() {
    let server = server();
    initialize(&server).await;

    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": 100,
            "method": "tools/call",
            "params": { "name": "nonexistent_tool", "arguments": {} }
        }),
    )
    .await;

    assert_eq!(response["error"]["code"], -32601);
    let message = response["error"]["message"].as_str().unwrap();
    assert!(message.contains("not found"), "got: {message}");
}

#[tokio::test]
async fn test_invalid_tool_arguments_are_rejected_locally() {
    let server = server();
    initialize(&server).await;

    // Missing required selector.
    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": 101,
            "method": "tools/call",
            "params": { "name": "miniprogram_element", "arguments": {} }
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);

    // data must be an object.
    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": 102,
            "method": "tools/call",
            "params": { "name": "miniprogram_set_page_data", "arguments": { "data": 5 } }
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
    let message = response["error"]["message"].as_str().unwrap();
    assert!(message.contains("data"), "got: {message}");
}

#[tokio::test]
async fn test_connect_failure_is_a_structured_error() {
    let server = server();
    initialize(&server).await;

    // Nothing listens on port 1; the connect attempt must fail with a
    // connection error, not hang or panic.
    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": 103,
            "method": "tools/call",
            "params": { "name": "miniprogram_connect", "arguments": {} }
        }),
    )
    .await;

    let error = response
        .get("error")
        .expect("connect to a dead endpoint should fail");
    assert_eq!(error["code"], -32000);
}

// ============================================================================
// Tool Execution Tests
// ============================================================================

#[tokio::test]
async fn test_timed_wait_tool() {
    let server = server();
    initialize(&server).await;

    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": 104,
            "method": "tools/call",
            "params": { "name": "miniprogram_wait", "arguments": { "ms": 10 } }
        }),
    )
    .await;

    assert!(response.get("error").is_none());
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("10"), "got: {text}");
}

#[tokio::test]
async fn test_disconnect_without_connection() {
    let server = server();
    initialize(&server).await;

    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": 105,
            "method": "tools/call",
            "params": { "name": "miniprogram_disconnect", "arguments": {} }
        }),
    )
    .await;

    assert!(response.get("error").is_none(), "disconnect is idempotent");
}

#[tokio::test]
async fn test_shutdown() {
    let server = server();
    initialize(&server).await;

    let response = request(
        &server,
        json!({ "jsonrpc": "2.0", "id": 106, "method": "shutdown" }),
    )
    .await;
    assert!(response.get("error").is_none());
}
