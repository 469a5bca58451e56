//! Integration tests for the `fabric serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port with its
//! own temporary data directory and no peers, then speaks raw HTTP to it.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

/// Base port is derived from the process ID so separate test binaries don't
/// collide on the same range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// A running `fabric serve` child. Killed on drop.
struct Server {
    port: u16,
    child: Child,
    data_dir: TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Server {
    fn start() -> Self {
        let port = next_port();
        let data_dir = tempfile::tempdir().expect("tempdir");

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_fabric"));
        cmd.arg("serve")
            .arg("--port")
            .arg(port.to_string())
            .arg("--scenario")
            .arg("fabric-test")
            .arg("--data-dir")
            .arg(data_dir.path())
            .env_remove("FABRIC_PEERS")
            .env_remove("FABRIC_PORT")
            .env_remove("RUST_LOG");
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn().expect("failed to start fabric serve");
        for _ in 0..50 {
            if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Server {
            port,
            child,
            data_dir,
        }
    }

    fn write_manifest(&self, content: &str) -> String {
        let path = self.data_dir.path().join("service.json");
        std::fs::write(&path, content).expect("write manifest");
        path.display().to_string()
    }

    fn get(&self, path: &str) -> (u16, Value) {
        request(self.port, "GET", path, None)
    }

    fn post(&self, path: &str, body: &Value) -> (u16, Value) {
        request(self.port, "POST", path, Some(&body.to_string()))
    }

    fn put(&self, path: &str, body: &Value) -> (u16, Value) {
        request(self.port, "PUT", path, Some(&body.to_string()))
    }

    fn delete(&self, path: &str) -> (u16, Value) {
        request(self.port, "DELETE", path, None)
    }
}

/// Send one request and return (status, JSON body). A non-JSON body comes
/// back as a JSON string.
fn request(port: u16, method: &str, path: &str, body: Option<&str>) -> (u16, Value) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let request = match body {
        Some(body) => format!(
            "{} {} HTTP/1.1\r\nHost: localhost:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            method, path, port, body.len(), body
        ),
        None => format!(
            "{} {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
            method, path, port
        ),
    };
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);

    let (status, body) = parse_http_response(&response);
    let value = serde_json::from_str(&body).unwrap_or(Value::String(body));
    (status, value)
}

/// Parse an HTTP response into (status_code, body).
fn parse_http_response(response: &str) -> (u16, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status = headers
        .lines()
        .next()
        .unwrap_or("")
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let chunked = headers
        .to_ascii_lowercase()
        .contains("transfer-encoding: chunked");
    let body = if chunked { decode_chunked(&body) } else { body };
    (status, body)
}

/// Decode chunked transfer encoding.
fn decode_chunked(data: &str) -> String {
    let mut result = String::new();
    let mut remaining = data;

    while let Some(line_end) = remaining.find("\r\n") {
        let size = match usize::from_str_radix(remaining[..line_end].trim(), 16) {
            Ok(s) => s,
            Err(_) => break,
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > remaining.len() {
            result.push_str(&remaining[chunk_start..]);
            break;
        }
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = remaining.get(chunk_end + 2..).unwrap_or("");
    }

    result
}

fn form(manifest_path: &str, template: &str) -> Value {
    json!({
        "bundle_manifest_path": manifest_path,
        "preflight_secrets": {"API_KEY": "sk-live-123"},
        "template_type": template,
        "framework": "electron",
        "deployment_mode": "bundled",
        "app_name": "picker",
        "platforms": ["linux", "win"],
        "output_location": "/tmp/out",
    })
}

fn all_stage_results() -> Value {
    json!({
        "bundle": {"ok": true},
        "preflight": {"ok": true},
        "generate": {"ok": true},
        "build": {"ok": true},
        "smoketest": {"ok": true},
    })
}

const STATE: &str = "/api/v1/scenarios/picker/state";

/// Save a fully validated state and return its hash.
fn seed(server: &Server, manifest: &str) -> String {
    let (status, body) = server.put(
        STATE,
        &json!({
            "form_state": form(manifest, "spa"),
            "compute_hash": true,
            "stage_results": all_stage_results(),
        }),
    );
    assert_eq!(status, 200, "seed failed: {}", body);
    assert_eq!(body["success"], true);
    let hash = body["hash"].as_str().unwrap().to_string();
    assert_eq!(hash.len(), 64);
    hash
}

// ──────────────────────────────────────────────
// General
// ──────────────────────────────────────────────

#[test]
fn health_reports_hosting_scenario() {
    let server = Server::start();
    let (status, body) = server.get("/health");
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["scenario"], "fabric-test");
    assert_eq!(body["peers"], json!([]));
}

#[test]
fn unknown_route_is_json_404() {
    let server = Server::start();
    let (status, body) = server.get("/api/v1/nope");
    assert_eq!(status, 404);
    assert_eq!(body["error"], "not found");
}

// ──────────────────────────────────────────────
// Tools
// ──────────────────────────────────────────────

#[test]
fn tool_surface_is_empty_without_peers() {
    let server = Server::start();

    let (status, body) = server.get("/api/v1/tools");
    assert_eq!(status, 200);
    assert_eq!(body["tools"], json!([]));

    let (status, body) = server.get("/api/v1/tools/scenarios");
    assert_eq!(status, 200);
    assert_eq!(body["scenarios"], json!([]));

    let (status, body) = server.post("/api/v1/tools/refresh", &json!({}));
    assert_eq!(status, 200);
    assert_eq!(body["refresh"]["tool_count"], 0);
    assert_eq!(body["sync"]["registered"], json!([]));
}

#[test]
fn unknown_tool_call_returns_failed_record() {
    let server = Server::start();
    let (status, body) = server.post(
        "/api/v1/chats/chat-1/tool-calls",
        &json!({"tool_call_id": "tc-1", "tool_name": "nope", "arguments": "{}"}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["id"], "tc-1");
    assert_eq!(body["chat_id"], "chat-1");
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error_message"], "unknown tool: nope");
    assert_eq!(body["error_code"], "UNKNOWN_TOOL");
    assert!(body["completed_at"].is_string());
}

#[test]
fn tool_call_without_id_is_rejected() {
    let server = Server::start();
    let (status, body) = server.post(
        "/api/v1/chats/chat-1/tool-calls",
        &json!({"tool_call_id": "", "tool_name": "nope"}),
    );
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("tool_call_id"));
}

// ──────────────────────────────────────────────
// State
// ──────────────────────────────────────────────

#[test]
fn missing_state_loads_as_not_found() {
    let server = Server::start();
    let (status, body) = server.get(STATE);
    assert_eq!(status, 200);
    assert_eq!(body["found"], false);
    assert!(body.get("state").is_none());
}

#[test]
fn saved_state_loads_with_blank_secrets() {
    let server = Server::start();
    let manifest = server.write_manifest(r#"{"name": "picker"}"#);
    let hash = seed(&server, &manifest);

    let (status, body) = server.get(&format!("{}?validate_manifest=true", STATE));
    assert_eq!(status, 200);
    assert_eq!(body["found"], true);
    assert_eq!(body["manifest_changed"], false);
    let state = &body["state"];
    assert_eq!(state["hash"], hash.as_str());
    assert_eq!(state["schema_version"], 1);
    assert_eq!(state["form_state"]["preflight_secrets"], json!({"API_KEY": ""}));
    assert_eq!(state["stages"]["generate"]["status"], "valid");

    let on_disk = std::fs::read_to_string(
        Path::new(server.data_dir.path())
            .join("state")
            .join("picker.json"),
    )
    .unwrap();
    assert!(!on_disk.contains("sk-live-123"));
}

#[test]
fn template_change_invalidates_generate_onward() {
    let server = Server::start();
    let manifest = server.write_manifest(r#"{"name": "picker"}"#);
    seed(&server, &manifest);

    let (status, body) = server.post(
        &format!("{}/check", STATE),
        &json!({"current_config": form(&manifest, "spa")}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["valid"], true);
    assert_eq!(body["changed"], false);

    let (status, body) = server.post(
        &format!("{}/check", STATE),
        &json!({"current_config": form(&manifest, "basic")}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["changed"], true);
    assert_eq!(body["affected_stages"], json!(["generate", "build", "smoketest"]));
    assert_eq!(body["status"]["overall_status"], "partial");
    assert_eq!(body["status"]["stages"]["bundle"]["can_reuse"], true);
    assert_eq!(body["status"]["stages"]["preflight"]["can_reuse"], true);
    assert_eq!(body["status"]["stages"]["generate"]["can_reuse"], false);
}

#[test]
fn stale_expected_hash_is_a_conflict() {
    let server = Server::start();
    let manifest = server.write_manifest(r#"{"name": "picker"}"#);
    let hash = seed(&server, &manifest);

    let (status, body) = server.put(
        STATE,
        &json!({"form_state": form(&manifest, "basic"), "expected_hash": "H0"}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["success"], false);
    assert_eq!(body["conflict"], true);
    assert_eq!(body["server_state"]["hash"], hash.as_str());
    assert_eq!(body["server_state"]["form_state"]["template_type"], "spa");

    let (_, body) = server.get(STATE);
    assert_eq!(body["state"]["hash"], hash.as_str());

    let (status, body) = server.put(
        STATE,
        &json!({"form_state": form(&manifest, "basic"), "expected_hash": hash}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_ne!(body["hash"], hash.as_str());
}

#[test]
fn invalidate_marks_downstream_stale() {
    let server = Server::start();
    let manifest = server.write_manifest(r#"{"name": "picker"}"#);
    seed(&server, &manifest);

    let (status, body) = server.post(
        &format!("{}/invalidate", STATE),
        &json!({"from_stage": "build", "reason": "toolchain upgraded"}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["overall_status"], "partial");
    assert_eq!(body["stages"]["generate"]["status"], "valid");
    assert_eq!(body["stages"]["build"]["status"], "stale");
    assert_eq!(body["stages"]["smoketest"]["staleness_reason"], "toolchain upgraded");

    let (status, body) = server.post(
        &format!("{}/stages/build/validate", STATE),
        &json!({"result": {"artifacts": 2}}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["stages"]["build"]["status"], "valid");
    assert_eq!(body["stages"]["smoketest"]["status"], "stale");
}

#[test]
fn log_tails_are_served_back_decompressed() {
    let server = Server::start();
    let content = "booting\nlistening on :8080\n";
    let (status, body) = server.put(
        STATE,
        &json!({
            "form_state": {"template_type": "spa"},
            "log_tails": [{"service_id": "api", "content": content}],
        }),
    );
    assert_eq!(status, 200, "{}", body);

    let (status, body) = server.get(&format!("{}/logs/api", STATE));
    assert_eq!(status, 200);
    assert_eq!(body["content"], content);
    assert_eq!(body["lines"], 2);

    let (status, body) = server.get(&format!("{}/logs/worker", STATE));
    assert_eq!(status, 404);
    assert_eq!(body["code"], "STATE_NOT_FOUND");
}

#[test]
fn clear_removes_state_and_listing() {
    let server = Server::start();
    let manifest = server.write_manifest(r#"{"name": "picker"}"#);
    seed(&server, &manifest);

    let (status, body) = server.get("/api/v1/scenarios/states");
    assert_eq!(status, 200);
    assert_eq!(body["states"][0]["scenario_name"], "picker");
    assert_eq!(body["states"][0]["overall_status"], "valid");

    let (status, body) = server.delete(STATE);
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);

    let (_, body) = server.get(STATE);
    assert_eq!(body["found"], false);
    let (_, body) = server.get("/api/v1/scenarios/states");
    assert_eq!(body["states"], json!([]));
}

#[test]
fn malformed_requests_are_400() {
    let server = Server::start();

    let (status, _) = request(server.port, "PUT", STATE, Some("{not json"));
    assert_eq!(status, 400);

    let (status, body) = server.post(
        &format!("{}/invalidate", STATE),
        &json!({"from_stage": "deploy"}),
    );
    assert_eq!(status, 400);
    assert!(body["error"].is_string());

    let (status, body) = server.post(&format!("{}/stages/deploy/validate", STATE), &json!({}));
    assert_eq!(status, 400);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, body) = server.get("/api/v1/scenarios/.hidden/state");
    assert_eq!(status, 400);
    assert_eq!(body["code"], "INVALID_REQUEST");
}
