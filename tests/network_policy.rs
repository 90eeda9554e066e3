//! Network mediation end-to-end: allowlist pass-through without a prompt,
//! prompted denial wording, and the denied-call audit trail.

mod common;

use common::{ScriptedPrompt, build_harness};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const NET_EXTENSION: &str = r#"
import { commands, network } from "formula";

export async function activate() {
  await commands.registerCommand("t.net.fetch", async (url) => network.fetch(url));
}
"#;

fn net_manifest() -> Value {
    json!({
        "publisher": "t",
        "name": "net",
        "version": "1.0.0",
        "main": "./e.js",
        "engines": { "formula": "^1.0.0" },
        "activationEvents": ["onCommand:t.net.fetch"],
        "contributes": {
            "commands": [{ "command": "t.net.fetch", "title": "Fetch" }]
        },
        "permissions": ["ui.commands", "network"]
    })
}

/// One-shot HTTP server answering every request with `200 ok`.
async fn serve_ok() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                    )
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://127.0.0.1:{}/", addr.port())
}

#[tokio::test(flavor = "multi_thread")]
async fn allowlisted_host_fetches_without_prompting() {
    let harness = build_harness(ScriptedPrompt::deny_all(), |_| {});
    harness.seed_permissions(&json!({
        "t.net": {
            "ui.commands": true,
            "network": { "mode": "allowlist", "hosts": ["127.0.0.1"] }
        }
    }));
    let root = harness.write_extension("net", &net_manifest(), &[("e.js", NET_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();

    let url = serve_ok().await;
    let response = harness
        .host
        .execute_command("t.net.fetch", vec![json!(url)])
        .await
        .unwrap();

    assert_eq!(response["ok"], json!(true));
    assert_eq!(response["status"], json!(200));
    assert_eq!(response["bodyText"], json!("ok"));
    assert_eq!(harness.prompt.request_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_allowlisted_host_prompts_and_denial_is_audited() {
    let harness = build_harness(ScriptedPrompt::deny_all(), |_| {});
    harness.seed_permissions(&json!({
        "t.net": {
            "ui.commands": true,
            "network": { "mode": "allowlist", "hosts": ["allowed.example"] }
        }
    }));
    let root = harness.write_extension("net", &net_manifest(), &[("e.js", NET_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();

    let err = harness
        .host
        .execute_command("t.net.fetch", vec![json!("https://blocked.example/")])
        .await
        .unwrap_err();

    assert_eq!(err.name(), "PermissionError");
    assert_eq!(
        err.to_string(),
        "Permission denied: network (blocked.example)"
    );
    assert_eq!(harness.prompt.request_count(), 1);
    let prompt = harness.prompt.last_request().unwrap();
    assert_eq!(prompt.extension_id, "t.net");
    assert_eq!(prompt.request["url"], json!("https://blocked.example/"));

    let events = harness.audit.events.lock().unwrap();
    let denied = events
        .iter()
        .find(|event| event.action == "network.denied")
        .expect("denied network call is audited");
    assert_eq!(denied.url.as_deref(), Some("https://blocked.example/"));
    assert_eq!(denied.api_key.as_deref(), Some("network.fetch"));
    assert_eq!(denied.principal.id, "t.net");
}

#[tokio::test(flavor = "multi_thread")]
async fn prompted_grant_extends_the_allowlist_for_next_time() {
    let harness = build_harness(ScriptedPrompt::allow_all(), |_| {});
    harness.seed_permissions(&json!({
        "t.net": {
            "ui.commands": true,
            "network": { "mode": "allowlist", "hosts": [] }
        }
    }));
    let root = harness.write_extension("net", &net_manifest(), &[("e.js", NET_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();

    let url = serve_ok().await;
    harness
        .host
        .execute_command("t.net.fetch", vec![json!(url)])
        .await
        .unwrap();
    assert_eq!(harness.prompt.request_count(), 1);

    // Second call: the hostname is allowlisted now, no second prompt.
    harness
        .host
        .execute_command("t.net.fetch", vec![json!(url)])
        .await
        .unwrap();
    assert_eq!(harness.prompt.request_count(), 1);

    let raw =
        std::fs::read_to_string(harness.data_root().join("permissions.json")).unwrap();
    let grants: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        grants["t.net"]["network"]["hosts"],
        json!(["127.0.0.1"])
    );
}
