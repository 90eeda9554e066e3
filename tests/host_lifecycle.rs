//! Worker lifecycle end-to-end: concurrent activation coalescing, command
//! timeouts with termination and lazy respawn, reload/unload bookkeeping,
//! and view-driven activation.

mod common;

use common::{ScriptedPrompt, build_harness, harness};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

const COUNTER_EXTENSION: &str = r#"
import { commands } from "formula";

let counter = 0;

export async function activate() {
  await new Promise((resolve) => setTimeout(resolve, 50));
  counter += 1;
  await commands.registerCommand("t.x.a", async () => counter);
  await commands.registerCommand("t.x.b", async () => counter);
}
"#;

fn counter_manifest() -> serde_json::Value {
    json!({
        "publisher": "t",
        "name": "x",
        "version": "1.0.0",
        "main": "./e.js",
        "engines": { "formula": "^1.0.0" },
        "activationEvents": ["onCommand:t.x.a", "onCommand:t.x.b"],
        "contributes": {
            "commands": [
                { "command": "t.x.a", "title": "A" },
                { "command": "t.x.b", "title": "B" }
            ]
        },
        "permissions": ["ui.commands"]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_commands_activate_exactly_once() {
    let harness = harness();
    let root = harness.write_extension("counter", &counter_manifest(), &[("e.js", COUNTER_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();

    let (a, b) = tokio::join!(
        harness.host.execute_command("t.x.a", vec![]),
        harness.host.execute_command("t.x.b", vec![]),
    );

    // Both triggers coalesced onto one activation: the counter bumped once.
    assert_eq!(a.unwrap(), json!(1));
    assert_eq!(b.unwrap(), json!(1));
}

const LOOPING_EXTENSION: &str = r#"
import { commands } from "formula";

export async function activate() {
  await commands.registerCommand("t.loop.spin", async () => { for (;;) {} });
  await commands.registerCommand("t.loop.quick", async () => "ok");
}
"#;

fn looping_manifest() -> serde_json::Value {
    json!({
        "publisher": "t",
        "name": "loop",
        "version": "1.0.0",
        "main": "./e.js",
        "engines": { "formula": "^1.0.0" },
        "activationEvents": ["onCommand:t.loop.spin", "onCommand:t.loop.quick"],
        "contributes": {
            "commands": [
                { "command": "t.loop.spin", "title": "Spin" },
                { "command": "t.loop.quick", "title": "Quick" }
            ]
        },
        "permissions": ["ui.commands"]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn command_timeout_terminates_worker_and_respawns_lazily() {
    let harness = build_harness(ScriptedPrompt::allow_all(), |config| {
        config.command_timeout = Duration::from_millis(200);
    });
    let root = harness.write_extension("loop", &looping_manifest(), &[("e.js", LOOPING_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();

    // Warm up: activates the worker and proves the happy path.
    assert_eq!(
        harness.host.execute_command("t.loop.quick", vec![]).await.unwrap(),
        json!("ok")
    );

    let host = harness.host.clone();
    let spin = tokio::spawn(async move { host.execute_command("t.loop.spin", vec![]).await });
    let host = harness.host.clone();
    let quick = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.execute_command("t.loop.quick", vec![]).await
    });

    let spin_err = spin.await.unwrap().unwrap_err();
    assert_eq!(spin_err.name(), "ExtensionTimeoutError");
    assert_eq!(spin_err.code(), Some("EXTENSION_TIMEOUT"));

    let quick_err = quick.await.unwrap().unwrap_err();
    assert_eq!(quick_err.code(), Some("EXTENSION_WORKER_TERMINATED"));

    // The next command spawns a fresh worker and succeeds.
    assert_eq!(
        harness.host.execute_command("t.loop.quick", vec![]).await.unwrap(),
        json!("ok")
    );
}

const PANEL_EXTENSION: &str = r#"
import { commands, ui } from "formula";

export async function activate() {
  const panel = await ui.createPanel("t.panel.view", "My Panel");
  await panel.setHtml("<h1>hi</h1>");
  await commands.registerCommand("t.panel.ping", async () => "pong");
}
"#;

fn panel_manifest() -> serde_json::Value {
    json!({
        "publisher": "t",
        "name": "panel",
        "version": "1.0.0",
        "main": "./e.js",
        "engines": { "formula": "^1.0.0" },
        "activationEvents": ["onCommand:t.panel.ping", "onView:t.panel.view"],
        "contributes": {
            "commands": [{ "command": "t.panel.ping", "title": "Ping" }],
            "panels": [{ "id": "t.panel.view", "title": "My Panel" }]
        },
        "permissions": ["ui.commands", "ui.panels"]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_clears_runtime_artifacts_but_keeps_manifest_commands() {
    let harness = harness();
    let root = harness.write_extension("panel", &panel_manifest(), &[("e.js", PANEL_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();

    assert_eq!(
        harness.host.execute_command("t.panel.ping", vec![]).await.unwrap(),
        json!("pong")
    );
    let panels = harness.host.panels();
    assert_eq!(panels.len(), 1);
    assert_eq!(panels[0].html, "<h1>hi</h1>");

    harness.host.reload_extension("t.panel").unwrap();
    assert!(harness.host.panels().is_empty());
    let info = &harness.host.extensions()[0];
    assert!(!info.active);

    // Manifest-declared command survives and re-activates a fresh worker.
    assert_eq!(
        harness.host.execute_command("t.panel.ping", vec![]).await.unwrap(),
        json!("pong")
    );
    assert_eq!(harness.host.panels().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unload_erases_record_and_contributions() {
    let harness = harness();
    let root = harness.write_extension("panel", &panel_manifest(), &[("e.js", PANEL_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();
    harness.host.execute_command("t.panel.ping", vec![]).await.unwrap();

    harness.host.unload_extension("t.panel").unwrap();
    assert!(harness.host.extensions().is_empty());
    assert!(harness.host.panels().is_empty());

    let err = harness.host.execute_command("t.panel.ping", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("unknown command"), "{err}");
}

const VIEW_EXTENSION: &str = r#"
import { ui } from "formula";

export async function activate() {
  const panel = await ui.createPanel("t.view.panel", "View");
  await panel.setHtml("<p>ready</p>");
}
"#;

fn view_manifest() -> serde_json::Value {
    json!({
        "publisher": "t",
        "name": "view",
        "version": "1.0.0",
        "main": "./e.js",
        "engines": { "formula": "^1.0.0" },
        "activationEvents": ["onView:t.view.panel"],
        "contributes": {
            "panels": [{ "id": "t.view.panel", "title": "View" }]
        },
        "permissions": ["ui.panels"]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn activate_view_activates_subscribers_and_waits_for_panel_html() {
    let harness = harness();
    let root = harness.write_extension("view", &view_manifest(), &[("e.js", VIEW_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();

    harness.host.activate_view("t.view.panel").await.unwrap();

    let panels = harness.host.panels();
    assert_eq!(panels.len(), 1);
    assert_eq!(panels[0].html, "<p>ready</p>");
    assert!(harness.host.extensions()[0].active);
}

const FAILING_EXTENSION: &str = r#"
export async function activate() {
  const err = new Error("refused to start");
  err.name = "StartupError";
  throw err;
}
"#;

fn failing_manifest() -> serde_json::Value {
    json!({
        "publisher": "t",
        "name": "bad",
        "version": "1.0.0",
        "main": "./e.js",
        "engines": { "formula": "^1.0.0" },
        "activationEvents": ["onCommand:t.bad.go"],
        "contributes": {
            "commands": [{ "command": "t.bad.go", "title": "Go" }]
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn activation_error_surfaces_with_original_name() {
    let harness = harness();
    let root = harness.write_extension("bad", &failing_manifest(), &[("e.js", FAILING_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();

    let err = harness.host.execute_command("t.bad.go", vec![]).await.unwrap_err();
    assert_eq!(err.name(), "StartupError");
    assert!(err.to_string().contains("refused to start"), "{err}");
    assert!(!harness.host.extensions()[0].active);
}
