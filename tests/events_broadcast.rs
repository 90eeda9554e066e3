//! Event broadcasting end-to-end: startup snapshot, selection payload
//! truncation, and delivery only to active extensions.

mod common;

use common::harness;
use formula_host::spreadsheet::Selection;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::time::Duration;

const OBSERVER_EXTENSION: &str = r#"
import { commands, events } from "formula";

let lastSelection = null;
let lastWorkbook = null;

export async function activate() {
  events.on("selectionChanged", (payload) => { lastSelection = payload; });
  events.on("workbookOpened", (payload) => { lastWorkbook = payload; });
  await commands.registerCommand("t.obs.selection", async () => lastSelection);
  await commands.registerCommand("t.obs.workbook", async () => lastWorkbook);
}
"#;

fn observer_manifest() -> Value {
    json!({
        "publisher": "t",
        "name": "obs",
        "version": "1.0.0",
        "main": "./e.js",
        "engines": { "formula": "^1.0.0" },
        "activationEvents": [
            "onStartupFinished",
            "onCommand:t.obs.selection",
            "onCommand:t.obs.workbook"
        ],
        "contributes": {
            "commands": [
                { "command": "t.obs.selection", "title": "Selection" },
                { "command": "t.obs.workbook", "title": "Workbook" }
            ]
        },
        "permissions": ["ui.commands"]
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_broadcasts_the_workbook_snapshot() {
    let harness = harness();
    let root = harness.write_extension("obs", &observer_manifest(), &[("e.js", OBSERVER_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();

    harness.host.startup().await.unwrap();
    settle().await;

    let payload = harness
        .host
        .execute_command("t.obs.workbook", vec![])
        .await
        .unwrap();
    assert_eq!(payload["workbook"]["sheets"], json!(["Sheet1"]));
    assert_eq!(payload["workbook"]["activeSheet"], json!("Sheet1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn small_selection_payloads_pass_through_unchanged() {
    let harness = harness();
    let root = harness.write_extension("obs", &observer_manifest(), &[("e.js", OBSERVER_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();
    harness.host.startup().await.unwrap();

    harness.sheet.simulate_selection(Selection {
        range: "A1:B2".to_string(),
        values: vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)]],
        formulas: vec![
            vec![String::new(), String::new()],
            vec![String::new(), String::new()],
        ],
    });
    settle().await;

    let payload = harness
        .host
        .execute_command("t.obs.selection", vec![])
        .await
        .unwrap();
    assert_eq!(payload["range"], json!("A1:B2"));
    assert_eq!(payload["values"], json!([[1, 2], [3, 4]]));
    assert_eq!(payload.get("truncated"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_selection_payloads_arrive_truncated() {
    let harness = harness();
    let root = harness.write_extension("obs", &observer_manifest(), &[("e.js", OBSERVER_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();
    harness.host.startup().await.unwrap();

    harness.sheet.simulate_selection(Selection {
        range: "A1:Z10000".to_string(),
        values: vec![vec![json!(1)]],
        formulas: vec![vec!["=A1".to_string()]],
    });
    settle().await;

    let payload = harness
        .host
        .execute_command("t.obs.selection", vec![])
        .await
        .unwrap();
    assert_eq!(payload["truncated"], json!(true));
    assert_eq!(payload["values"], json!([]));
    assert_eq!(payload["formulas"], json!([]));
}

#[tokio::test(flavor = "multi_thread")]
async fn inactive_extensions_do_not_receive_broadcasts() {
    let harness = harness();
    let root = harness.write_extension("obs", &observer_manifest(), &[("e.js", OBSERVER_EXTENSION)]);
    harness.host.load_extension(&root).await.unwrap();
    // No startup: the extension stays inactive through this event.
    harness.sheet.simulate_selection(Selection {
        range: "A1".to_string(),
        values: vec![vec![json!(9)]],
        formulas: vec![vec![String::new()]],
    });
    settle().await;

    // Activation happens now, after the event has already passed.
    let payload = harness
        .host
        .execute_command("t.obs.selection", vec![])
        .await
        .unwrap();
    assert_eq!(payload, json!(null));
}
