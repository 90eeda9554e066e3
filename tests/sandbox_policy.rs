//! Sandbox rules exercised from inside real workers: builtin module
//! denial, root containment, the API façade module, and native-binding
//! stubs.

mod common;

use common::harness;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn manifest_with_command(name: &str, command: &str) -> Value {
    json!({
        "publisher": "t",
        "name": name,
        "version": "1.0.0",
        "main": "./e.js",
        "engines": { "formula": "^1.0.0" },
        "activationEvents": [format!("onCommand:{command}")],
        "contributes": {
            "commands": [{ "command": command, "title": "Run" }]
        },
        "permissions": ["ui.commands"]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn static_builtin_import_fails_activation() {
    let harness = harness();
    let raw = manifest_with_command("fsext", "t.fsext.run");
    let source = r#"
import { readFileSync } from "fs";
export async function activate() {}
"#;
    let root = harness.write_extension("fsext", &raw, &[("e.js", source)]);
    harness.host.load_extension(&root).await.unwrap();

    let err = harness
        .host
        .execute_command("t.fsext.run", vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("fs"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn node_prefixed_builtins_are_normalized_before_denial() {
    let harness = harness();
    let raw = manifest_with_command("spawnext", "t.spawnext.run");
    let source = r#"
import { spawn } from "node:child_process";
export async function activate() {}
"#;
    let root = harness.write_extension("spawnext", &raw, &[("e.js", source)]);
    harness.host.load_extension(&root).await.unwrap();

    let err = harness
        .host
        .execute_command("t.spawnext.run", vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("child_process"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn imports_escaping_the_extension_root_fail() {
    let harness = harness();
    let raw = manifest_with_command("escape", "t.escape.run");
    let source = r#"
import { secret } from "../secret.js";
export async function activate() {}
"#;
    let root = harness.write_extension("escape", &raw, &[("e.js", source)]);
    std::fs::write(
        root.parent().unwrap().join("secret.js"),
        "export const secret = 42;",
    )
    .unwrap();
    harness.host.load_extension(&root).await.unwrap();

    let err = harness
        .host
        .execute_command("t.escape.run", vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("escapes"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn relative_imports_inside_the_root_resolve() {
    let harness = harness();
    let raw = manifest_with_command("helper", "t.helper.run");
    let entry = r#"
import { commands } from "formula";
import { greeting } from "./lib/helper.js";

export async function activate() {
  await commands.registerCommand("t.helper.run", async () => greeting);
}
"#;
    let helper = "export const greeting = \"from helper\";\n";
    let root = harness.write_extension(
        "helper",
        &raw,
        &[("e.js", entry), ("lib/helper.js", helper)],
    );
    harness.host.load_extension(&root).await.unwrap();

    assert_eq!(
        harness.host.execute_command("t.helper.run", vec![]).await.unwrap(),
        json!("from helper")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn process_binding_is_stubbed_out() {
    let harness = harness();
    let raw = manifest_with_command("binding", "t.binding.run");
    let source = r#"
import { commands } from "formula";

export async function activate() {
  await commands.registerCommand("t.binding.run", async () => {
    try {
      process.binding("fs");
      return "no error";
    } catch (err) {
      return err.message;
    }
  });
}
"#;
    let root = harness.write_extension("binding", &raw, &[("e.js", source)]);
    harness.host.load_extension(&root).await.unwrap();

    let message = harness
        .host
        .execute_command("t.binding.run", vec![])
        .await
        .unwrap();
    assert!(
        message.as_str().unwrap().contains("not available"),
        "{message}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn dynamic_import_of_builtins_is_refused_after_activation() {
    let harness = harness();
    let raw = manifest_with_command("dynimp", "t.dynimp.run");
    let source = r#"
import { commands } from "formula";

export async function activate() {
  await commands.registerCommand("t.dynimp.run", async () => {
    try {
      await import("node:fs");
      return "imported";
    } catch (err) {
      return err.message;
    }
  });
}
"#;
    let root = harness.write_extension("dynimp", &raw, &[("e.js", source)]);
    harness.host.load_extension(&root).await.unwrap();

    let message = harness
        .host
        .execute_command("t.dynimp.run", vec![])
        .await
        .unwrap();
    assert!(
        message
            .as_str()
            .unwrap()
            .contains("Dynamic import is not allowed"),
        "{message}"
    );
}
