//! Event payload construction and size governance.
//!
//! Only active extensions receive broadcasts; delivery itself lives in the
//! host facade. This module owns the payload shapes and the
//! `selectionChanged` cell-count cap: oversized selections are delivered
//! with empty matrices and `truncated: true` unless the producer already
//! truncated them.

use crate::a1::RangeRef;
use crate::spreadsheet::{CellChange, Selection};
use serde_json::{Value, json};

/// A spreadsheet/workbook event ready for broadcast.
#[derive(Debug, Clone)]
pub struct HostEvent {
    pub name: &'static str,
    pub payload: Value,
}

impl HostEvent {
    #[must_use]
    pub fn workbook_opened(workbook: Value) -> Self {
        Self {
            name: "workbookOpened",
            payload: json!({ "workbook": workbook }),
        }
    }

    #[must_use]
    pub fn before_save(workbook: Value) -> Self {
        Self {
            name: "beforeSave",
            payload: json!({ "workbook": workbook }),
        }
    }

    #[must_use]
    pub fn view_activated(view_id: &str) -> Self {
        Self {
            name: "viewActivated",
            payload: json!({ "viewId": view_id }),
        }
    }

    #[must_use]
    pub fn sheet_activated(name: &str) -> Self {
        Self {
            name: "sheetActivated",
            payload: json!({ "sheet": name }),
        }
    }

    #[must_use]
    pub fn cell_changed(change: &CellChange) -> Self {
        Self {
            name: "cellChanged",
            payload: json!({
                "sheet": change.sheet,
                "row": change.row,
                "col": change.col,
                "value": change.value,
            }),
        }
    }

    /// Build a `selectionChanged` event, applying the cell-count cap.
    #[must_use]
    pub fn selection_changed(selection: &Selection, max_cells: u64) -> Self {
        Self {
            name: "selectionChanged",
            payload: sanitize_selection(
                json!({
                    "range": selection.range,
                    "values": selection.values,
                    "formulas": selection.formulas,
                }),
                max_cells,
            ),
        }
    }

    /// Targeted event: configuration key changed for the owning extension.
    #[must_use]
    pub fn config_changed(key: &str, value: &Value) -> Self {
        Self {
            name: "configChanged",
            payload: json!({ "key": key, "value": value }),
        }
    }
}

/// Apply the payload-size rule to a `selectionChanged` payload: when the
/// selection's cell count exceeds `max_cells` and the payload is not
/// already marked truncated, strip both matrices and set `truncated`.
#[must_use]
pub fn sanitize_selection(mut payload: Value, max_cells: u64) -> Value {
    let already_truncated = payload
        .get("truncated")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if already_truncated {
        return payload;
    }

    let cell_count = payload
        .get("range")
        .and_then(Value::as_str)
        .and_then(|range| RangeRef::parse(range).ok())
        .map_or(0, |range| range.cell_count());
    if cell_count <= max_cells {
        return payload;
    }

    if let Some(map) = payload.as_object_mut() {
        map.insert("values".to_string(), json!([]));
        map.insert("formulas".to_string(), json!([]));
        map.insert("truncated".to_string(), json!(true));
    }
    payload
}
