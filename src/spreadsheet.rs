//! The spreadsheet collaborator consumed by the host.
//!
//! The host does not own cell storage or formula evaluation; it mediates
//! extension access through this capability bag. Listener subscriptions
//! return a [`Subscription`] disposer. Implementations must be safe to
//! call from any host task, and the host never invokes them in a way that
//! re-enters a worker before replying.

use crate::a1::{CellRef, RangeRef};
use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Disposer returned by listener subscriptions.
pub struct Subscription(Option<Box<dyn FnOnce() + Send>>);

impl Subscription {
    #[must_use]
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(dispose)))
    }

    pub fn dispose(mut self) {
        if let Some(dispose) = self.0.take() {
            dispose();
        }
    }
}

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Current selection, possibly with full value/formula matrices.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub range: String,
    pub values: Vec<Vec<Value>>,
    pub formulas: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellChange {
    pub sheet: String,
    pub row: u32,
    pub col: u32,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetInfo {
    pub name: String,
}

pub trait SpreadsheetApi: Send + Sync {
    fn get_active_sheet(&self) -> Result<String>;
    fn list_sheets(&self) -> Result<Vec<String>>;
    fn get_sheet(&self, name: &str) -> Result<SheetInfo>;
    fn create_sheet(&self, name: &str) -> Result<()>;
    fn rename_sheet(&self, from: &str, to: &str) -> Result<()>;
    fn delete_sheet(&self, name: &str) -> Result<()>;
    fn activate_sheet(&self, name: &str) -> Result<()>;
    fn on_sheet_activated(&self, listener: Listener<String>) -> Subscription;

    fn get_selection(&self) -> Result<Selection>;
    fn set_selection(&self, range: &RangeRef) -> Result<()>;
    fn on_selection_changed(&self, listener: Listener<Selection>) -> Subscription;

    fn get_cell(&self, row: u32, col: u32) -> Result<Value>;
    fn set_cell(&self, row: u32, col: u32, value: Value) -> Result<()>;
    fn on_cell_changed(&self, listener: Listener<CellChange>) -> Subscription;

    fn get_range(&self, range: &RangeRef) -> Result<Vec<Vec<Value>>>;
    fn set_range(&self, range: &RangeRef, values: &[Vec<Value>]) -> Result<()>;

    /// Workbook display name, used in workbook snapshots.
    fn workbook_name(&self) -> String {
        "Workbook".to_string()
    }

    /// Optional capability; engines without multi-workbook support keep
    /// the default.
    fn open_workbook(&self, path: &str) -> Result<Value> {
        let _ = path;
        Err(Error::validation(
            "openWorkbook is not supported by this spreadsheet engine",
        ))
    }
}

type ListenerSlot<T> = Arc<Mutex<Vec<(u64, Listener<T>)>>>;

fn subscribe<T: 'static>(slot: &ListenerSlot<T>, next_id: &AtomicU64, listener: Listener<T>) -> Subscription {
    let id = next_id.fetch_add(1, Ordering::Relaxed);
    slot.lock().expect("listener slot poisoned").push((id, listener));
    let slot = Arc::clone(slot);
    Subscription::new(move || {
        slot.lock()
            .expect("listener slot poisoned")
            .retain(|(entry_id, _)| *entry_id != id);
    })
}

fn notify<T>(slot: &ListenerSlot<T>, payload: &T) {
    let listeners: Vec<Listener<T>> = slot
        .lock()
        .expect("listener slot poisoned")
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect();
    for listener in listeners {
        listener(payload);
    }
}

/// Reference in-memory engine used by the test-suite and by embedding
/// hosts that want a scratch workbook. Tracks read/write counts so tests
/// can assert that over-cap requests never reach the engine.
pub struct InMemorySpreadsheet {
    state: Mutex<WorkbookState>,
    range_reads: AtomicUsize,
    range_writes: AtomicUsize,
    next_listener_id: AtomicU64,
    sheet_listeners: ListenerSlot<String>,
    selection_listeners: ListenerSlot<Selection>,
    cell_listeners: ListenerSlot<CellChange>,
}

struct WorkbookState {
    /// Sheet order matters for snapshots.
    sheets: Vec<Sheet>,
    active: String,
    selection: RangeRef,
}

struct Sheet {
    name: String,
    cells: std::collections::HashMap<(u32, u32), Value>,
}

impl Default for InMemorySpreadsheet {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySpreadsheet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkbookState {
                sheets: vec![Sheet {
                    name: "Sheet1".to_string(),
                    cells: std::collections::HashMap::new(),
                }],
                active: "Sheet1".to_string(),
                selection: RangeRef {
                    sheet: None,
                    start: CellRef::new(1, 1),
                    end: CellRef::new(1, 1),
                },
            }),
            range_reads: AtomicUsize::new(0),
            range_writes: AtomicUsize::new(0),
            next_listener_id: AtomicU64::new(1),
            sheet_listeners: Arc::new(Mutex::new(Vec::new())),
            selection_listeners: Arc::new(Mutex::new(Vec::new())),
            cell_listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn range_read_count(&self) -> usize {
        self.range_reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn range_write_count(&self) -> usize {
        self.range_writes.load(Ordering::SeqCst)
    }

    /// Simulate a user selection change, firing listeners with the given
    /// matrices (tests use this to drive `selectionChanged` payloads).
    pub fn simulate_selection(&self, selection: Selection) {
        if let Ok(range) = RangeRef::parse(&selection.range) {
            self.state.lock().expect("workbook poisoned").selection = range;
        }
        notify(&self.selection_listeners, &selection);
    }

    fn with_sheet<R>(
        &self,
        name: Option<&str>,
        f: impl FnOnce(&mut Sheet) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock().expect("workbook poisoned");
        let name = name.unwrap_or(&state.active).to_string();
        let sheet = state
            .sheets
            .iter_mut()
            .find(|sheet| sheet.name == name)
            .ok_or_else(|| Error::validation(format!("unknown sheet: {name}")))?;
        Ok(f(sheet))
    }
}

impl SpreadsheetApi for InMemorySpreadsheet {
    fn get_active_sheet(&self) -> Result<String> {
        Ok(self.state.lock().expect("workbook poisoned").active.clone())
    }

    fn list_sheets(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .expect("workbook poisoned")
            .sheets
            .iter()
            .map(|sheet| sheet.name.clone())
            .collect())
    }

    fn get_sheet(&self, name: &str) -> Result<SheetInfo> {
        let state = self.state.lock().expect("workbook poisoned");
        state
            .sheets
            .iter()
            .find(|sheet| sheet.name == name)
            .map(|sheet| SheetInfo {
                name: sheet.name.clone(),
            })
            .ok_or_else(|| Error::validation(format!("unknown sheet: {name}")))
    }

    fn create_sheet(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("workbook poisoned");
        if state.sheets.iter().any(|sheet| sheet.name == name) {
            return Err(Error::validation(format!("sheet already exists: {name}")));
        }
        state.sheets.push(Sheet {
            name: name.to_string(),
            cells: std::collections::HashMap::new(),
        });
        Ok(())
    }

    fn rename_sheet(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock().expect("workbook poisoned");
        if state.sheets.iter().any(|sheet| sheet.name == to) {
            return Err(Error::validation(format!("sheet already exists: {to}")));
        }
        let sheet = state
            .sheets
            .iter_mut()
            .find(|sheet| sheet.name == from)
            .ok_or_else(|| Error::validation(format!("unknown sheet: {from}")))?;
        sheet.name = to.to_string();
        if state.active == from {
            state.active = to.to_string();
        }
        Ok(())
    }

    fn delete_sheet(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("workbook poisoned");
        if state.sheets.len() == 1 {
            return Err(Error::validation("cannot delete the last sheet"));
        }
        let before = state.sheets.len();
        state.sheets.retain(|sheet| sheet.name != name);
        if state.sheets.len() == before {
            return Err(Error::validation(format!("unknown sheet: {name}")));
        }
        if state.active == name {
            state.active = state.sheets[0].name.clone();
        }
        Ok(())
    }

    fn activate_sheet(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.lock().expect("workbook poisoned");
            if !state.sheets.iter().any(|sheet| sheet.name == name) {
                return Err(Error::validation(format!("unknown sheet: {name}")));
            }
            state.active = name.to_string();
        }
        notify(&self.sheet_listeners, &name.to_string());
        Ok(())
    }

    fn on_sheet_activated(&self, listener: Listener<String>) -> Subscription {
        subscribe(&self.sheet_listeners, &self.next_listener_id, listener)
    }

    fn get_selection(&self) -> Result<Selection> {
        let range = self
            .state
            .lock()
            .expect("workbook poisoned")
            .selection
            .clone();
        let values = self.get_range(&range)?;
        let formulas = values.iter().map(|row| vec![String::new(); row.len()]).collect();
        Ok(Selection {
            range: range.to_string(),
            values,
            formulas,
        })
    }

    fn set_selection(&self, range: &RangeRef) -> Result<()> {
        self.state.lock().expect("workbook poisoned").selection = range.clone();
        Ok(())
    }

    fn on_selection_changed(&self, listener: Listener<Selection>) -> Subscription {
        subscribe(&self.selection_listeners, &self.next_listener_id, listener)
    }

    fn get_cell(&self, row: u32, col: u32) -> Result<Value> {
        self.with_sheet(None, |sheet| {
            sheet.cells.get(&(row, col)).cloned().unwrap_or(Value::Null)
        })
    }

    fn set_cell(&self, row: u32, col: u32, value: Value) -> Result<()> {
        let sheet_name = self.get_active_sheet()?;
        self.with_sheet(None, |sheet| {
            sheet.cells.insert((row, col), value.clone());
        })?;
        notify(
            &self.cell_listeners,
            &CellChange {
                sheet: sheet_name,
                row,
                col,
                value,
            },
        );
        Ok(())
    }

    fn on_cell_changed(&self, listener: Listener<CellChange>) -> Subscription {
        subscribe(&self.cell_listeners, &self.next_listener_id, listener)
    }

    fn get_range(&self, range: &RangeRef) -> Result<Vec<Vec<Value>>> {
        self.range_reads.fetch_add(1, Ordering::SeqCst);
        self.with_sheet(range.sheet.as_deref(), |sheet| {
            (range.start.row..=range.end.row)
                .map(|row| {
                    (range.start.col..=range.end.col)
                        .map(|col| sheet.cells.get(&(row, col)).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect()
        })
    }

    fn set_range(&self, range: &RangeRef, values: &[Vec<Value>]) -> Result<()> {
        self.range_writes.fetch_add(1, Ordering::SeqCst);
        self.with_sheet(range.sheet.as_deref(), |sheet| {
            for (row_offset, row_values) in values.iter().enumerate() {
                for (col_offset, value) in row_values.iter().enumerate() {
                    #[allow(clippy::cast_possible_truncation)]
                    let row = range.start.row + row_offset as u32;
                    #[allow(clippy::cast_possible_truncation)]
                    let col = range.start.col + col_offset as u32;
                    if row <= range.end.row && col <= range.end.col {
                        sheet.cells.insert((row, col), value.clone());
                    }
                }
            }
        })
    }

    fn workbook_name(&self) -> String {
        "InMemoryWorkbook".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cell_and_range_round_trip() {
        let sheet = InMemorySpreadsheet::new();
        sheet.set_cell(1, 1, json!(10)).unwrap();
        sheet.set_cell(2, 2, json!("x")).unwrap();

        let range = RangeRef::parse("A1:B2").unwrap();
        let values = sheet.get_range(&range).unwrap();
        assert_eq!(values, vec![
            vec![json!(10), Value::Null],
            vec![Value::Null, json!("x")],
        ]);
        assert_eq!(sheet.range_read_count(), 1);
    }

    #[test]
    fn listeners_fire_and_dispose() {
        let sheet = InMemorySpreadsheet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = sheet.on_sheet_activated({
            let seen = Arc::clone(&seen);
            Arc::new(move |name: &String| seen.lock().unwrap().push(name.clone()))
        });

        sheet.create_sheet("Data").unwrap();
        sheet.activate_sheet("Data").unwrap();
        subscription.dispose();
        sheet.activate_sheet("Sheet1").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["Data".to_string()]);
    }

    #[test]
    fn sheet_management_rules() {
        let sheet = InMemorySpreadsheet::new();
        assert!(sheet.delete_sheet("Sheet1").is_err());
        sheet.create_sheet("Data").unwrap();
        assert!(sheet.create_sheet("Data").is_err());
        sheet.rename_sheet("Data", "Numbers").unwrap();
        assert!(sheet.get_sheet("Data").is_err());
        sheet.delete_sheet("Numbers").unwrap();
        assert_eq!(sheet.list_sheets().unwrap(), vec!["Sheet1"]);
    }
}
