//! Tabular rendering of JSON responses (the `df` output format).

use serde_json::{Map, Value};

/// Rows of JSON cells under ordered column names.
///
/// Columns appear in first-seen order; a row lacking a column holds `Value::Null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    /// Flattens `data` one level deep: one row per top-level object, nested objects
    /// become `parent.child` columns, anything deeper stays a JSON cell.
    pub fn from_json(data: &Value) -> Self {
        let records: Vec<Map<String, Value>> = match data {
            Value::Array(items) => items.iter().map(as_record).collect(),
            Value::Null => Vec::new(),
            other => vec![as_record(other)],
        };

        let mut table = Table::default();
        let flat: Vec<Vec<(String, Value)>> = records.iter().map(flatten_once).collect();
        for row in &flat {
            for (k, _) in row {
                if !table.columns.iter().any(|c| c == k) {
                    table.columns.push(k.clone());
                }
            }
        }
        for row in flat {
            let mut cells = vec![Value::Null; table.columns.len()];
            for (k, v) in row {
                if let Some(idx) = table.columns.iter().position(|c| *c == k) {
                    cells[idx] = v;
                }
            }
            table.rows.push(cells);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cells of the named column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Sorts rows by the string form of `column`; missing columns leave the order untouched.
    pub fn sort_by_column(&mut self, column: &str) {
        if let Some(idx) = self.columns.iter().position(|c| c == column) {
            self.rows.sort_by(|a, b| cell_text(&a[idx]).cmp(&cell_text(&b[idx])));
        }
    }
}

fn as_record(v: &Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m.clone(),
        other => {
            let mut m = Map::new();
            m.insert("0".to_string(), other.clone());
            m
        }
    }
}

fn flatten_once(record: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (k, v) in record {
        match v {
            Value::Object(inner) if !inner.is_empty() => {
                for (ik, iv) in inner {
                    out.push((format!("{}.{}", k, ik), iv.clone()));
                }
            }
            other => out.push((k.clone(), other.clone())),
        }
    }
    out
}

pub(crate) fn cell_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn one_row_per_object_with_dotted_columns() {
        let data = json!([
            {"id": "a", "status": {"code": "RUNNING", "detail": {"step": 1}}},
            {"id": "b", "extra": true}
        ]);
        let t = Table::from_json(&data);
        assert_eq!(t.columns, vec!["id", "status.code", "status.detail", "extra"]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(0, "status.code"), Some(&json!("RUNNING")));
        assert_eq!(t.get(0, "status.detail"), Some(&json!({"step": 1})));
        assert_eq!(t.get(1, "status.code"), Some(&Value::Null));
        assert_eq!(t.get(1, "extra"), Some(&json!(true)));
    }

    #[test]
    fn single_object_becomes_single_row() {
        let t = Table::from_json(&json!({"name": "x"}));
        assert_eq!(t.len(), 1);
        assert_eq!(t.column("name"), Some(vec![&json!("x")]));
    }

    #[test]
    fn sorting_uses_text_form() {
        let mut t = Table::from_json(&json!([{"k": "b"}, {"k": "a"}]));
        t.sort_by_column("k");
        assert_eq!(t.get(0, "k"), Some(&json!("a")));
    }
}
