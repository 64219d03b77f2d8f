//! Task-file loading.
//!
//! Two formats are accepted:
//! - `.json`: a list of task objects, or `{"tasks": [...]}`.
//! - anything else: comma-separated text with a header line naming the columns.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::task::{Params, Task};

/// Load the task list from `path`. Duplicate ids are rejected.
pub fn load_tasks_from_file(path: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let tasks = if is_json {
        parse_json_tasks(&content)?
    } else {
        parse_text_tasks(&content)?
    };

    ensure_unique_ids(&tasks)?;
    info!(count = tasks.len(), path = %path.display(), "Loaded tasks");
    Ok(tasks)
}

/// Reject a batch that contains the same id twice.
pub fn ensure_unique_ids(tasks: &[Task]) -> Result<()> {
    let mut seen = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if task.id.is_empty() {
            return Err(CoreError::InvalidTask("task id must not be empty".to_string()));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(CoreError::DuplicateTaskId(task.id.clone()));
        }
    }
    Ok(())
}

// ── JSON ──────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<Value>),
    Wrapped { tasks: Vec<Value> },
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    parameters: Option<Params>,
    #[serde(default)]
    metadata: Option<std::collections::BTreeMap<String, Value>>,
}

fn parse_json_tasks(content: &str) -> Result<Vec<Task>> {
    let file: TaskFile = serde_json::from_str(content).map_err(|e| {
        CoreError::InvalidTask(format!(
            "expected a list of tasks or {{\"tasks\": [...]}}: {}",
            e
        ))
    })?;
    let entries = match file {
        TaskFile::List(v) => v,
        TaskFile::Wrapped { tasks } => tasks,
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| json_entry_to_task(i, entry))
        .collect()
}

/// An entry is either `{id, parameters, metadata}` or a flat parameter map.
fn json_entry_to_task(index: usize, entry: Value) -> Result<Task> {
    let Value::Object(map) = entry else {
        return Err(CoreError::InvalidTask(format!(
            "task #{} is not an object",
            index
        )));
    };

    if map.contains_key("parameters") {
        let raw: RawTask = serde_json::from_value(Value::Object(map))?;
        let parameters = raw.parameters.unwrap_or_default();
        let id = match raw.id {
            Some(id) => id,
            None => Task::derive_id(&parameters).ok_or_else(|| {
                CoreError::InvalidTask(format!("task #{} has neither id nor parameters", index))
            })?,
        };
        return Ok(Task {
            id,
            parameters,
            metadata: raw.metadata.unwrap_or_default(),
        });
    }

    let mut parameters: Params = map.into_iter().collect();
    let explicit_id = match parameters.remove("id") {
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
        None => None,
    };
    let id = match explicit_id {
        Some(id) => id,
        None => Task::derive_id(&parameters).ok_or_else(|| {
            CoreError::InvalidTask(format!("task #{} is empty", index))
        })?,
    };
    Ok(Task {
        id,
        parameters,
        metadata: Default::default(),
    })
}

// ── Text ──────────────────────────────────────────────────────

fn parse_text_tasks(content: &str) -> Result<Vec<Task>> {
    let mut lines = content
        .lines()
        .enumerate()
        .map(|(n, l)| (n + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'));

    let Some((_, header)) = lines.next() else {
        return Ok(Vec::new());
    };
    let columns: Vec<String> = header.split(',').map(|c| c.trim().to_string()).collect();
    if columns.iter().any(|c| c.is_empty()) {
        return Err(CoreError::InvalidTask(format!(
            "header has an empty column name: '{}'",
            header
        )));
    }

    let mut tasks = Vec::new();
    for (line_no, line) in lines {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        if cells.len() != columns.len() {
            warn!(line = line_no, content = line, "Skipping invalid line");
            continue;
        }

        let mut id = None;
        let mut values = Vec::with_capacity(cells.len());
        let mut parameters = Params::new();
        for (column, cell) in columns.iter().zip(&cells) {
            if column == "id" {
                id = Some(cell.to_string());
            } else {
                values.push(*cell);
                parameters.insert(column.clone(), cell_value(cell));
            }
        }

        // Row order, not key order: the id follows the column layout of the file.
        let id = id.unwrap_or_else(|| values.join("_"));
        if id.is_empty() {
            warn!(line = line_no, "Skipping line without an id");
            continue;
        }
        tasks.push(Task {
            id,
            parameters,
            metadata: Default::default(),
        });
    }
    Ok(tasks)
}

fn cell_value(cell: &str) -> Value {
    if let Ok(n) = cell.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::String(cell.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn loads_json_list_with_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "tasks.json",
            r#"[{"id": "1ABC", "parameters": {"ligand": "ATP"}, "metadata": {"owner": "lab"}},
                {"id": "2XYZ", "parameters": {}}]"#,
        );
        let tasks = load_tasks_from_file(&path).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "1ABC");
        assert_eq!(tasks[0].param_str("ligand"), Some("ATP"));
        assert_eq!(tasks[0].metadata["owner"], "lab");
        assert_eq!(tasks[1].id, "2XYZ");
    }

    #[test]
    fn loads_wrapped_json_with_flat_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "tasks.json",
            r#"{"tasks": [{"a_pdb": "7CMD", "b_chain": "A", "c_res": 500}]}"#,
        );
        let tasks = load_tasks_from_file(&path).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "7CMD_A_500");
        assert_eq!(tasks[0].param("c_res"), Some(&Value::from(500)));
    }

    #[test]
    fn rejects_unexpected_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "tasks.json", r#"{"jobs": []}"#);
        assert!(matches!(
            load_tasks_from_file(&path),
            Err(CoreError::InvalidTask(_))
        ));
    }

    #[test]
    fn text_rows_derive_ids_and_skip_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "tasks.txt",
            "# batch of structures\npdb,ligand,chain,res\n7CMD,ATP,A,500\n\n1ABC,GTP\n2XYZ, NAD ,B,12\n",
        );
        let tasks = load_tasks_from_file(&path).unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["7CMD_ATP_A_500", "2XYZ_NAD_B_12"]);
        assert_eq!(tasks[1].param_str("ligand"), Some("NAD"));
        assert_eq!(tasks[1].param("res"), Some(&Value::from(12)));
    }

    #[test]
    fn text_id_column_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "tasks.csv", "id,input\nfirst,a.pdb\nsecond,b.pdb\n");
        let tasks = load_tasks_from_file(&path).unwrap();
        assert_eq!(tasks[0].id, "first");
        assert!(tasks[0].param("id").is_none());
        assert_eq!(tasks[1].param_str("input"), Some("b.pdb"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let tasks = vec![Task::new("a"), Task::new("b"), Task::new("a")];
        match ensure_unique_ids(&tasks) {
            Err(CoreError::DuplicateTaskId(id)) => assert_eq!(id, "a"),
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }
}
