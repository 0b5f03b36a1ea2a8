// src/schema.rs

use std::{fs, path::Path};

use anyhow::{Context, Error};
use lead_protocol::{DeadLetter, TaskEnvelope, TaskReport};
use schemars::schema_for;
use serde::Serialize;

use crate::flow::{Flow, FlowDefinition};
use crate::lead::Lead;

fn write_one<T: Serialize>(out_dir: &Path, file: &str, schema: &T) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(schema)?;
    let path = out_dir.join(file);
    fs::write(&path, json).with_context(|| format!("could not write {}", path.display()))
}

/// The entry point invoked by `main.rs` for `Commands::Schema`: the
/// editor-facing flow definition, the stored documents and the wire
/// messages shared with workers.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("could not create {}", out_dir.display()))?;

    let files = [
        ("flow-definition.schema.json", serde_json::to_value(schema_for!(FlowDefinition))?),
        ("flow.schema.json", serde_json::to_value(schema_for!(Flow))?),
        ("lead.schema.json", serde_json::to_value(schema_for!(Lead))?),
        ("task-envelope.schema.json", serde_json::to_value(schema_for!(TaskEnvelope))?),
        ("dead-letter.schema.json", serde_json::to_value(schema_for!(DeadLetter))?),
        ("task-report.schema.json", serde_json::to_value(schema_for!(TaskReport))?),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (file, schema) in files {
        write_one(out_dir, file, &schema)?;
        written.push(file.to_string());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn writes_all_schemas() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_schema(dir.path()).unwrap();
        assert_eq!(written.len(), 6);

        let raw = fs::read_to_string(dir.path().join("task-envelope.schema.json")).unwrap();
        let schema: Value = serde_json::from_str(&raw).unwrap();
        let props = schema["properties"].as_object().unwrap();
        for field in ["leadId", "flowId", "owner", "sourceNodeId", "targetNodeId", "timestamp"] {
            assert!(props.contains_key(field), "missing {field}");
        }
    }
}
