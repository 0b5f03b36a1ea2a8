use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::flow::FlowDefinition;

const EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|os| os.to_str())
        .unwrap_or_default()
        .to_lowercase()
}

/// Parses a flow definition from a `.json`, `.yaml` or `.yml` file.
pub fn read_flow_file(path: &Path) -> Result<FlowDefinition> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;

    match extension(path).as_str() {
        "json" => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in file: {}", path.display())),
        "yaml" | "yml" => serde_yaml_bw::from_str(&content)
            .with_context(|| format!("Invalid YAML in file: {}", path.display())),
        other => bail!(
            "unsupported extension `{}` for {} (expected .json, .yaml or .yml)",
            other,
            path.display()
        ),
    }
}

/// Parses and validates a flow definition file.
pub fn validate_flow_file(path: &Path) -> Result<FlowDefinition> {
    if !path.exists() {
        bail!("File does not exist: {}", path.display());
    }
    let def = read_flow_file(path)?;
    def.validate()
        .with_context(|| format!("Invalid flow in {}", path.display()))?;
    info!(
        "✅ Valid flow `{}` ({} nodes, {} edges): {}",
        def.name,
        def.nodes.len(),
        def.edges.len(),
        path.display()
    );
    Ok(def)
}

/// Every valid definition in `dir`, in file-name order. A missing
/// directory holds no flows; one invalid file fails the whole load.
pub fn load_flow_dir(dir: &Path) -> Result<Vec<(PathBuf, FlowDefinition)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && EXTENSIONS.contains(&extension(p).as_str()))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| validate_flow_file(&path).map(|def| (path, def)))
        .collect()
}
