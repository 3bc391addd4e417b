//! `hap hosts`

use anyhow::Result;
use hap_config::ConfigGraph;
use std::path::Path;

use super::load_graph;

pub fn run(file: &Path) -> Result<()> {
    println!("{}", render(&load_graph(file)?)?);
    Ok(())
}

fn render(graph: &ConfigGraph) -> Result<String> {
    Ok(serde_json::to_string_pretty(graph)?)
}
