//! Turns raw toolchain JSON into the report uploaded for a job.
//!
//! Everything here is pure: no I/O, no logging. Callers read and parse the
//! toolchain files and hand the parsed [`model::OrtResult`] in.

pub mod analyzer;
pub mod graph;
pub mod model;

use serde::Serialize;

pub use analyzer::{convert_analyzer, AnalyzerListing};
pub use graph::{build_graph, DependencyGraph, DependencyNode, GraphBuilder, ScanIndex};
pub use model::OrtResult;

/// The artifact uploaded on a successful run.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Report {
    /// Scan mode: flattened graph with license attribution.
    Graph(DependencyGraph),
    /// Analyze mode: project/package listing without scan data.
    Listing(AnalyzerListing),
}

impl Report {
    pub fn package_count(&self) -> usize {
        match self {
            Report::Graph(graph) => graph.node_count(),
            Report::Listing(listing) => listing.packages.len(),
        }
    }
}
