use std::collections::{BTreeSet, HashMap};

use chrono::DateTime;
use serde::Serialize;

use super::analyzer::{declared_licenses, Vcs};
use super::model::{OrtResult, PackageReference, Project, ScanResultContainer};
use crate::error::NormalizeError;

/// A package as it appears in the flattened graph of one project.
///
/// `parents` and `scopes` accumulate over every path the package is reached
/// by. `licenses` and `scan` are resolved once, on first visit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyNode {
    pub id: String,
    pub parents: BTreeSet<String>,
    pub scopes: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub licenses: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// License data attached to a node when it is first seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attribution {
    pub licenses: Option<Vec<String>>,
    pub scan: Option<ScanSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGraph {
    pub name: String,
    pub purl: Option<String>,
    pub licenses: Vec<String>,
    pub definition_file: Option<String>,
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcs: Option<Vcs>,
    pub dependencies: Vec<DependencyNode>,
}

#[derive(Debug, Serialize)]
pub struct DependencyGraph {
    pub projects: Vec<ProjectGraph>,
}

impl DependencyGraph {
    pub fn node_count(&self) -> usize {
        self.projects.iter().map(|p| p.dependencies.len()).sum()
    }
}

/// Arena of nodes keyed by package id.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    index: HashMap<String, usize>,
    nodes: Vec<DependencyNode>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one visit of `id` reached from `parent` within `scope`.
    ///
    /// A first visit creates the node and calls `attribute` for its license
    /// data. Later visits only union `parent` and `scope` into the existing
    /// sets; `attribute` is not called.
    pub fn merge<F>(&mut self, id: &str, parent: Option<&str>, scope: &str, attribute: F) -> &DependencyNode
    where
        F: FnOnce() -> Attribution,
    {
        let idx = match self.index.get(id) {
            Some(&idx) => idx,
            None => {
                let Attribution { licenses, scan } = attribute();
                self.nodes.push(DependencyNode {
                    id: id.to_string(),
                    parents: BTreeSet::new(),
                    scopes: BTreeSet::new(),
                    licenses,
                    scan,
                });
                let idx = self.nodes.len() - 1;
                self.index.insert(id.to_string(), idx);
                idx
            }
        };

        let node = &mut self.nodes[idx];
        if let Some(parent) = parent {
            node.parents.insert(parent.to_string());
        }
        node.scopes.insert(scope.to_string());
        node
    }

    pub fn get(&self, id: &str) -> Option<&DependencyNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in first-seen order.
    pub fn into_nodes(self) -> Vec<DependencyNode> {
        self.nodes
    }

    /// Depth-first walk of one scope's forest.
    ///
    /// Repeated packages are descended into again, so children declared
    /// under a later occurrence are still reached. A package already on the
    /// current path gets its edge recorded but is not descended into.
    pub fn walk_scope(&mut self, scope: &str, roots: &[PackageReference], index: &ScanIndex) {
        let mut path = Vec::new();
        self.walk(scope, roots, None, &mut path, index);
    }

    fn walk(
        &mut self,
        scope: &str,
        refs: &[PackageReference],
        parent: Option<&str>,
        path: &mut Vec<String>,
        index: &ScanIndex,
    ) {
        for reference in refs {
            self.merge(&reference.id, parent, scope, || index.attribution(&reference.id));

            if path.contains(&reference.id) {
                continue;
            }

            path.push(reference.id.clone());
            self.walk(scope, &reference.dependencies, Some(reference.id.as_str()), path, index);
            path.pop();
        }
    }
}

/// Scan results keyed by package id, with a purl fallback for packages
/// whose scan entry is keyed by their source-artifact purl.
#[derive(Debug, Default)]
pub struct ScanIndex {
    entries: HashMap<String, Attribution>,
    purls: HashMap<String, String>,
}

impl ScanIndex {
    pub fn from_result(result: &OrtResult) -> Self {
        let mut index = Self::default();
        for container in result.scan_results() {
            index.insert(&container.id, read_scan(container));
        }
        if let Some(analyzer) = result.analyzer_result() {
            for curated in &analyzer.packages {
                if let Some(purl) = &curated.package.purl {
                    index.purls.insert(curated.package.id.clone(), purl.clone());
                }
            }
        }
        index
    }

    pub fn insert(&mut self, key: &str, attribution: Attribution) {
        self.entries.insert(key.to_string(), attribution);
    }

    pub fn with_purl(mut self, id: &str, purl: &str) -> Self {
        self.purls.insert(id.to_string(), purl.to_string());
        self
    }

    pub fn attribution(&self, id: &str) -> Attribution {
        self.entries
            .get(id)
            .or_else(|| self.purls.get(id).and_then(|purl| self.entries.get(purl)))
            .cloned()
            .unwrap_or_default()
    }
}

fn read_scan(container: &ScanResultContainer) -> Attribution {
    let Some(first) = container.results.first() else {
        return Attribution::default();
    };

    let url = first.provenance.as_ref().and_then(|p| {
        p.original_vcs_info
            .as_ref()
            .map(|v| v.url.clone())
            .or_else(|| p.source_artifact.as_ref().map(|a| a.url.clone()))
    });

    let Some(summary) = &first.summary else {
        return Attribution {
            licenses: None,
            scan: Some(ScanSummary {
                url,
                ..ScanSummary::default()
            }),
        };
    };

    let duration_ms = match (&summary.start_time, &summary.end_time) {
        (Some(start), Some(end)) => {
            match (DateTime::parse_from_rfc3339(start), DateTime::parse_from_rfc3339(end)) {
                (Ok(start), Ok(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            }
        }
        _ => None,
    };

    let mut licenses: Vec<String> = Vec::new();
    for finding in &summary.license_findings {
        if !licenses.contains(&finding.license) {
            licenses.push(finding.license.clone());
        }
    }

    Attribution {
        licenses: (!licenses.is_empty()).then_some(licenses),
        scan: Some(ScanSummary {
            url,
            file_count: summary.file_count,
            duration_ms,
        }),
    }
}

/// Flatten every project's declaration forest into a deduplicated node list
/// annotated with scan results.
pub fn build_graph(result: &OrtResult) -> Result<DependencyGraph, NormalizeError> {
    let analyzer = result
        .analyzer_result()
        .ok_or(NormalizeError::MissingAnalyzerResult)?;
    let index = ScanIndex::from_result(result);

    let projects = analyzer
        .projects
        .iter()
        .map(|project| project_graph(project, &index))
        .collect();

    Ok(DependencyGraph { projects })
}

fn project_graph(project: &Project, index: &ScanIndex) -> ProjectGraph {
    let mut builder = GraphBuilder::new();
    for scope in &project.scopes {
        builder.walk_scope(&scope.name, &scope.dependencies, index);
    }

    ProjectGraph {
        name: project.id.clone(),
        purl: project.purl.clone(),
        licenses: declared_licenses(project.declared_licenses_processed.as_ref()),
        definition_file: project.definition_file_path.clone(),
        homepage: project.homepage_url.clone(),
        vcs: project.vcs_processed.as_ref().and_then(Vcs::from_processed),
        dependencies: builder.into_nodes(),
    }
}
