//! Raw toolchain output as written to `analyzer-result.json` and
//! `scan-result.json`. Only the fields the normalizer reads are modelled;
//! everything else in the documents is ignored.

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct OrtResult {
    #[serde(default)]
    pub analyzer: Option<AnalyzerRun>,
    #[serde(default)]
    pub scanner: Option<ScannerRun>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzerRun {
    #[serde(default)]
    pub result: Option<AnalyzerResult>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzerResult {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub packages: Vec<CuratedPackage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub purl: Option<String>,
    #[serde(default)]
    pub definition_file_path: Option<String>,
    #[serde(default)]
    pub homepage_url: Option<String>,
    #[serde(default)]
    pub declared_licenses_processed: Option<ProcessedLicenses>,
    #[serde(default)]
    pub vcs_processed: Option<VcsInfo>,
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Scope {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<PackageReference>,
}

/// One node of a scope's declaration forest.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PackageReference {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<PackageReference>,
}

#[derive(Debug, Deserialize)]
pub struct CuratedPackage {
    pub package: Package,
}

#[derive(Debug, Default, Deserialize)]
pub struct Package {
    pub id: String,
    #[serde(default)]
    pub purl: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub homepage_url: Option<String>,
    #[serde(default)]
    pub declared_licenses_processed: Option<ProcessedLicenses>,
    #[serde(default)]
    pub source_artifact: Option<RemoteArtifact>,
    #[serde(default)]
    pub vcs_processed: Option<VcsInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessedLicenses {
    #[serde(default)]
    pub spdx_expression: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct VcsInfo {
    #[serde(rename = "type", default)]
    pub vcs_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub revision: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoteArtifact {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScannerRun {
    #[serde(default)]
    pub results: Option<ScanRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRecord {
    #[serde(default)]
    pub scan_results: Vec<ScanResultContainer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanResultContainer {
    pub id: String,
    #[serde(default)]
    pub results: Vec<ScanResult>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanResult {
    #[serde(default)]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub summary: Option<ScanSummaryRaw>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Provenance {
    #[serde(default)]
    pub original_vcs_info: Option<VcsInfo>,
    #[serde(default)]
    pub source_artifact: Option<RemoteArtifact>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanSummaryRaw {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub file_count: Option<u64>,
    #[serde(default)]
    pub license_findings: Vec<LicenseFinding>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LicenseFinding {
    pub license: String,
}

impl OrtResult {
    pub fn analyzer_result(&self) -> Option<&AnalyzerResult> {
        self.analyzer.as_ref().and_then(|a| a.result.as_ref())
    }

    pub fn scan_results(&self) -> &[ScanResultContainer] {
        self.scanner
            .as_ref()
            .and_then(|s| s.results.as_ref())
            .map_or(&[] as &[_], |r| r.scan_results.as_slice())
    }
}
