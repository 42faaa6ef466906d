//! Analysis package selection.
//!
//! A package names the guest-side behavioral monitors enabled for a run.
//! The declared file type picks the package; unknown types fall back to
//! the generic package.

use serde::{Deserialize, Serialize};

use crate::models::task::FileType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPackage {
    pub name: String,
    pub monitors: Vec<String>,
}

pub fn select_package(file_type: FileType) -> AnalysisPackage {
    let (name, monitors) = match file_type {
        FileType::Exe => (
            "exe",
            vec!["process", "filesystem", "registry", "network"],
        ),
        FileType::Dll => (
            "dll",
            vec!["process", "filesystem", "registry", "network"],
        ),
        FileType::Pdf => ("pdf", vec!["reader", "filesystem", "network"]),
        FileType::Doc => ("doc", vec!["office", "process", "filesystem", "network"]),
        FileType::Js => ("js", vec!["script", "process", "network"]),
        FileType::PowerShell => ("ps1", vec!["script", "process", "registry", "network"]),
        FileType::Generic => ("generic", vec!["process", "filesystem", "network"]),
    };

    AnalysisPackage {
        name: name.to_string(),
        monitors: monitors.into_iter().map(String::from).collect(),
    }
}
