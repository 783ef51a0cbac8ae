//! Plan parsing.
//!
//! The architect is instructed to end its plan with a fenced JSON block
//! listing the files to produce. Tolerant fallbacks handle backends that
//! ignore the instruction: a bare JSON object anywhere in the plan, then a
//! markdown bullet list of paths.

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::state::session::FileAction;
use crate::util::{extract_fenced_block, extract_json_object};

static BULLET_FILE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s+`?([\w./-]+\.\w+)`?\s*(?:\((create|modify)\))?").unwrap()
});

/// One entry of the flat file plan. Entries carry no inter-dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePlanEntry {
    pub path: PathBuf,
    pub action: FileAction,
}

#[derive(Debug, Deserialize)]
struct PlanDoc {
    files: Vec<PlanDocEntry>,
}

#[derive(Debug, Deserialize)]
struct PlanDocEntry {
    path: String,
    #[serde(default)]
    action: Option<FileAction>,
}

/// Parse the plan text into the file list, preserving plan order and
/// dropping duplicates.
pub fn parse_file_plan(plan: &str) -> Vec<FilePlanEntry> {
    let candidates = extract_fenced_block(plan)
        .and_then(|block| parse_json_files(&block))
        .or_else(|| parse_json_files(plan))
        .unwrap_or_else(|| parse_bullets(plan));

    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|entry| seen.insert(entry.path.clone()))
        .collect()
}

fn parse_json_files(text: &str) -> Option<Vec<FilePlanEntry>> {
    let object = extract_json_object(text)?;
    let doc: PlanDoc = serde_json::from_str(&object).ok()?;
    if doc.files.is_empty() {
        return None;
    }
    Some(
        doc.files
            .into_iter()
            .map(|entry| FilePlanEntry {
                path: PathBuf::from(entry.path),
                action: entry.action.unwrap_or(FileAction::Create),
            })
            .collect(),
    )
}

fn parse_bullets(plan: &str) -> Vec<FilePlanEntry> {
    plan.lines()
        .filter_map(|line| {
            let caps = BULLET_FILE_REGEX.captures(line)?;
            let path = PathBuf::from(caps.get(1)?.as_str());
            let action = match caps.get(2).map(|m| m.as_str()) {
                Some("modify") => FileAction::Modify,
                _ => FileAction::Create,
            };
            Some(FilePlanEntry { path, action })
        })
        .collect()
}
