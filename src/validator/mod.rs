//! Syntax validation and test-runner probing for generated artifacts.
//!
//! Each supported language gets a parse-only probe: data languages are
//! parsed in-process, everything else goes through the language's own
//! toolchain as an opaque CLI, the same philosophy as the adapters. A
//! missing toolchain degrades to the completeness heuristic with a
//! warning rather than failing the file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::warn;
use walkdir::WalkDir;

use crate::state::session::ValidationOutcome;

/// Deadline for one syntax probe subprocess.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
    Go,
    Rust,
    Json,
    Yaml,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Json => "json",
            Language::Yaml => "yaml",
        }
    }
}

/// Map a file extension to its language tag.
pub fn detect_language(path: &Path) -> Option<Language> {
    match path.extension()?.to_str()? {
        "py" => Some(Language::Python),
        "js" | "mjs" | "cjs" => Some(Language::Javascript),
        "ts" | "tsx" => Some(Language::Typescript),
        "go" => Some(Language::Go),
        "rs" => Some(Language::Rust),
        "json" => Some(Language::Json),
        "yaml" | "yml" => Some(Language::Yaml),
        _ => None,
    }
}

/// Validate one file: completeness heuristic first, then the language's
/// syntax probe. Files in unrecognized languages pass with heuristics only.
pub async fn validate_file(path: &Path, declared: Option<Language>) -> ValidationOutcome {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            return ValidationOutcome {
                valid: false,
                errors: vec![format!("unreadable: {e}")],
            };
        }
    };

    let language = declared.or_else(|| detect_language(path));
    let mut errors = check_completeness(&content, language);

    if let Some(language) = language {
        match syntax_probe(path, &content, language).await {
            Ok(mut probe_errors) => errors.append(&mut probe_errors),
            Err(e) => {
                warn!(
                    file = %path.display(),
                    language = language.as_str(),
                    "syntax probe unavailable, heuristics only: {e}"
                );
            }
        }
    }

    ValidationOutcome {
        valid: errors.is_empty(),
        errors,
    }
}

/// Flag files that look cut off mid-generation: unbalanced delimiters, an
/// unclosed fence, a trailing ellipsis, or language stub markers.
pub fn check_completeness(content: &str, language: Option<Language>) -> Vec<String> {
    let mut issues = Vec::new();

    for (open, close, name) in [('{', '}', "brace"), ('[', ']', "bracket"), ('(', ')', "paren")] {
        let opens = content.matches(open).count();
        let closes = content.matches(close).count();
        if opens != closes {
            issues.push(format!("unbalanced {name}s: {opens} open vs {closes} close"));
        }
    }

    let fences = content.lines().filter(|l| l.trim_start().starts_with("```")).count();
    if fences % 2 != 0 {
        issues.push("unclosed fenced code block".to_string());
    }

    if let Some(last) = content.lines().rev().find(|l| !l.trim().is_empty()) {
        let trimmed = last.trim();
        if trimmed == "..." || trimmed == "…" {
            issues.push("trailing ellipsis suggests truncated output".to_string());
        }
    }

    match language {
        Some(Language::Python) => {
            let mut lines = content.lines().peekable();
            while let Some(line) = lines.next() {
                if line.trim_start().starts_with("def ") && line.trim_end().ends_with(':')
                    && let Some(next) = lines.peek()
                    && next.trim() == "pass"
                {
                    issues.push("stub function body (lone pass)".to_string());
                }
            }
        }
        Some(Language::Rust) => {
            if content.contains("unimplemented!()") || content.contains("todo!()") {
                issues.push("stub macro left in body".to_string());
            }
        }
        _ => {}
    }
    if content
        .lines()
        .any(|l| l.trim().starts_with("# TODO") || l.trim().starts_with("// TODO"))
        && content.lines().count() < 5
    {
        issues.push("file is only a TODO stub".to_string());
    }

    issues
}

/// Run the language's parse-only probe. `Err` means the probe itself could
/// not run (missing toolchain); `Ok(errors)` is the verdict.
async fn syntax_probe(path: &Path, content: &str, language: Language) -> Result<Vec<String>> {
    match language {
        Language::Json => Ok(match serde_json::from_str::<serde_json::Value>(content) {
            Ok(_) => vec![],
            Err(e) => vec![format!("line {} column {}: {e}", e.line(), e.column())],
        }),
        Language::Yaml => Ok(match serde_yaml::from_str::<serde_yaml::Value>(content) {
            Ok(_) => vec![],
            Err(e) => vec![e.to_string()],
        }),
        Language::Python => probe_command("python3", &["-m", "py_compile"], path).await,
        Language::Javascript => probe_command("node", &["--check"], path).await,
        Language::Typescript => probe_command("tsc", &["--noEmit"], path).await,
        Language::Go => probe_command("gofmt", &["-e"], path).await,
        Language::Rust => {
            let out_dir = std::env::temp_dir().join("orchestra-rustc-probe");
            std::fs::create_dir_all(&out_dir).ok();
            let out_dir = out_dir.to_string_lossy().to_string();
            probe_command(
                "rustc",
                &[
                    "--edition",
                    "2021",
                    "--crate-type",
                    "lib",
                    "--emit=metadata",
                    "--out-dir",
                    &out_dir,
                ],
                path,
            )
            .await
        }
    }
}

async fn probe_command(program: &str, args: &[&str], file: &Path) -> Result<Vec<String>> {
    let child = Command::new(program)
        .args(args)
        .arg(file)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, child)
        .await
        .with_context(|| format!("{program} probe timed out"))?
        .with_context(|| format!("failed to run {program}"))?;

    if output.status.success() {
        return Ok(vec![]);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let errors: Vec<String> = stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(20)
        .map(|l| l.to_string())
        .collect();
    if errors.is_empty() {
        Ok(vec![format!("{program} exited {}", output.status)])
    } else {
        Ok(errors)
    }
}

/// A detected test framework and how to invoke it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFramework {
    CargoTest,
    Pytest,
    Jest,
    Vitest,
    Mocha,
    GoTest,
    NpmTest,
}

impl TestFramework {
    pub fn command(&self) -> &'static str {
        match self {
            TestFramework::CargoTest => "cargo test",
            TestFramework::Pytest => "pytest",
            TestFramework::Jest => "npx jest",
            TestFramework::Vitest => "npx vitest run",
            TestFramework::Mocha => "npx mocha",
            TestFramework::GoTest => "go test ./...",
            TestFramework::NpmTest => "npm test",
        }
    }
}

/// Map marker files near the workspace root to a test framework.
/// The walk stops one directory level down; deep trees are not scanned.
pub fn detect_test_framework(root: &Path) -> Option<TestFramework> {
    let mut package_json: Option<PathBuf> = None;
    for entry in WalkDir::new(root)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy().to_string();
        match name.as_str() {
            "pytest.ini" => return Some(TestFramework::Pytest),
            "pyproject.toml" => {
                if std::fs::read_to_string(entry.path())
                    .map(|c| c.contains("[tool.pytest"))
                    .unwrap_or(false)
                {
                    return Some(TestFramework::Pytest);
                }
            }
            "Cargo.toml" => return Some(TestFramework::CargoTest),
            "go.mod" => return Some(TestFramework::GoTest),
            "package.json" => package_json = Some(entry.path().to_path_buf()),
            _ => {}
        }
    }

    let path = package_json?;
    let content = std::fs::read_to_string(&path).ok()?;
    let doc: serde_json::Value = serde_json::from_str(&content).ok()?;
    let has_dep = |name: &str| {
        ["dependencies", "devDependencies"]
            .iter()
            .any(|section| doc.get(section).and_then(|d| d.get(name)).is_some())
    };
    if has_dep("vitest") {
        return Some(TestFramework::Vitest);
    }
    if has_dep("jest") {
        return Some(TestFramework::Jest);
    }
    if has_dep("mocha") {
        return Some(TestFramework::Mocha);
    }
    if doc.get("scripts").and_then(|s| s.get("test")).is_some() {
        return Some(TestFramework::NpmTest);
    }
    None
}

#[derive(Debug, Clone)]
pub struct TestRunResult {
    pub success: bool,
    pub output: String,
}

/// Run the test command through the shell with a deadline.
pub async fn run_tests(command: &str, workdir: &Path, timeout: Duration) -> TestRunResult {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            TestRunResult {
                success: output.status.success(),
                output: text,
            }
        }
        Ok(Err(e)) => TestRunResult {
            success: false,
            output: format!("failed to run test command: {e}"),
        },
        Err(_) => TestRunResult {
            success: false,
            output: format!("test command timed out after {}s", timeout.as_secs()),
        },
    }
}
