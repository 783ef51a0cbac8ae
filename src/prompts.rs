//! Role prompt builders.
//!
//! Prompts are the only channel into a backend, and scratch files the only
//! channel out, so every prompt names the exact paths the role must write.

use std::path::Path;

use crate::plan::FilePlanEntry;
use crate::state::session::FileAction;

/// Architect: produce the plan file, ending in the machine-readable block.
pub fn architect_prompt(task: &str, plan_path: &Path) -> String {
    format!(
        r#"You are the ARCHITECT for an automated coding session.

## TASK
{task}

## INSTRUCTIONS
1. Design a concrete implementation plan for the task.
2. Write the complete plan to the file `{plan}` (create it; overwrite if present).
3. Keep the plan short: numbered steps, then the file list.
4. End the plan file with a fenced JSON block listing every file to produce:

```json
{{"files": [{{"path": "relative/path.ext", "action": "create"}}]}}
```

Use action "modify" for files that already exist. Do not write any other
files. Do not print the plan to stdout; only the file matters."#,
        task = task,
        plan = plan_path.display(),
    )
}

/// Executor: write exactly one target file, optionally resuming partial
/// content, with audit feedback and a consultant solution folded in.
pub fn executor_prompt(
    plan: &str,
    entry: &FilePlanEntry,
    help_needed_path: &Path,
    feedback: Option<&str>,
    solution: Option<&str>,
    resume_partial: bool,
) -> String {
    let action = match entry.action {
        FileAction::Create => "Create",
        FileAction::Modify => "Modify",
    };
    let mut prompt = format!(
        r#"You are the EXECUTOR for an automated coding session.

## PLAN
{plan}

## TARGET
{action} the file `{path}` so it fulfils its part of the plan.
Write the complete file content directly to that path. Do not touch other files.
"#,
        plan = plan,
        action = action,
        path = entry.path.display(),
    );

    if resume_partial {
        prompt.push_str(
            "\nThe file contains a partial previous attempt. Resume from it: keep what is \
             correct and complete the rest.\n",
        );
    }
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\n## AUDIT FEEDBACK\nA previous iteration was rejected. Address every point:\n{feedback}\n"
        ));
    }
    if let Some(solution) = solution {
        prompt.push_str(&format!(
            "\n## CONSULTANT SOLUTION\nA consultant resolved an earlier blocker. Apply it:\n{solution}\n"
        ));
    }
    prompt.push_str(&format!(
        "\nIf you hit an algorithmic blocker you cannot resolve, describe it in \
         `{help}` and stop.\n",
        help = help_needed_path.display(),
    ));
    prompt
}

/// Auditor: verdict on the first line of the audit file, feedback after.
pub fn auditor_prompt(plan: &str, changed_files: &[&Path], audit_path: &Path) -> String {
    let listing = if changed_files.is_empty() {
        "(no files were changed this iteration)".to_string()
    } else {
        changed_files
            .iter()
            .map(|p| format!("- {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        r#"You are the AUDITOR for an automated coding session.

## PLAN
{plan}

## CHANGED FILES
{listing}

## INSTRUCTIONS
Review the changed files against the plan. Then write your verdict to
`{audit}`:
- The FIRST line must be exactly `APPROVED` or `NEEDS_WORK`.
- After a NEEDS_WORK verdict, list every problem the executor must fix,
  one per line.

Write nothing else anywhere."#,
        plan = plan,
        listing = listing,
        audit = audit_path.display(),
    )
}

/// Consultant: answer a help-needed file into the solution file.
pub fn consultant_prompt(help_needed: &str, solution_path: &Path) -> String {
    format!(
        r#"You are the CONSULTANT for an automated coding session.

The executor is blocked:

{help_needed}

Write a concrete, directly applicable solution (algorithm, pseudo-code, or
exact code) to the file `{solution}`. Be specific enough that the executor
can apply it without further questions."#,
        help_needed = help_needed,
        solution = solution_path.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn architect_prompt_names_plan_path_and_task() {
        let prompt = architect_prompt("Build a todo API", Path::new(".orchestra/plan"));
        assert!(prompt.contains("Build a todo API"));
        assert!(prompt.contains(".orchestra/plan"));
        assert!(prompt.contains("\"files\""));
    }

    #[test]
    fn executor_prompt_includes_feedback_and_solution_sections() {
        let entry = FilePlanEntry {
            path: PathBuf::from("src/api.py"),
            action: crate::state::session::FileAction::Modify,
        };
        let prompt = executor_prompt(
            "the plan",
            &entry,
            Path::new(".orchestra/help-needed"),
            Some("validation missing"),
            Some("use a trie"),
            true,
        );
        assert!(prompt.contains("Modify the file `src/api.py`"));
        assert!(prompt.contains("AUDIT FEEDBACK"));
        assert!(prompt.contains("validation missing"));
        assert!(prompt.contains("CONSULTANT SOLUTION"));
        assert!(prompt.contains("use a trie"));
        assert!(prompt.contains("Resume from it"));
        assert!(prompt.contains(".orchestra/help-needed"));
    }

    #[test]
    fn executor_prompt_minimal_omits_optional_sections() {
        let entry = FilePlanEntry {
            path: PathBuf::from("hello.py"),
            action: crate::state::session::FileAction::Create,
        };
        let prompt = executor_prompt(
            "plan",
            &entry,
            Path::new("help"),
            None,
            None,
            false,
        );
        assert!(!prompt.contains("AUDIT FEEDBACK"));
        assert!(!prompt.contains("CONSULTANT SOLUTION"));
        assert!(!prompt.contains("Resume from it"));
    }

    #[test]
    fn auditor_prompt_handles_empty_change_set() {
        let prompt = auditor_prompt("plan", &[], Path::new(".orchestra/audit"));
        assert!(prompt.contains("no files were changed"));
        assert!(prompt.contains("`APPROVED` or `NEEDS_WORK`"));
    }

    #[test]
    fn consultant_prompt_embeds_blocker_text() {
        let prompt = consultant_prompt("stuck on cycle detection", Path::new(".orchestra/solution"));
        assert!(prompt.contains("stuck on cycle detection"));
        assert!(prompt.contains(".orchestra/solution"));
    }
}
