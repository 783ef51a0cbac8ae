//! Task classification and the normalized feature vector.
//!
//! The context of a session is flattened into a fixed-width vector: one-hot
//! task type and domain, ordinal complexity and risk, then the scalar
//! signals, padded out to [`FEATURE_WIDTH`]. Classification is keyword
//! matching; it only has to be stable, not clever.

use serde::{Deserialize, Serialize};

/// Fixed width every state vector is padded or truncated to.
pub const FEATURE_WIDTH: usize = 64;

/// Thirteen task categories, one-hot encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    CodeGeneration,
    Refactoring,
    BugFix,
    Testing,
    Documentation,
    Api,
    Database,
    Frontend,
    Backend,
    Infrastructure,
    DataProcessing,
    Integration,
    Research,
}

impl TaskType {
    pub const ALL: [TaskType; 13] = [
        TaskType::CodeGeneration,
        TaskType::Refactoring,
        TaskType::BugFix,
        TaskType::Testing,
        TaskType::Documentation,
        TaskType::Api,
        TaskType::Database,
        TaskType::Frontend,
        TaskType::Backend,
        TaskType::Infrastructure,
        TaskType::DataProcessing,
        TaskType::Integration,
        TaskType::Research,
    ];

    /// Classify a task description by keywords, first match wins.
    pub fn classify(task: &str) -> Self {
        let t = task.to_lowercase();
        if t.contains("refactor") || t.contains("cleanup") || t.contains("restructure") {
            return TaskType::Refactoring;
        }
        if t.contains("fix") || t.contains("bug") || t.contains("patch") {
            return TaskType::BugFix;
        }
        if t.contains("test") || t.contains("coverage") {
            return TaskType::Testing;
        }
        if t.contains("document") || t.contains("readme") || t.contains("docs") {
            return TaskType::Documentation;
        }
        if t.contains("endpoint") || t.contains("api") || t.contains("rest") || t.contains("graphql")
        {
            return TaskType::Api;
        }
        if t.contains("database") || t.contains("schema") || t.contains("migration") || t.contains("sql")
        {
            return TaskType::Database;
        }
        if t.contains("frontend") || t.contains("ui ") || t.contains("component") || t.contains("react")
        {
            return TaskType::Frontend;
        }
        if t.contains("backend") || t.contains("server") || t.contains("service") {
            return TaskType::Backend;
        }
        if t.contains("deploy") || t.contains("docker") || t.contains("ci") || t.contains("pipeline")
        {
            return TaskType::Infrastructure;
        }
        if t.contains("etl") || t.contains("parse") || t.contains("transform") || t.contains("csv") {
            return TaskType::DataProcessing;
        }
        if t.contains("integrat") || t.contains("webhook") || t.contains("connect") {
            return TaskType::Integration;
        }
        if t.contains("research") || t.contains("investigate") || t.contains("explore") {
            return TaskType::Research;
        }
        TaskType::CodeGeneration
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CodeGeneration => "code_generation",
            TaskType::Refactoring => "refactoring",
            TaskType::BugFix => "bug_fix",
            TaskType::Testing => "testing",
            TaskType::Documentation => "documentation",
            TaskType::Api => "api",
            TaskType::Database => "database",
            TaskType::Frontend => "frontend",
            TaskType::Backend => "backend",
            TaskType::Infrastructure => "infrastructure",
            TaskType::DataProcessing => "data_processing",
            TaskType::Integration => "integration",
            TaskType::Research => "research",
        }
    }
}

/// Nine problem domains, one-hot encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Web,
    Cli,
    Systems,
    Data,
    MachineLearning,
    Mobile,
    Devops,
    Security,
    #[default]
    General,
}

impl Domain {
    pub const ALL: [Domain; 9] = [
        Domain::Web,
        Domain::Cli,
        Domain::Systems,
        Domain::Data,
        Domain::MachineLearning,
        Domain::Mobile,
        Domain::Devops,
        Domain::Security,
        Domain::General,
    ];

    pub fn classify(task: &str) -> Self {
        let t = task.to_lowercase();
        if t.contains("web") || t.contains("http") || t.contains("html") || t.contains("endpoint") {
            return Domain::Web;
        }
        if t.contains("cli") || t.contains("command line") || t.contains("terminal") {
            return Domain::Cli;
        }
        if t.contains("kernel") || t.contains("driver") || t.contains("memory") || t.contains("systems")
        {
            return Domain::Systems;
        }
        if t.contains("data") || t.contains("csv") || t.contains("etl") || t.contains("analytics") {
            return Domain::Data;
        }
        if t.contains("model") || t.contains("training") || t.contains("ml ") || t.contains("neural")
        {
            return Domain::MachineLearning;
        }
        if t.contains("android") || t.contains("ios") || t.contains("mobile") {
            return Domain::Mobile;
        }
        if t.contains("docker") || t.contains("kubernetes") || t.contains("deploy") || t.contains("ci/cd")
        {
            return Domain::Devops;
        }
        if t.contains("auth") || t.contains("crypto") || t.contains("security") || t.contains("vulnerab")
        {
            return Domain::Security;
        }
        Domain::General
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Web => "web",
            Domain::Cli => "cli",
            Domain::Systems => "systems",
            Domain::Data => "data",
            Domain::MachineLearning => "machine_learning",
            Domain::Mobile => "mobile",
            Domain::Devops => "devops",
            Domain::Security => "security",
            Domain::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

impl Complexity {
    /// Rough ordinal from task length and conjunction count.
    pub fn classify(task: &str) -> Self {
        let words = task.split_whitespace().count();
        let conjunctions = task.matches(" and ").count() + task.matches(", ").count();
        if words < 12 && conjunctions == 0 {
            Complexity::Simple
        } else if words > 40 || conjunctions > 3 {
            Complexity::Complex
        } else {
            Complexity::Medium
        }
    }

    fn ordinal(&self) -> f64 {
        match self {
            Complexity::Simple => 0.0,
            Complexity::Medium => 0.5,
            Complexity::Complex => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn classify(task: &str) -> Self {
        let t = task.to_lowercase();
        if t.contains("delete") || t.contains("migrat") || t.contains("production") || t.contains("auth")
        {
            Risk::High
        } else if t.contains("modify") || t.contains("refactor") || t.contains("update") {
            Risk::Medium
        } else {
            Risk::Low
        }
    }

    fn ordinal(&self) -> f64 {
        match self {
            Risk::Low => 0.0,
            Risk::Medium => 0.5,
            Risk::High => 1.0,
        }
    }
}

/// Everything the learning pipeline knows about a session before it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub task_type: TaskType,
    pub domain: Domain,
    pub complexity: Complexity,
    pub risk: Risk,
    /// Estimated wall time, minutes
    pub estimated_minutes: f64,
    /// 0..1, spread of domains in recent history
    pub domain_diversity: f64,
    pub skill_count: u32,
    /// 0..1 over past sessions
    pub historical_success_rate: f64,
    /// 0..1, how well past estimates matched reality
    pub time_accuracy: f64,
    /// 0..1 from past resource usage
    pub resource_efficiency: f64,
    pub concurrent_tasks: u32,
    /// 0..1 normalized load average
    pub system_load: f64,
    /// availability flag per role: architect, executor, auditor, consultant
    pub agent_availability: [bool; 4],
}

impl TaskContext {
    /// Derive a context from a bare task description with neutral history.
    pub fn from_task(task: &str) -> Self {
        Self {
            task_type: TaskType::classify(task),
            domain: Domain::classify(task),
            complexity: Complexity::classify(task),
            risk: Risk::classify(task),
            estimated_minutes: 10.0,
            domain_diversity: 0.0,
            skill_count: 0,
            historical_success_rate: 0.5,
            time_accuracy: 0.5,
            resource_efficiency: 0.5,
            concurrent_tasks: 1,
            system_load: 0.0,
            agent_availability: [true; 4],
        }
    }

    /// Flatten to the fixed-width state vector.
    pub fn feature_vector(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(FEATURE_WIDTH);
        for t in TaskType::ALL {
            v.push(if t == self.task_type { 1.0 } else { 0.0 });
        }
        for d in Domain::ALL {
            v.push(if d == self.domain { 1.0 } else { 0.0 });
        }
        v.push(self.complexity.ordinal());
        v.push(self.risk.ordinal());
        // estimated time normalized against a one-hour ceiling
        v.push((self.estimated_minutes / 60.0).clamp(0.0, 1.0));
        v.push(self.domain_diversity.clamp(0.0, 1.0));
        v.push((self.skill_count as f64 / 10.0).clamp(0.0, 1.0));
        v.push(self.historical_success_rate.clamp(0.0, 1.0));
        v.push(self.time_accuracy.clamp(0.0, 1.0));
        v.push(self.resource_efficiency.clamp(0.0, 1.0));
        v.push((self.concurrent_tasks as f64 / 8.0).clamp(0.0, 1.0));
        v.push(self.system_load.clamp(0.0, 1.0));
        for available in self.agent_availability {
            v.push(if available { 1.0 } else { 0.0 });
        }
        v.resize(FEATURE_WIDTH, 0.0);
        v.truncate(FEATURE_WIDTH);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_classification_keywords() {
        assert_eq!(TaskType::classify("Fix the login bug"), TaskType::BugFix);
        assert_eq!(
            TaskType::classify("Implement a user-creation endpoint"),
            TaskType::Api
        );
        assert_eq!(TaskType::classify("Add unit tests"), TaskType::Testing);
        assert_eq!(
            TaskType::classify("Create hello.py that prints 'hello world'"),
            TaskType::CodeGeneration
        );
    }

    #[test]
    fn domain_classification_keywords() {
        assert_eq!(Domain::classify("build an http endpoint"), Domain::Web);
        assert_eq!(Domain::classify("a cli tool for notes"), Domain::Cli);
        assert_eq!(Domain::classify("print hello world"), Domain::General);
    }

    #[test]
    fn complexity_and_risk_ordinals() {
        assert_eq!(Complexity::classify("print hello"), Complexity::Simple);
        assert_eq!(Risk::classify("delete old production tables"), Risk::High);
        assert_eq!(Risk::classify("write a poem generator"), Risk::Low);
    }

    #[test]
    fn feature_vector_has_fixed_width() {
        let ctx = TaskContext::from_task("Create hello.py");
        let v = ctx.feature_vector();
        assert_eq!(v.len(), FEATURE_WIDTH);
    }

    #[test]
    fn feature_vector_is_one_hot_over_task_types() {
        let ctx = TaskContext::from_task("Fix the crash in parser");
        let v = ctx.feature_vector();
        let ones: f64 = v[..TaskType::ALL.len()].iter().sum();
        assert!((ones - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn feature_vector_is_deterministic() {
        let ctx = TaskContext::from_task("Implement an api endpoint");
        assert_eq!(ctx.feature_vector(), ctx.feature_vector());
    }

    #[test]
    fn scalars_are_clamped() {
        let mut ctx = TaskContext::from_task("x");
        ctx.estimated_minutes = 100_000.0;
        ctx.system_load = 42.0;
        let v = ctx.feature_vector();
        assert!(v.iter().all(|x| (0.0..=1.0).contains(x)));
    }
}
