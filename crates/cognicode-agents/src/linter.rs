use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use cognicode_core::{Agent, InferenceError, InferenceRequest, Operation, ProgressReporter};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{postprocess, Stage, StageRunner};
use crate::source::{extract_functions, has_loose_equality, Family, FunctionInfo};

const MAX_LINE_LEN: usize = 120;

static VAR_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bvar\s+\w").expect("var regex"));
static TS_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\s*any\b").expect("any regex"));
static PY_BARE_EXCEPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*except\s*:").expect("bare except regex"));
static PY_PRINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bprint\s*\(").expect("print regex"));
static BRANCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|elif|for|while|switch|case|catch|except)\b|&&|\|\|").expect("branch regex")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Debug, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub rule: &'static str,
    pub message: String,
    pub line: usize,
    pub suggestion: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct Metrics {
    pub complexity: usize,
    pub maintainability: usize,
    pub lines_of_code: usize,
    pub quality_score: u8,
}

/// Rule-based static analysis behind the `analyze` operation.
pub struct LinterAgent {
    stage_latency: Duration,
}

impl LinterAgent {
    pub const NAME: &'static str = "LinterAgent";
    pub const MODEL: &'static str = "cognicode-lint-rules-v1";

    pub fn new(stage_latency: Duration) -> Self {
        Self { stage_latency }
    }
}

#[async_trait]
impl Agent for LinterAgent {
    fn operation(&self) -> Operation {
        Operation::Analyze
    }

    fn name(&self) -> &str {
        Self::NAME
    }

    fn model(&self) -> &str {
        Self::MODEL
    }

    async fn infer(
        &self,
        request: &InferenceRequest,
        progress: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<Value, InferenceError> {
        let stages = StageRunner::new(progress, &cancel, self.stage_latency);

        stages.enter(Stage::Initializing).await?;
        let family = Family::of(&request.language);

        stages.enter(Stage::Running).await?;
        let issues = lint(&request.snippet, family);
        let functions = extract_functions(&request.snippet, family);

        stages.enter(Stage::Processing).await?;
        let metrics = measure(&request.snippet, family, &issues, &functions);
        let insights = insights(&functions, &metrics);
        tracing::debug!(
            language = %request.language,
            issues = issues.len(),
            functions = functions.len(),
            complexity = metrics.complexity,
            "lint finished"
        );

        let mut fields = Map::new();
        fields.insert("language".into(), Value::String(request.language.clone()));
        fields.insert("issues".into(), to_value(&issues)?);
        fields.insert("metrics".into(), to_value(&metrics)?);
        fields.insert("functions".into(), to_value(&functions)?);
        fields.insert("ai_insights".into(), insights);

        stages.enter(Stage::Complete).await?;
        Ok(postprocess(fields, Self::NAME, Self::MODEL))
    }
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<Value, InferenceError> {
    serde_json::to_value(value).map_err(|e| InferenceError::new("serialization", e.to_string()))
}

struct Rule {
    id: &'static str,
    severity: Severity,
    message: &'static str,
    suggestion: &'static str,
}

impl Rule {
    fn at(&self, line: usize) -> Issue {
        Issue {
            severity: self.severity,
            rule: self.id,
            message: self.message.to_string(),
            line,
            suggestion: self.suggestion,
        }
    }
}

const NO_VAR: Rule = Rule {
    id: "no-var",
    severity: Severity::Warning,
    message: "Use const or let instead of var",
    suggestion: "Replace var with const or let for better scoping",
};
const EQEQEQ: Rule = Rule {
    id: "eqeqeq",
    severity: Severity::Warning,
    message: "Use strict equality (===) instead of loose equality (==)",
    suggestion: "Replace == with === for type-safe comparison",
};
const NO_CONSOLE: Rule = Rule {
    id: "no-console",
    severity: Severity::Info,
    message: "Console statement found",
    suggestion: "Remove console.log statements in production code",
};
const NO_EXPLICIT_ANY: Rule = Rule {
    id: "no-explicit-any",
    severity: Severity::Warning,
    message: "Avoid using any type",
    suggestion: "Use specific types for better type safety",
};
const BARE_EXCEPT: Rule = Rule {
    id: "bare-except",
    severity: Severity::Warning,
    message: "Bare except clause catches everything",
    suggestion: "Catch a specific exception type",
};
const NO_PRINT: Rule = Rule {
    id: "no-print",
    severity: Severity::Info,
    message: "print statement found",
    suggestion: "Use the logging module instead of print",
};
const NO_SYSTEM_OUT: Rule = Rule {
    id: "no-system-out",
    severity: Severity::Info,
    message: "System.out.print statement found",
    suggestion: "Use logging framework instead of System.out.print",
};
const MAX_LINE_LENGTH: Rule = Rule {
    id: "max-line-length",
    severity: Severity::Info,
    message: "Line too long",
    suggestion: "Keep lines under 120 characters for better readability",
};

fn lint(snippet: &str, family: Family) -> Vec<Issue> {
    let mut issues = Vec::new();
    for (idx, line) in snippet.lines().enumerate() {
        let line_no = idx + 1;
        let code = line.trim();

        if family.is_js_like() {
            if VAR_DECL.is_match(code) {
                issues.push(NO_VAR.at(line_no));
            }
            if has_loose_equality(code) {
                issues.push(EQEQEQ.at(line_no));
            }
            if code.contains("console.log") {
                issues.push(NO_CONSOLE.at(line_no));
            }
        }
        if family == Family::TypeScript && TS_ANY.is_match(code) {
            issues.push(NO_EXPLICIT_ANY.at(line_no));
        }
        if family == Family::Python {
            if PY_BARE_EXCEPT.is_match(line) {
                issues.push(BARE_EXCEPT.at(line_no));
            }
            if PY_PRINT.is_match(code) {
                issues.push(NO_PRINT.at(line_no));
            }
        }
        if family == Family::Java && code.contains("System.out.print") {
            issues.push(NO_SYSTEM_OUT.at(line_no));
        }
        if line.chars().count() > MAX_LINE_LEN {
            issues.push(MAX_LINE_LENGTH.at(line_no));
        }
    }
    issues
}

fn measure(snippet: &str, family: Family, issues: &[Issue], functions: &[FunctionInfo]) -> Metrics {
    let mut complexity = 1 + BRANCH.find_iter(snippet).count();
    if functions.iter().any(|f| f.recursive) {
        complexity += 5;
    }

    let base: usize = if family == Family::Other { 8 } else { 10 };
    let maintainability = base.saturating_sub(issues.len()).max(1);

    let penalty: usize = issues
        .iter()
        .map(|i| match i.severity {
            Severity::Error => 10,
            Severity::Warning => 5,
            Severity::Info => 1,
        })
        .sum::<usize>()
        + 2 * (complexity - 1).min(20);

    Metrics {
        complexity,
        maintainability,
        lines_of_code: snippet.lines().count(),
        quality_score: 100usize.saturating_sub(penalty) as u8,
    }
}

fn insights(functions: &[FunctionInfo], metrics: &Metrics) -> Value {
    let mut performance = Vec::new();
    let mut smells = Vec::new();
    for f in functions.iter().filter(|f| f.recursive) {
        performance.push(format!(
            "Function '{}' is recursive; consider iteration or memoization",
            f.name
        ));
    }
    if metrics.complexity > 10 {
        smells.push("Function complexity could be reduced".to_string());
    }
    if metrics.lines_of_code > 50 {
        smells.push("Snippet is long; consider splitting it into smaller units".to_string());
    }
    json!({
        "semantic_issues": [],
        "performance_suggestions": performance,
        "security_concerns": [],
        "code_smells": smells,
    })
}
