// Static pre-execution scanning of script source.
//
// The scanner is a pattern list, not a parser: it flags source that
// reaches for process, filesystem or network capabilities, eval
// equivalents, prototype tampering, unbounded loops and oversized literal
// allocations. Callers must refuse execution when any High or Critical
// issue is present (see `has_blocking_issues`).

use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Severity attached to a scan finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl IssueSeverity {
    /// High and Critical findings block execution
    pub fn is_blocking(&self) -> bool {
        *self >= IssueSeverity::High
    }
}

/// One finding produced by the scanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeIssue {
    pub rule_id: String,
    pub severity: IssueSeverity,
    pub message: String,
    /// 1-based line of the first match
    pub line: usize,
}

struct ScanRule {
    id: &'static str,
    pattern: Regex,
    severity: IssueSeverity,
    message: &'static str,
}

const DEFAULT_RULES: &[(&str, &str, IssueSeverity, &str)] = &[
    (
        "dynamic-require",
        r"\brequire\s*\(",
        IssueSeverity::Critical,
        "dynamic module loading is not available in the sandbox",
    ),
    (
        "dynamic-import",
        r"\bimport\s*\(|^\s*import\s",
        IssueSeverity::Critical,
        "module imports are not available in the sandbox",
    ),
    (
        "process-access",
        r"\bprocess\s*(\.|\[)",
        IssueSeverity::Critical,
        "direct process access",
    ),
    (
        "child-process",
        r"\bchild_process\b|\b(spawn|execSync|execFile)\s*\(",
        IssueSeverity::Critical,
        "child process execution",
    ),
    (
        "eval-call",
        r"\beval\s*\(",
        IssueSeverity::Critical,
        "eval executes arbitrary code",
    ),
    (
        "function-constructor",
        r"\bnew\s+Function\b|\bFunction\s*\(",
        IssueSeverity::High,
        "Function constructor is an eval equivalent",
    ),
    (
        "filesystem-access",
        r"\bfs\s*(\.|\[)|\b(readFileSync|writeFileSync|readdirSync|unlinkSync)\b",
        IssueSeverity::High,
        "filesystem access",
    ),
    (
        "network-access",
        r"\b(fetch|XMLHttpRequest|WebSocket)\b|\b(http|https|net|dgram)\s*\.\s*(request|get|connect|createConnection|createSocket)\b",
        IssueSeverity::High,
        "network access",
    ),
    (
        "prototype-tampering",
        r"__proto__|\bconstructor\s*(\[|\.)|\.prototype\b",
        IssueSeverity::High,
        "prototype chain access",
    ),
    (
        "global-object",
        r"\bglobalThis\b|\bglobal\s*(\.|\[)",
        IssueSeverity::High,
        "global object access",
    ),
    (
        "timer-scheduling",
        r"\b(setTimeout|setInterval|setImmediate)\s*\(",
        IssueSeverity::High,
        "timers outlive the sandboxed call",
    ),
    (
        "unbounded-while",
        r"\bwhile\s*\(\s*(true|1)\s*\)",
        IssueSeverity::Medium,
        "unbounded loop relies on the timeout to terminate",
    ),
    (
        "unbounded-for",
        r"\bfor\s*\(\s*;\s*;\s*\)",
        IssueSeverity::Medium,
        "unbounded loop relies on the timeout to terminate",
    ),
    (
        "oversized-repeat",
        r"\.repeat\s*\(\s*\d{6,}",
        IssueSeverity::High,
        "oversized string allocation",
    ),
    (
        "oversized-array",
        r"\bnew\s+Array\s*\(\s*\d{5,}|\bArray\s*\(\s*\d{5,}",
        IssueSeverity::High,
        "oversized array allocation",
    ),
    (
        "large-repeat",
        r"\.repeat\s*\(\s*\d{4,5}\b",
        IssueSeverity::Medium,
        "large string allocation",
    ),
];

/// Source larger than this is reported as an oversized literal payload
const MAX_SOURCE_BYTES: usize = 256 * 1024;

/// Regex-driven source scanner
pub struct CodeScanner {
    rules: Vec<ScanRule>,
}

impl CodeScanner {
    pub fn new() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(id, pattern, severity, message)| match Regex::new(pattern) {
                Ok(pattern) => Some(ScanRule {
                    id,
                    pattern,
                    severity: *severity,
                    message,
                }),
                Err(e) => {
                    warn!("Skipping scan rule {}: {}", id, e);
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Scan source and return every finding, most severe first
    pub fn scan(&self, code: &str) -> Vec<CodeIssue> {
        let mut issues = Vec::new();

        for rule in &self.rules {
            if let Some(m) = rule.pattern.find(code) {
                issues.push(CodeIssue {
                    rule_id: rule.id.to_string(),
                    severity: rule.severity,
                    message: rule.message.to_string(),
                    line: line_of(code, m.start()),
                });
            }
        }

        if code.len() > MAX_SOURCE_BYTES {
            issues.push(CodeIssue {
                rule_id: "oversized-source".to_string(),
                severity: IssueSeverity::Medium,
                message: format!("script is {} bytes", code.len()),
                line: 1,
            });
        }

        issues.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.line.cmp(&b.line)));
        issues
    }
}

impl Default for CodeScanner {
    fn default() -> Self {
        Self::new()
    }
}

pub fn has_blocking_issues(issues: &[CodeIssue]) -> bool {
    issues.iter().any(|i| i.severity.is_blocking())
}

fn line_of(code: &str, offset: usize) -> usize {
    code[..offset].matches('\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_code_has_no_issues() {
        let scanner = CodeScanner::new();
        let issues = scanner.scan("let n = context.rules.deny.length;\nreturn n > 0;");
        assert!(issues.is_empty());
    }

    #[test]
    fn test_process_and_fs_access_are_blocking() {
        let scanner = CodeScanner::new();

        let issues = scanner.scan("return process.env.HOME;");
        assert_eq!(issues[0].rule_id, "process-access");
        assert_eq!(issues[0].severity, IssueSeverity::Critical);
        assert!(has_blocking_issues(&issues));

        let issues = scanner.scan("let x = 1;\nlet data = fs.readFileSync('/etc/passwd');");
        assert!(issues.iter().any(|i| i.rule_id == "filesystem-access" && i.line == 2));
        assert!(has_blocking_issues(&issues));
    }

    #[test]
    fn test_unbounded_loop_is_not_blocking() {
        let scanner = CodeScanner::new();
        let issues = scanner.scan("while (true) { }");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Medium);
        assert!(!has_blocking_issues(&issues));
    }

    #[test]
    fn test_oversized_allocation() {
        let scanner = CodeScanner::new();
        let issues = scanner.scan("let s = 'a'.repeat(100000000);");
        assert!(issues.iter().any(|i| i.rule_id == "oversized-repeat"));
        assert!(has_blocking_issues(&issues));
    }

    #[test]
    fn test_issues_sorted_by_severity() {
        let scanner = CodeScanner::new();
        let issues = scanner.scan("while (true) { eval('1') }");
        assert_eq!(issues.first().map(|i| i.severity), Some(IssueSeverity::Critical));
        assert_eq!(issues.last().map(|i| i.severity), Some(IssueSeverity::Medium));
    }
}
