//! Lightweight, regex-based source inspection shared by the built-in agents.
//!
//! Nothing here parses; every helper works line- or pattern-wise and is
//! tolerant of snippets that would not compile.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static JS_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bfunction\s+(\w+)\s*\(([^)]*)\)").expect("js function regex")
});

static JS_BOUND_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:const|let|var)\s+(\w+)\s*=\s*(?:async\s+)?(?:function\s*)?\(([^)]*)\)\s*(?:=>|\{)")
        .expect("js bound function regex")
});

static PY_DEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:async\s+)?def\s+(\w+)\s*\(([^)]*)\)").expect("python def regex")
});

static JAVA_METHOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:public|private|protected)[^=;(\n]*?\b(\w+)\s*\(([^)]*)\)")
        .expect("java method regex")
});

static GENERIC_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:fn|func|def|function|sub)\s+(\w+)\s*\(([^)]*)\)").expect("generic function regex")
});

/// Language families the agents have dedicated rules for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    JavaScript,
    TypeScript,
    Python,
    Java,
    Other,
}

impl Family {
    pub fn of(language: &str) -> Self {
        match language {
            "javascript" | "js" | "jsx" | "node" => Self::JavaScript,
            "typescript" | "ts" | "tsx" => Self::TypeScript,
            "python" | "py" | "python3" => Self::Python,
            "java" => Self::Java,
            _ => Self::Other,
        }
    }

    pub fn is_js_like(&self) -> bool {
        matches!(self, Self::JavaScript | Self::TypeScript)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Parameter {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub start_line: usize,
    pub end_line: usize,
    /// Calls itself somewhere in its own body.
    pub recursive: bool,
}

impl FunctionInfo {
    /// Single parameter that looks numeric by annotation or by name.
    pub fn takes_single_number(&self) -> bool {
        let [param] = self.parameters.as_slice() else {
            return false;
        };
        if let Some(hint) = &param.type_hint {
            return matches!(
                hint.as_str(),
                "number" | "int" | "long" | "float" | "double" | "integer" | "bigint" | "short"
            );
        }
        matches!(
            param.name.as_str(),
            "n" | "num" | "number" | "count" | "x" | "k" | "size" | "len" | "length" | "index" | "i"
        )
    }
}

/// Function-like declarations in order of appearance.
pub fn extract_functions(snippet: &str, family: Family) -> Vec<FunctionInfo> {
    let patterns: &[&Regex] = match family {
        Family::JavaScript | Family::TypeScript => &[&JS_FUNCTION, &JS_BOUND_FUNCTION],
        Family::Python => &[&PY_DEF],
        Family::Java => &[&JAVA_METHOD],
        Family::Other => &[&GENERIC_FUNCTION],
    };

    // (name, params, decl_start, decl_end)
    let mut found: Vec<(String, String, usize, usize)> = Vec::new();
    for pattern in patterns {
        for caps in pattern.captures_iter(snippet) {
            let (Some(whole), Some(name), Some(params)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            if found.iter().any(|(_, _, start, _)| *start == name.start()) {
                continue;
            }
            found.push((
                name.as_str().to_string(),
                params.as_str().to_string(),
                name.start(),
                whole.end(),
            ));
        }
    }
    found.sort_by_key(|(_, _, start, _)| *start);

    let total_lines = snippet.lines().count().max(1);
    let mut functions = Vec::with_capacity(found.len());
    for (i, (name, params, start, decl_end)) in found.iter().enumerate() {
        let body_end = found.get(i + 1).map_or(snippet.len(), |next| next.2);
        let body = snippet.get(*decl_end..body_end.max(*decl_end)).unwrap_or("");
        let start_line = line_of(snippet, *start);
        let end_line = found
            .get(i + 1)
            .map_or(total_lines, |next| line_of(snippet, next.2).saturating_sub(1))
            .max(start_line);
        functions.push(FunctionInfo {
            name: name.clone(),
            parameters: parse_parameters(params, family),
            start_line,
            end_line,
            recursive: calls(body, name),
        });
    }
    functions
}

/// 1-based line number of a byte offset.
pub fn line_of(snippet: &str, offset: usize) -> usize {
    snippet
        .get(..offset)
        .map_or(1, |prefix| prefix.matches('\n').count() + 1)
}

/// Whether `body` contains a call to `name`.
pub fn calls(body: &str, name: &str) -> bool {
    Regex::new(&format!(r"\b{}\s*\(", regex::escape(name)))
        .map(|re| re.is_match(body))
        .unwrap_or(false)
}

/// Loose `==` / `!=` comparison somewhere in the line.
pub fn has_loose_equality(line: &str) -> bool {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i + 1] == b'=' && (bytes[i] == b'=' || bytes[i] == b'!') {
            let prev = if i > 0 { bytes[i - 1] } else { b' ' };
            let next = bytes.get(i + 2).copied().unwrap_or(b' ');
            let part_of_longer = matches!(prev, b'=' | b'!' | b'<' | b'>') || next == b'=';
            if !part_of_longer {
                return true;
            }
            i += 2;
            continue;
        }
        i += 1;
    }
    false
}

/// Rewrite loose `==` / `!=` into `===` / `!==`.
pub fn make_equality_strict(line: &str) -> String {
    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len() + 4);
    let mut last = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i + 1] == b'=' && (bytes[i] == b'=' || bytes[i] == b'!') {
            let prev = if i > 0 { bytes[i - 1] } else { b' ' };
            let next = bytes.get(i + 2).copied().unwrap_or(b' ');
            if !matches!(prev, b'=' | b'!' | b'<' | b'>') && next != b'=' {
                out.push_str(&line[last..i + 2]);
                out.push('=');
                last = i + 2;
            }
            i += 2;
            continue;
        }
        i += 1;
    }
    out.push_str(&line[last..]);
    out
}

pub fn is_comment_line(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("//")
        || t.starts_with("/*")
        || t.starts_with('*')
        || t.starts_with('#')
        || t.starts_with("\"\"\"")
}

fn parse_parameters(raw: &str, family: Family) -> Vec<Parameter> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| {
            let p = p.split('=').next().unwrap_or(p).trim();
            let (name, type_hint) = match family {
                Family::Java => {
                    let mut parts = p.rsplitn(2, char::is_whitespace);
                    let name = parts.next().unwrap_or(p);
                    (name, parts.next().map(str::trim))
                }
                _ => match p.split_once(':') {
                    Some((name, hint)) => (name.trim(), Some(hint.trim())),
                    None => (p, None),
                },
            };
            let name = name.trim_start_matches(['.', '*', '&']).trim_end_matches('?');
            if name.is_empty() || (family == Family::Python && matches!(name, "self" | "cls")) {
                return None;
            }
            Some(Parameter {
                name: name.to_string(),
                type_hint: type_hint.filter(|h| !h.is_empty()).map(|h| h.to_lowercase()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_functions_and_recursion() {
        let code = "function f(n){return f(n-1)+f(n-2)}\nconst add = (a, b) => a + b;";
        let functions = extract_functions(code, Family::JavaScript);
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name, "f");
        assert!(functions[0].recursive);
        assert!(functions[0].takes_single_number());
        assert_eq!(functions[1].name, "add");
        assert_eq!(functions[1].start_line, 2);
        assert!(!functions[1].recursive);
        assert_eq!(functions[1].parameters.len(), 2);
    }

    #[test]
    fn python_defs_skip_self() {
        let code = "class A:\n    def run(self, n: int = 3):\n        return n\n\ndef helper():\n    pass";
        let functions = extract_functions(code, Family::Python);
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name, "run");
        assert_eq!(functions[0].parameters[0].name, "n");
        assert_eq!(functions[0].parameters[0].type_hint.as_deref(), Some("int"));
        assert_eq!(functions[0].start_line, 2);
        assert_eq!(functions[0].end_line, 4);
        assert!(functions[1].parameters.is_empty());
    }

    #[test]
    fn java_methods_with_types() {
        let code = "public class M {\n  public static int fib(int n) {\n    return n < 2 ? n : fib(n - 1) + fib(n - 2);\n  }\n}";
        let functions = extract_functions(code, Family::Java);
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].name, "fib");
        assert_eq!(functions[0].parameters[0].type_hint.as_deref(), Some("int"));
        assert!(functions[0].recursive);
    }

    #[test]
    fn loose_equality_detection() {
        assert!(has_loose_equality("if (a == b) {"));
        assert!(has_loose_equality("if (a != b) {"));
        assert!(!has_loose_equality("if (a === b) {"));
        assert!(!has_loose_equality("if (a !== b && c <= d) {"));
        assert!(!has_loose_equality("x = 1;"));
    }

    #[test]
    fn strict_equality_rewrite() {
        assert_eq!(make_equality_strict("a == b || c != d"), "a === b || c !== d");
        assert_eq!(make_equality_strict("a === b && c <= d"), "a === b && c <= d");
    }

    #[test]
    fn family_mapping() {
        assert_eq!(Family::of("ts"), Family::TypeScript);
        assert!(Family::of("javascript").is_js_like());
        assert_eq!(Family::of("rust"), Family::Other);
    }
}
