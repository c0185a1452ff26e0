//! Source preparation for the JavaScript sandbox.
//!
//! QuickJS evaluates plain scripts, so ES module syntax (and, for TypeScript,
//! type syntax) is lowered here first. The rewrites are pattern based. String
//! literals, template literals and comments are masked out before any pattern
//! runs, so only code is ever rewritten.

use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("require pattern is valid")
});
static IMPORT_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^(\s*)import\s+([^'";]+?)\s+from\s+(['"])([^'"]+)['"]\s*;?"#)
        .expect("import pattern is valid")
});
static IMPORT_BARE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^(\s*)import\s+(['"])([^'"]+)['"]\s*;?"#).expect("bare import pattern is valid")
});
static EXPORT_DEFAULT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\s*)export\s+default\s+").expect("export pattern is valid"));
static EXPORT_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(\s*)export\s+(const|let|var|function|class|async)\b")
        .expect("export pattern is valid")
});
static EXPORT_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*export\s*\{[^}]*\}\s*;?").expect("export pattern is valid"));

static TS_INTERFACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?interface\s+\w+[^{]*\{").expect("interface pattern is valid")
});
static TS_TYPE_ALIAS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?type\s+\w+(?:<[^>]*>)?\s*=[^;\n]*;?")
        .expect("type alias pattern is valid")
});
static TS_VAR_ANNOTATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(const|let|var)\s+(\w+)\s*:\s*[^=;\n]+?\s*=").expect("annotation pattern is valid")
});
static TS_FUNCTION_PARAMS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(function\s*\w*\s*)\(([^(){}]*)\)(?:\s*:\s*[\w<>\[\]|.]+)?(\s*\{)")
        .expect("function pattern is valid")
});
static TS_ARROW_PARAMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^(){}]*:[^(){}]*)\)(\s*=>)").expect("arrow pattern is valid"));
static TS_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)\??\s*:\s*[^,=]*[^,=\s]").expect("param pattern is valid"));
static TS_AS_CAST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+as\s+(?:const|string|number|boolean|any|unknown|[A-Z]\w*)(?:\[\])?\b")
        .expect("cast pattern is valid")
});

const MASK_OPEN: char = '\u{E000}';
const MASK_CLOSE: char = '\u{E001}';

/// Source syntax accepted by the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    JavaScript,
    TypeScript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanKind {
    /// `'...'`, `"..."` and regex literals
    Quoted,
    Template,
    Comment,
}

/// Source with some literal spans replaced by private-use placeholders.
struct Masked {
    code: String,
    literals: Vec<String>,
}

impl Masked {
    fn new(source: &str, mask: impl Fn(SpanKind) -> bool) -> Self {
        let mut code = String::with_capacity(source.len());
        let mut literals = Vec::new();
        let mut last = 0;
        for (range, kind) in literal_spans(source) {
            if !mask(kind) {
                continue;
            }
            code.push_str(&source[last..range.start]);
            code.push(MASK_OPEN);
            code.push_str(&literals.len().to_string());
            code.push(MASK_CLOSE);
            literals.push(source[range.clone()].to_string());
            last = range.end;
        }
        code.push_str(&source[last..]);
        Self { code, literals }
    }

    fn restore(&self, code: &str) -> String {
        let mut out = String::with_capacity(code.len());
        let mut rest = code;
        while let Some(open) = rest.find(MASK_OPEN) {
            out.push_str(&rest[..open]);
            let after = &rest[open + MASK_OPEN.len_utf8()..];
            let Some(close) = after.find(MASK_CLOSE) else {
                rest = &rest[open..];
                break;
            };
            match after[..close].parse::<usize>().ok().and_then(|i| self.literals.get(i)) {
                Some(literal) => out.push_str(literal),
                None => out.push_str(&rest[open..open + MASK_OPEN.len_utf8() + close + MASK_CLOSE.len_utf8()]),
            }
            rest = &after[close + MASK_CLOSE.len_utf8()..];
        }
        out.push_str(rest);
        out
    }
}

/// Byte ranges of string, template and regex literals and of comments.
///
/// A `/` starts a regex literal only where an operand is expected; after an
/// identifier or a closing bracket it is division.
fn literal_spans(source: &str) -> Vec<(Range<usize>, SpanKind)> {
    let bytes = source.as_bytes();
    let mut spans = Vec::new();
    let mut operand_expected = true;
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let kind = match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i = skip_quoted(bytes, i + 1, quote);
                SpanKind::Quoted
            }
            b'`' => {
                i = skip_template(bytes, i + 1);
                SpanKind::Template
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p);
                SpanKind::Comment
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = source[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2);
                SpanKind::Comment
            }
            b'/' if operand_expected => {
                i = skip_regex(bytes, i + 1);
                SpanKind::Quoted
            }
            b => {
                if !b.is_ascii_whitespace() {
                    operand_expected = b"(,=:[!&|?{};+-*%<>~^".contains(&b);
                }
                i += 1;
                continue;
            }
        };
        if kind != SpanKind::Comment {
            operand_expected = false;
        }
        spans.push((start..i, kind));
    }
    spans
}

fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_template(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'`' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_regex(bytes: &[u8], mut i: usize) -> usize {
    let mut in_class = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b'[' => {
                in_class = true;
                i += 1;
            }
            b']' => {
                in_class = false;
                i += 1;
            }
            b'/' if !in_class => {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                    i += 1;
                }
                return i;
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Quoted strings stay visible to the module patterns since specifiers are
/// quoted strings themselves.
fn mask_for_modules(source: &str) -> Masked {
    Masked::new(source, |kind| kind != SpanKind::Quoted)
}

/// Module specifiers named by `require('x')` and `import ... from 'x'`
/// outside comments and template literals.
pub fn referenced_modules(source: &str) -> Vec<String> {
    let masked = mask_for_modules(source);
    let code = masked.code.as_str();
    let mut modules = Vec::new();
    for caps in REQUIRE_RE.captures_iter(code) {
        modules.push(caps[1].to_string());
    }
    for caps in IMPORT_FROM_RE.captures_iter(code) {
        modules.push(caps[4].to_string());
    }
    for caps in IMPORT_BARE_RE.captures_iter(code) {
        modules.push(caps[3].to_string());
    }
    modules
}

/// Package root of a module specifier: `lodash/fp` -> `lodash`,
/// `@scope/pkg/x` -> `@scope/pkg`, `node:fs` -> `fs`.
pub fn root_module(specifier: &str) -> &str {
    let spec = specifier.strip_prefix("node:").unwrap_or(specifier);
    if spec.starts_with('@') {
        match spec.match_indices('/').nth(1) {
            Some((idx, _)) => &spec[..idx],
            None => spec,
        }
    } else {
        spec.split('/').next().unwrap_or(spec)
    }
}

/// Lowers module syntax, and erases type annotations for TypeScript.
pub fn prepare_script(source: &str, dialect: Dialect) -> String {
    let masked = mask_for_modules(source);
    let lowered = masked.restore(&lower_modules(&masked.code));
    match dialect {
        Dialect::JavaScript => lowered,
        Dialect::TypeScript => {
            let masked = Masked::new(&lowered, |_| true);
            masked.restore(&erase_types(&masked.code))
        }
    }
}

fn lower_modules(source: &str) -> String {
    let out = IMPORT_FROM_RE.replace_all(source, |caps: &Captures| {
        let indent = &caps[1];
        let clause = caps[2].trim();
        let module = format!("{q}{m}{q}", q = &caps[3], m = &caps[4]);
        format!("{}{}", indent, import_binding(clause, &module))
    });
    let out = IMPORT_BARE_RE.replace_all(&out, "${1}require(${2}${3}${2});");
    let out = EXPORT_LIST_RE.replace_all(&out, "");
    let out = EXPORT_DEFAULT_RE.replace_all(&out, "${1}");
    EXPORT_DECL_RE.replace_all(&out, "${1}${2}").into_owned()
}

fn import_binding(clause: &str, module: &str) -> String {
    if let Some(name) = clause.strip_prefix("* as ") {
        return format!("const {} = require({});", name.trim(), module);
    }
    if clause.starts_with('{') {
        return format!("const {} = require({});", destructure(clause), module);
    }
    match clause.split_once(',') {
        Some((default, named)) => format!(
            "const {d} = require({m}); const {n} = {d};",
            d = default.trim(),
            m = module,
            n = destructure(named.trim())
        ),
        None => format!("const {} = require({});", clause, module),
    }
}

fn destructure(named: &str) -> String {
    named.replace(" as ", ": ")
}

fn erase_types(source: &str) -> String {
    let out = strip_interfaces(source);
    let out = TS_TYPE_ALIAS_RE.replace_all(&out, "");
    let out = TS_VAR_ANNOTATION_RE.replace_all(&out, "$1 $2 =");
    let out = TS_FUNCTION_PARAMS_RE.replace_all(&out, |caps: &Captures| {
        format!("{}({}){}", &caps[1], strip_params(&caps[2]), &caps[3])
    });
    let out = TS_ARROW_PARAMS_RE.replace_all(&out, |caps: &Captures| {
        format!("({}){}", strip_params(&caps[1]), &caps[2])
    });
    TS_AS_CAST_RE.replace_all(&out, "").into_owned()
}

fn strip_params(params: &str) -> String {
    TS_PARAM_RE.replace_all(params, "$1").into_owned()
}

/// Removes `interface X { ... }` blocks, matching braces.
fn strip_interfaces(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(m) = TS_INTERFACE_RE.find(rest) {
        out.push_str(&rest[..m.start()]);
        let mut depth = 1usize;
        let mut end = rest.len();
        for (offset, ch) in rest[m.end()..].char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = m.end() + offset + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}
