//! Static pre-execution verification of submitted code.
//!
//! The verifier parses a snippet with the tree-sitter Python grammar (the
//! kernel language is a syntactic subset of Python) and reports policy
//! violations before anything reaches the interpreter: disallowed imports
//! and calls, dynamic attribute-access bypasses, assignment targets outside
//! the allow list, and magic lines other than package installs. It is a
//! defense-in-depth filter, not a sandbox.

use std::fmt;

use tree_sitter::Node;
use tree_sitter::Parser;
use tree_sitter::Tree;
use tree_sitter_python::LANGUAGE as PYTHON;

use crate::kernel::magics::separate_magics_and_code;

/// Names that can be used for dynamic attribute access and therefore defeat
/// every list-based check below. Always blocked, regardless of policy.
pub const DANGEROUS_NAMES: &[&str] = &[
    "getattr",
    "setattr",
    "delattr",
    "vars",
    "globals",
    "locals",
    "__getattribute__",
    "__setattr__",
    "__delattr__",
    "__dict__",
    "__class__",
    "__bases__",
    "__subclasses__",
    "__mro__",
    "__builtins__",
];

/// What the verifier enforces. At most one of allowed/blocked may be set per
/// axis; configuring both is a programmer error and fails fast.
#[derive(Debug, Clone, Default)]
pub struct VerificationPolicy {
    allowed_modules: Option<Vec<String>>,
    blocked_modules: Option<Vec<String>>,
    allowed_functions: Option<Vec<String>>,
    blocked_functions: Option<Vec<String>>,
    allowed_variables: Option<Vec<String>>,
}

impl VerificationPolicy {
    pub fn new(
        allowed_modules: Option<Vec<String>>,
        blocked_modules: Option<Vec<String>>,
        allowed_functions: Option<Vec<String>>,
        blocked_functions: Option<Vec<String>>,
        allowed_variables: Option<Vec<String>>,
    ) -> Self {
        assert!(
            allowed_modules.is_none() || blocked_modules.is_none(),
            "only one of allowed_modules or blocked_modules can be set"
        );
        assert!(
            allowed_functions.is_none() || blocked_functions.is_none(),
            "only one of allowed_functions or blocked_functions can be set"
        );
        Self {
            allowed_modules,
            blocked_modules,
            allowed_functions,
            blocked_functions,
            allowed_variables,
        }
    }

    fn checks_modules(&self) -> bool {
        self.allowed_modules.is_some() || self.blocked_modules.is_some()
    }

    fn checks_functions(&self) -> bool {
        self.allowed_functions.is_some() || self.blocked_functions.is_some()
    }

    fn module_allowed(&self, name: &str) -> bool {
        if let Some(allowed) = &self.allowed_modules {
            return allowed.iter().any(|m| m == name);
        }
        if let Some(blocked) = &self.blocked_modules {
            return !blocked.iter().any(|m| m == name);
        }
        true
    }

    fn function_allowed(&self, name: &str) -> bool {
        if let Some(allowed) = &self.allowed_functions {
            return allowed.iter().any(|f| f == name);
        }
        if let Some(blocked) = &self.blocked_functions {
            return !blocked.iter().any(|f| f == name);
        }
        true
    }

    fn variable_allowed(&self, name: &str) -> bool {
        match &self.allowed_variables {
            Some(allowed) => allowed.iter().any(|v| v == name),
            None => true,
        }
    }
}

/// One policy violation, carrying the offending line when it maps to one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub line: Option<usize>,
    pub text: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "Error on line {line}: {} => {}", self.text, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Verifies a raw snippet (magic lines included) against `policy` and
/// returns every violation found. An empty result means the snippet may be
/// handed to the kernel.
pub fn verify_code(code: &str, policy: &VerificationPolicy) -> Vec<Violation> {
    let split = separate_magics_and_code(code);
    let mut violations = Vec::new();

    if !split.magics.is_empty() {
        violations.push(Violation {
            line: None,
            text: String::new(),
            message: format!(
                "Magic commands except package install are not allowed. Details: {:?}",
                split.magics
            ),
        });
    }

    let Some(tree) = try_parse_python(&split.code) else {
        violations.push(Violation {
            line: None,
            text: String::new(),
            message: "Syntax error".to_string(),
        });
        return violations;
    };

    let lines: Vec<&str> = split.code.lines().collect();
    if tree.root_node().has_error() {
        let line = first_error_line(tree.root_node());
        violations.push(Violation {
            line,
            text: line
                .and_then(|l| lines.get(l - 1))
                .map(|l| l.to_string())
                .unwrap_or_default(),
            message: "Syntax error".to_string(),
        });
        return violations;
    }

    visit(
        tree.root_node(),
        split.code.as_str(),
        &lines,
        policy,
        &mut violations,
    );
    violations
}

fn try_parse_python(src: &str) -> Option<Tree> {
    let lang = PYTHON.into();
    let mut parser = Parser::new();
    parser.set_language(&lang).ok()?;

    let old_tree: Option<&Tree> = None;
    parser.parse(src, old_tree)
}

fn first_error_line(root: Node) -> Option<usize> {
    let mut cursor = root.walk();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            return Some(node.start_position().row + 1);
        }
        for child in node.children(&mut cursor) {
            stack.push(child);
        }
    }
    None
}

fn visit(node: Node, src: &str, lines: &[&str], policy: &VerificationPolicy, out: &mut Vec<Violation>) {
    match node.kind() {
        "import_statement" => check_import(node, src, lines, policy, out),
        "import_from_statement" => check_import_from(node, src, lines, policy, out),
        "call" => check_call(node, src, lines, policy, out),
        "attribute" => check_attribute(node, src, lines, out),
        "subscript" => check_subscript(node, src, lines, out),
        "assignment" => check_assignment(node, src, lines, policy, out),
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        visit(child, src, lines, policy, out);
    }
}

fn node_text<'a>(node: Node, src: &'a str) -> &'a str {
    node.utf8_text(src.as_bytes()).unwrap_or_default()
}

fn push_violation(node: Node, lines: &[&str], message: String, out: &mut Vec<Violation>) {
    let row = node.start_position().row;
    out.push(Violation {
        line: Some(row + 1),
        text: lines.get(row).map(|l| l.to_string()).unwrap_or_default(),
        message,
    });
}

fn root_package(dotted: &str) -> &str {
    dotted.split('.').next().unwrap_or(dotted)
}

fn check_import(node: Node, src: &str, lines: &[&str], policy: &VerificationPolicy, out: &mut Vec<Violation>) {
    if !policy.checks_modules() {
        return;
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        let dotted = match child.kind() {
            "dotted_name" => Some(child),
            "aliased_import" => child.child_by_field_name("name"),
            _ => None,
        };
        if let Some(dotted) = dotted {
            let module = root_package(node_text(dotted, src));
            if !policy.module_allowed(module) {
                push_violation(
                    node,
                    lines,
                    format!("Importing module '{module}' is not allowed."),
                    out,
                );
            }
        }
    }
}

fn check_import_from(
    node: Node,
    src: &str,
    lines: &[&str],
    policy: &VerificationPolicy,
    out: &mut Vec<Violation>,
) {
    if !policy.checks_modules() {
        return;
    }
    // `from . import x` has a relative_import module; there is no package
    // root to check in that case.
    let Some(module_node) = node.child_by_field_name("module_name") else {
        return;
    };
    if module_node.kind() != "dotted_name" {
        return;
    }
    let module_text = node_text(module_node, src);
    if !policy.module_allowed(root_package(module_text)) {
        push_violation(
            node,
            lines,
            format!("Importing from module '{module_text}' is not allowed."),
            out,
        );
    }
}

fn check_call(node: Node, src: &str, lines: &[&str], policy: &VerificationPolicy, out: &mut Vec<Violation>) {
    let Some(func) = node.child_by_field_name("function") else {
        return;
    };

    let name = match func.kind() {
        "identifier" => node_text(func, src),
        "attribute" => func
            .child_by_field_name("attribute")
            .map(|attr| node_text(attr, src))
            .unwrap_or_default(),
        "subscript" => {
            // obj["method"]() is a bypass pattern; reject it outright.
            push_violation(
                node,
                lines,
                "Subscript-based function calls are not allowed for security reasons.".to_string(),
                out,
            );
            return;
        }
        // A callee that is itself a call, e.g. getattr(obj, "m")(); the
        // inner call is checked on its own visit.
        "call" => return,
        _ => {
            push_violation(
                node,
                lines,
                "Unrecognized function call pattern is not allowed for security reasons."
                    .to_string(),
                out,
            );
            return;
        }
    };

    if policy.checks_functions() && !policy.function_allowed(name) {
        push_violation(node, lines, format!("Function '{name}' is not allowed."), out);
    }

    if DANGEROUS_NAMES.contains(&name) {
        push_violation(
            node,
            lines,
            format!("Function '{name}' is blocked as it can be used to bypass security checks."),
            out,
        );
    }
}

fn check_attribute(node: Node, src: &str, lines: &[&str], out: &mut Vec<Violation>) {
    let Some(attr) = node.child_by_field_name("attribute") else {
        return;
    };
    let name = node_text(attr, src);
    if DANGEROUS_NAMES.contains(&name) {
        push_violation(
            node,
            lines,
            format!("Attribute access to '{name}' is blocked for security reasons."),
            out,
        );
    }
}

fn check_subscript(node: Node, src: &str, lines: &[&str], out: &mut Vec<Violation>) {
    let Some(key_node) = node.child_by_field_name("subscript") else {
        return;
    };
    if key_node.kind() != "string" {
        return;
    }
    let mut cursor = key_node.walk();
    let Some(content) = key_node
        .children(&mut cursor)
        .find(|c| c.kind() == "string_content")
    else {
        return;
    };
    let key = node_text(content, src);
    if DANGEROUS_NAMES.contains(&key) || key.starts_with("__") {
        push_violation(
            node,
            lines,
            format!("Subscript access to '{key}' is blocked for security reasons."),
            out,
        );
    }
}

fn check_assignment(
    node: Node,
    src: &str,
    lines: &[&str],
    policy: &VerificationPolicy,
    out: &mut Vec<Violation>,
) {
    if policy.allowed_variables.is_none() {
        return;
    }
    let Some(left) = node.child_by_field_name("left") else {
        return;
    };
    let mut names = Vec::new();
    collect_target_names(left, src, &mut names);
    for name in names {
        if !policy.variable_allowed(name) {
            push_violation(node, lines, format!("Assigning to {name} is not allowed."), out);
        }
    }
}

/// Collects the identifiers a target binds or mutates. For attribute
/// targets only the base object matters (`a.b = ...` touches `a`).
fn collect_target_names<'a>(node: Node, src: &'a str, out: &mut Vec<&'a str>) {
    match node.kind() {
        "identifier" => out.push(node_text(node, src)),
        "attribute" => {
            if let Some(object) = node.child_by_field_name("object") {
                collect_target_names(object, src, out);
            }
        }
        _ => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                collect_target_names(child, src, out);
            }
        }
    }
}
