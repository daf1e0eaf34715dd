//! Splits magic and shell lines off a code snippet before it reaches the
//! interpreter.
//!
//! Lines starting with `%` (line magic), `%%` (cell magic) or `!` (shell
//! escape) are not part of the kernel language. Package-install commands
//! (`pip install ...`, `conda install ...`) are preserved separately so the
//! kernel host can hand them to the package installer; everything else is
//! reported back to the caller.

use regex_lite::Regex;
use std::sync::LazyLock;

#[expect(clippy::expect_used)]
fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("pattern is valid")
}

static LINE_MAGIC: LazyLock<Regex> = LazyLock::new(|| regex(r"^\s*%\s*[a-zA-Z_]\w*"));
static CELL_MAGIC: LazyLock<Regex> = LazyLock::new(|| regex(r"^\s*%%\s*[a-zA-Z_]\w*"));
static SHELL_COMMAND: LazyLock<Regex> = LazyLock::new(|| regex(r"^\s*!"));

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SplitCode {
    /// Magic/shell lines that are not package installs, in input order.
    pub magics: Vec<String>,
    /// The remaining interpreter code, blank and comment lines removed.
    pub code: String,
    /// Preserved `pip install` / `conda install` command lines.
    pub package_installs: Vec<String>,
}

pub fn separate_magics_and_code(input: &str) -> SplitCode {
    let mut magics = Vec::new();
    let mut code_lines = Vec::new();
    let mut package_installs = Vec::new();
    let mut inside_cell_magic = false;

    for line in input.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if inside_cell_magic {
            magics.push(line.to_string());
            continue;
        }

        if CELL_MAGIC.is_match(line) {
            inside_cell_magic = true;
            magics.push(line.to_string());
        } else if LINE_MAGIC.is_match(line) || SHELL_COMMAND.is_match(line) {
            if line.contains("pip install") || line.contains("conda install") {
                package_installs.push(line.to_string());
            } else {
                magics.push(line.to_string());
            }
        } else {
            code_lines.push(line);
        }
    }

    SplitCode {
        magics,
        code: code_lines.join("\n"),
        package_installs,
    }
}

/// Extracts the requested package names from a preserved install command,
/// skipping the tool name, the `install` verb and any flags.
pub fn requested_packages(install_line: &str) -> Vec<String> {
    let line = install_line.trim_start_matches(['%', '!']).trim();
    line.split_whitespace()
        .skip_while(|tok| *tok != "install")
        .skip(1)
        .filter(|tok| !tok.starts_with('-'))
        .map(|tok| tok.to_string())
        .collect()
}
