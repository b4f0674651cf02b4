use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

// Directories holding crate sources subject to the code-quality rules.
const SCANNED_ROOTS: &[&str] = &["src", "tests", "benches"];

// A forbidden source pattern together with the advice printed on violation.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    found: &'static str,
    advice: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        name: "allow(dead_code)",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        found: "#[allow(dead_code)] attributes",
        advice: "Remove unused code instead of silencing the lint.",
    },
    Rule {
        name: "#[ignore]",
        pattern: r"#\s*\[\s*ignore\s*\]",
        found: "ignored tests",
        advice: "Fix or delete the test; ignored tests are not allowed.",
    },
    Rule {
        name: "debug_assert",
        pattern: r"\bdebug_assert(_eq|_ne)?!\s*\(",
        found: "debug_assert! usages",
        advice: "Return an error, or use assert! inside tests.",
    },
    Rule {
        name: "let _ =",
        pattern: r"\blet\s+_\s*=",
        found: "disallowed 'let _ =' patterns",
        advice: "Handle the result explicitly instead of discarding it.",
    },
];

// Collects the matching lines of a single file for one rule.
struct RuleCollector<'r> {
    rule: &'r Rule,
    violations: Vec<String>,
    file_path: PathBuf,
}

fn verbose() -> bool {
    std::env::var("BUILD_VERBOSE").is_ok_and(|value| {
        let value = value.trim();
        value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
    })
}

fn note(detail: &str) {
    if verbose() {
        println!("cargo:warning=mfac lint: {detail}");
    }
}

impl<'r> RuleCollector<'r> {
    fn new(rule: &'r Rule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn report(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut report = format!(
            "\n❌ {} {} in {}:\n",
            self.violations.len(),
            self.rule.found,
            self.file_path.display()
        );
        for violation in &self.violations {
            report.push_str(&format!("   {violation}\n"));
        }
        report.push_str(&format!("⚠️ {}\n", self.rule.advice));
        Some(report)
    }
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        // Mentions inside comments and doc comments are not code.
        if line_text.trim_start().starts_with("//") {
            return Ok(true);
        }

        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn is_hidden(path: &Path) -> bool {
    path.components().any(|component| {
        matches!(component, Component::Normal(name) if name.to_string_lossy().starts_with('.'))
    })
}

fn rust_sources() -> Vec<PathBuf> {
    SCANNED_ROOTS
        .iter()
        .filter(|root| Path::new(root).is_dir())
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(Result::ok))
        .map(walkdir::DirEntry::into_path)
        .filter(|path| !is_hidden(path) && path.extension().is_some_and(|ext| ext == "rs"))
        .collect()
}

fn scan_rule(rule: &Rule, sources: &[PathBuf]) -> Vec<String> {
    let matcher = match RegexMatcher::new_line_matcher(rule.pattern) {
        Ok(matcher) => matcher,
        Err(err) => return vec![format!("invalid pattern for rule {}: {err}", rule.name)],
    };
    let mut searcher = Searcher::new();
    sources
        .iter()
        .filter_map(|path| {
            let mut collector = RuleCollector::new(rule, path);
            searcher.search_path(&matcher, path, &mut collector).ok()?;
            collector.report()
        })
        .collect()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SCANNED_ROOTS {
        if Path::new(root).is_dir() {
            println!("cargo:rerun-if-changed={root}");
        }
    }

    if std::env::var("MFAC_SKIP_LINT_CHECKS").is_ok() || std::env::var("DOCS_RS").is_ok() {
        note("lint checks skipped");
        return;
    }

    let sources = rust_sources();
    note(&format!("scanning {} source files", sources.len()));

    let violations: Vec<String> = RULES
        .iter()
        .flat_map(|rule| scan_rule(rule, &sources))
        .collect();
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ mfac code quality checks failed");
    for violation in &violations {
        eprintln!("{violation}");
    }
    eprintln!("Found {} violation groups; fix them before committing.", violations.len());
    std::process::exit(1);
}
