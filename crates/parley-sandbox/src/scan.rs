//! Static capability scan
//!
//! Snippets are scanned before any process is spawned. A disallowed
//! reference rejects the whole job with a named error; there is no
//! partial execution.

use crate::error::{Error, Result};
use regex::Regex;
use tracing::debug;

/// Capabilities that are never available to a snippet, regardless of the
/// job's import allow-list.
const BANNED_REFERENCES: &[&str] = &[
    "__import__",
    "__builtins__",
    "__globals__",
    "__subclasses__",
    "eval",
    "exec",
    "compile",
    "open",
    "input",
    "globals",
    "locals",
    "vars",
    "breakpoint",
];

/// Module roots that are rejected even if a caller adds them to an
/// allow-list by mistake.
const BANNED_MODULES: &[&str] = &["os", "sys", "subprocess", "socket", "shutil", "pathlib", "ctypes"];

/// Scanner for import statements and banned capability references
pub struct ImportScanner {
    import_re: Regex,
    from_re: Regex,
    reference_re: Regex,
}

impl ImportScanner {
    /// Create a scanner. Patterns are fixed, so construction cannot fail.
    #[must_use]
    pub fn new() -> Self {
        Self {
            import_re: Regex::new(r"(?m)^\s*import\s+([A-Za-z_][\w.]*(?:\s*,\s*[A-Za-z_][\w.]*)*)")
                .expect("static pattern"),
            from_re: Regex::new(r"(?m)^\s*from\s+([A-Za-z_][\w.]*)\s+import\b")
                .expect("static pattern"),
            reference_re: Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(|\b(__\w+__)\b")
                .expect("static pattern"),
        }
    }

    /// Scan a snippet against an import allow-list.
    ///
    /// Returns the first violation found as a typed error naming the
    /// offending module or capability.
    pub fn scan(&self, source: &str, allowed_imports: &[String]) -> Result<()> {
        for module in self.imported_modules(source) {
            let root = module.split('.').next().unwrap_or(&module).to_string();
            if BANNED_MODULES.contains(&root.as_str()) {
                debug!(module = %root, "rejected banned module");
                return Err(Error::RestrictedImport(root));
            }
            if !allowed_imports.iter().any(|a| a == &root) {
                debug!(module = %root, "rejected module outside allow-list");
                return Err(Error::RestrictedImport(root));
            }
        }

        for caps in self.reference_re.captures_iter(source) {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if BANNED_REFERENCES.contains(&name) {
                debug!(capability = %name, "rejected banned capability reference");
                return Err(Error::RestrictedCapability(name.to_string()));
            }
        }

        Ok(())
    }

    /// Collect every module named by an `import` or `from ... import`
    /// statement in the snippet.
    fn imported_modules(&self, source: &str) -> Vec<String> {
        let mut modules = Vec::new();
        for caps in self.import_re.captures_iter(source) {
            if let Some(list) = caps.get(1) {
                for module in list.as_str().split(',') {
                    modules.push(module.trim().to_string());
                }
            }
        }
        for caps in self.from_re.captures_iter(source) {
            if let Some(module) = caps.get(1) {
                modules.push(module.as_str().to_string());
            }
        }
        modules
    }
}

impl Default for ImportScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["math".to_string(), "json".to_string(), "statistics".to_string()]
    }

    #[test]
    fn test_allowed_import_passes() {
        let scanner = ImportScanner::new();
        let src = "import math\nresult = math.sqrt(params['n'])";
        assert!(scanner.scan(src, &allowed()).is_ok());
    }

    #[test]
    fn test_disallowed_import_named() {
        let scanner = ImportScanner::new();
        let src = "import requests\nresult = 1";
        match scanner.scan(src, &allowed()) {
            Err(Error::RestrictedImport(m)) => assert_eq!(m, "requests"),
            other => panic!("expected RestrictedImport, got: {:?}", other),
        }
    }

    #[test]
    fn test_banned_module_rejected_even_if_allowed() {
        let scanner = ImportScanner::new();
        let src = "import os\nresult = 1";
        let mut list = allowed();
        list.push("os".to_string());
        assert!(matches!(
            scanner.scan(src, &list),
            Err(Error::RestrictedImport(m)) if m == "os"
        ));
    }

    #[test]
    fn test_from_import_uses_root_module() {
        let scanner = ImportScanner::new();
        let src = "from os.path import join\nresult = 1";
        assert!(matches!(
            scanner.scan(src, &allowed()),
            Err(Error::RestrictedImport(m)) if m == "os"
        ));
    }

    #[test]
    fn test_multi_import_line() {
        let scanner = ImportScanner::new();
        let src = "import math, statistics\nresult = statistics.mean([1, 2])";
        assert!(scanner.scan(src, &allowed()).is_ok());

        let bad = "import math, socket";
        assert!(matches!(
            scanner.scan(bad, &allowed()),
            Err(Error::RestrictedImport(m)) if m == "socket"
        ));
    }

    #[test]
    fn test_banned_reference_rejected() {
        let scanner = ImportScanner::new();
        for src in [
            "result = eval('1+1')",
            "result = open('/etc/passwd').read()",
            "result = __import__('os')",
            "exec('x = 1')",
        ] {
            let outcome = scanner.scan(src, &allowed());
            assert!(
                matches!(outcome, Err(Error::RestrictedCapability(_))),
                "expected rejection for: {}",
                src
            );
        }
    }

    #[test]
    fn test_benign_call_not_rejected() {
        let scanner = ImportScanner::new();
        let src = "result = sorted(params['rows'], key=lambda r: r['count'])";
        assert!(scanner.scan(src, &allowed()).is_ok());
    }
}
