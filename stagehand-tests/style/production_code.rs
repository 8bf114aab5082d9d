//! Production Code Enforcement
//!
//! Library and binary code must not carry `#[allow(dead_code)]` and must
//! propagate errors instead of calling `unwrap()` or `expect()`. Everything
//! from a file's first `#[cfg(test)]` onward is test code and exempt.

use std::fs;
use std::path::{Path, PathBuf};

/// A violation found in production code
#[derive(Debug)]
struct Violation {
    file_path: String,
    line_number: usize,
    rule: &'static str,
    context: String,
}

/// Checker for production code violations
struct ProductionCodeChecker {
    violations: Vec<Violation>,
    files_checked: usize,
}

impl ProductionCodeChecker {
    fn new() -> Self {
        Self {
            violations: Vec::new(),
            files_checked: 0,
        }
    }

    /// Find the `src/` Rust files of every stagehand crate
    fn find_rust_files(&self) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
        let mut files = Vec::new();
        for entry in fs::read_dir("..")? {
            let crate_dir = entry?.path();
            let is_stagehand_crate = crate_dir
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("stagehand-"));
            if is_stagehand_crate {
                Self::find_rust_files_recursive(&crate_dir.join("src"), &mut files, 0)?;
            }
        }
        Ok(files)
    }

    fn find_rust_files_recursive(
        dir: &Path,
        files: &mut Vec<PathBuf>,
        depth: usize,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if depth > 8 || !dir.is_dir() {
            return Ok(());
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::find_rust_files_recursive(&path, files, depth + 1)?;
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
        Ok(())
    }

    /// Check the production part of one file's contents
    fn check_content(&mut self, file_path: &str, content: &str) {
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("#[cfg(test)]") {
                break;
            }
            if trimmed.starts_with("//") {
                continue;
            }

            let rule = if trimmed.contains("#[allow(") && trimmed.contains("dead_code") {
                Some("dead code allowance")
            } else if trimmed.contains(".unwrap()") {
                Some("unwrap() in production code")
            } else if trimmed.contains(".expect(") {
                Some("expect() in production code")
            } else {
                None
            };

            if let Some(rule) = rule {
                self.violations.push(Violation {
                    file_path: file_path.to_string(),
                    line_number: index + 1,
                    rule,
                    context: line.to_string(),
                });
            }
        }
    }

    /// Check all files in the workspace
    fn check_workspace(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        for file in self.find_rust_files()? {
            let content = fs::read_to_string(&file)?;
            self.files_checked += 1;
            self.check_content(&file.to_string_lossy(), &content);
        }
        Ok(())
    }

    /// Report violations and return whether the check passed
    fn report_violations(&self) -> bool {
        if self.violations.is_empty() {
            println!(
                "Production code enforcement: {} files checked, no violations found",
                self.files_checked
            );
            return true;
        }

        println!("Production code violations found:");
        for violation in &self.violations {
            println!(
                "{}:{} [{}]",
                violation.file_path, violation.line_number, violation.rule
            );
            println!("  {}", violation.context.trim());
        }
        println!(
            "Found {} violation(s) in {} file(s) checked",
            self.violations.len(),
            self.files_checked
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_detection_stops_at_test_module() {
        let mut checker = ProductionCodeChecker::new();
        let content = r#"
#[allow(dead_code)]
fn unused() {}

fn risky(value: Option<u32>) -> u32 {
    value.unwrap()
}

// value.expect("comments are ignored")

#[cfg(test)]
mod tests {
    fn helper(value: Option<u32>) -> u32 {
        value.unwrap()
    }
}
"#;

        checker.check_content("sample.rs", content);

        assert_eq!(checker.violations.len(), 2);
        assert_eq!(checker.violations[0].line_number, 2);
        assert_eq!(checker.violations[1].line_number, 6);
    }

    #[test]
    fn test_fallible_alternatives_are_allowed() {
        let mut checker = ProductionCodeChecker::new();
        let content = "let body = response.text().await.unwrap_or_default();\nlet x = y.unwrap_or(0);\n";

        checker.check_content("sample.rs", content);

        assert!(checker.violations.is_empty());
    }

    #[test]
    fn production_code_enforcement() {
        let mut checker = ProductionCodeChecker::new();
        checker
            .check_workspace()
            .expect("Failed to check workspace");

        assert!(checker.files_checked > 0, "no stagehand sources found");
        assert!(
            checker.report_violations(),
            "Production code violations found - see output above"
        );
    }
}
