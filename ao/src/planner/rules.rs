//! Rule-based decomposition patterns
//!
//! A small table of regular expressions, each paired with a template
//! sequence. Templates name the action, optionally which capture group
//! supplies the task's input parameter, and which earlier templates the
//! task depends on. The first matching pattern wins.

use std::sync::LazyLock;

use regex::Regex;

/// One task template inside a rule
#[derive(Debug, Clone)]
pub struct RuleTemplate {
    /// Action registered for the emitted task
    pub action: &'static str,
    /// Capture group supplying the `input` parameter; None uses the raw query
    pub extract: Option<usize>,
    /// Indices of earlier templates this task depends on
    pub depends_on: &'static [usize],
}

/// A query pattern and the task sequence it expands to
pub struct Rule {
    pub pattern: Regex,
    pub templates: Vec<RuleTemplate>,
}

fn rule(pattern: &str, templates: Vec<RuleTemplate>) -> Rule {
    Rule {
        pattern: Regex::new(pattern).expect("rule pattern compiles"),
        templates,
    }
}

const fn template(action: &'static str, extract: Option<usize>, depends_on: &'static [usize]) -> RuleTemplate {
    RuleTemplate {
        action,
        extract,
        depends_on,
    }
}

/// Built-in decomposition rules, checked in order
pub static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // "analyse X, génère Y, crée Z"
        rule(
            r"(?i)analys[er]?\s+(.+?),\s+g[ée]n[éèe]r[er]?\s+(.+?),\s+cr[ée][er]?\s+(.+)",
            vec![
                template("read_file", Some(1), &[]),
                template("analyze_data", None, &[0]),
                template("generate_report", None, &[1]),
            ],
        ),
        // "lis X, calcule Y"
        rule(
            r"(?i)li[st]?\s+(.+?),\s+calcul[er]?\s+(.+)",
            vec![
                template("read_file", Some(1), &[]),
                template("calculate", None, &[0]),
            ],
        ),
        // "read X, [then] calculate/compute Y"
        rule(
            r"(?i)read\s+(.+?),\s+(?:then\s+)?(?:calculat|comput)e?\s+(.+)",
            vec![
                template("read_file", Some(1), &[]),
                template("calculate", None, &[0]),
            ],
        ),
        // "trouve X et Y, puis Z"
        rule(
            r"(?i)trouv[er]?\s+(.+?)\s+et\s+(.+?),\s+puis\s+(.+)",
            vec![
                template("search", Some(1), &[]),
                template("search", Some(2), &[]),
                template("process", None, &[0, 1]),
            ],
        ),
    ]
});
