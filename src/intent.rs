//! Task intent classification.
//!
//! A task description is mapped to one of a closed set of intents by
//! counting trigger terms. Matching happens on stemmed tokens, so
//! "failing", "fails" and "fail" all trigger `debug`. The intent with the
//! most distinct trigger hits wins; ties go to the intent declared first.
//! Each intent carries a fixed [`DepthPolicy`] which the traversal uses to
//! bound how far upstream and downstream it expands.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::lexical::{stem, tokenize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Debug,
    AddFeature,
    Refactor,
    Test,
    Document,
    Unknown,
}

/// Traversal depth in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthPolicy {
    pub upstream: usize,
    pub downstream: usize,
}

impl DepthPolicy {
    pub const fn new(upstream: usize, downstream: usize) -> Self {
        Self {
            upstream,
            downstream,
        }
    }
}

const TRIGGERS: &[(Intent, &[&str])] = &[
    (
        Intent::Debug,
        &[
            "debug", "fix", "error", "fail", "broken", "wrong", "incorrect", "issue", "bug",
            "problem",
        ],
    ),
    (
        Intent::AddFeature,
        &[
            "add", "create", "new", "build", "implement", "feature", "metric", "measure",
            "calculate",
        ],
    ),
    (
        Intent::Refactor,
        &[
            "refactor", "restructure", "reorganize", "rename", "move", "split", "merge",
            "optimize", "performance",
        ],
    ),
    (
        Intent::Test,
        &["test", "coverage", "validate", "assert", "check", "verify"],
    ),
    (
        Intent::Document,
        &["document", "describe", "description", "docs", "comment", "explain"],
    ),
];

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Debug,
        Intent::AddFeature,
        Intent::Refactor,
        Intent::Test,
        Intent::Document,
        Intent::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Debug => "debug",
            Intent::AddFeature => "add_feature",
            Intent::Refactor => "refactor",
            Intent::Test => "test",
            Intent::Document => "document",
            Intent::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Intent> {
        Intent::ALL
            .into_iter()
            .find(|i| i.as_str() == s.trim().to_ascii_lowercase())
    }

    /// Fixed depth table. `unknown` is deliberately shallow in both directions.
    pub fn default_depth(&self) -> DepthPolicy {
        match self {
            Intent::Debug => DepthPolicy::new(2, 1),
            Intent::AddFeature => DepthPolicy::new(1, 2),
            Intent::Refactor => DepthPolicy::new(1, 3),
            Intent::Test => DepthPolicy::new(0, 0),
            Intent::Document => DepthPolicy::new(1, 1),
            Intent::Unknown => DepthPolicy::new(1, 1),
        }
    }

    /// Classify a free-text task description.
    pub fn classify(task: &str) -> Intent {
        let tokens: BTreeSet<String> = tokenize(task).into_iter().collect();

        let mut best = Intent::Unknown;
        let mut best_hits = 0;
        for (intent, triggers) in TRIGGERS {
            let hits = triggers
                .iter()
                .map(|t| stem(t))
                .collect::<BTreeSet<_>>()
                .intersection(&tokens)
                .count();
            if hits > best_hits {
                best = *intent;
                best_hits = hits;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_debug_task() {
        assert_eq!(
            Intent::classify("debug failing test on revenue_daily"),
            Intent::Debug
        );
        assert_eq!(Intent::classify("Fix the broken join"), Intent::Debug);
    }

    #[test]
    fn test_classify_each_intent() {
        assert_eq!(
            Intent::classify("add a new churn metric"),
            Intent::AddFeature
        );
        assert_eq!(
            Intent::classify("rename and split the orders model"),
            Intent::Refactor
        );
        assert_eq!(
            Intent::classify("improve test coverage for payments"),
            Intent::Test
        );
        assert_eq!(
            Intent::classify("describe what customers contains"),
            Intent::Document
        );
    }

    #[test]
    fn test_no_trigger_is_unknown() {
        assert_eq!(Intent::classify("orders by region"), Intent::Unknown);
        assert_eq!(Intent::classify(""), Intent::Unknown);
        assert_eq!(Intent::Unknown.default_depth(), DepthPolicy::new(1, 1));
    }

    #[test]
    fn test_tie_goes_to_first_declared() {
        // one debug trigger, one test trigger
        assert_eq!(Intent::classify("fix test"), Intent::Debug);
    }

    #[test]
    fn test_parse_round_trips_names() {
        for intent in Intent::ALL {
            assert_eq!(Intent::parse(intent.as_str()), Some(intent));
        }
        assert_eq!(Intent::parse("explore"), None);
    }
}
