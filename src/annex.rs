//! Annex decision policy
//!
//! Decides per file whether content is committed directly to git or handed to
//! the annex. The decision depends only on the path, the size and the rule
//! snapshot, so clone, upload and status passes all agree.

use glob::{MatchOptions, Pattern};
use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::config::AnnexConfig;
use crate::error::{GinError, Result};

/// How a file's content is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// Stored in git history
    Direct,
    /// Stored by reference in the annex
    Annexed,
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingMode::Direct => write!(f, "direct"),
            TrackingMode::Annexed => write!(f, "annexed"),
        }
    }
}

/// Snapshot of the annex rules for one command
#[derive(Debug, Clone)]
pub struct AnnexRule {
    patterns: Vec<Pattern>,
    min_size: u64,
}

/// Glob semantics of the annex `include=` matcher: patterns are matched
/// against the path from the repository root and wildcards cross `/`
const ANNEX_GLOB: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

impl AnnexRule {
    pub fn new<I, S>(exclude: I, min_size: u64) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = exclude
            .into_iter()
            .map(|glob| compile(glob.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns, min_size })
    }

    /// Build the rule from the `annex` configuration section
    pub fn from_config(config: &AnnexConfig) -> Result<Self> {
        let min_size = crate::config::parse_size(&config.minsize)?;
        Self::new(&config.exclude, min_size)
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_with(path, ANNEX_GLOB))
    }

    /// Render the rule as an `annex.largefiles` expression
    pub fn largefiles_expression(&self) -> String {
        let size = match self.min_size {
            0 => "anything".to_string(),
            n => format!("largerthan={}b", n - 1),
        };

        if self.patterns.is_empty() {
            return size;
        }

        let includes = self
            .patterns
            .iter()
            .map(|p| format!("include={}", p.as_str()))
            .collect::<Vec<_>>()
            .join(" or ");
        format!("{} and not ({})", size, includes)
    }
}

fn compile(glob: &str) -> Result<Pattern> {
    let glob = glob.trim().trim_start_matches('/');
    Pattern::new(glob).map_err(|e| {
        GinError::Config(format!("invalid annex exclude pattern '{}': {}", glob, e))
    })
}

/// Decide how a file should be tracked.
///
/// A file is annexed iff it is at least `min_size` bytes and matches no
/// exclude pattern.
pub fn classify_file(path: &Path, size: u64, rules: &AnnexRule) -> TrackingMode {
    let normalized = path.to_string_lossy().replace('\\', "/");
    let normalized = normalized.trim_start_matches("./");

    if rules.is_excluded(normalized) || size < rules.min_size {
        TrackingMode::Direct
    } else {
        TrackingMode::Annexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    const MIN: u64 = 10_000_000;

    fn rules(exclude: &[&str]) -> AnnexRule {
        AnnexRule::new(exclude, MIN).unwrap()
    }

    #[test]
    fn test_threshold_boundaries() {
        let rules = rules(&[]);
        let path = Path::new("data/recording.bin");

        assert_eq!(classify_file(path, MIN, &rules), TrackingMode::Annexed);
        assert_eq!(classify_file(path, MIN - 1, &rules), TrackingMode::Direct);
        assert_eq!(classify_file(path, MIN + 1, &rules), TrackingMode::Annexed);
        assert_eq!(classify_file(path, 0, &rules), TrackingMode::Direct);
    }

    #[test]
    fn test_excluded_file_is_direct_at_any_size() {
        let rules = rules(&["*.md", "scripts/*.py"]);

        assert_eq!(
            classify_file(Path::new("README.md"), 10 * MIN, &rules),
            TrackingMode::Direct
        );
        assert_eq!(
            classify_file(Path::new("docs/deep/notes.md"), 10 * MIN, &rules),
            TrackingMode::Direct
        );
        assert_eq!(
            classify_file(Path::new("scripts/analysis.py"), 10 * MIN, &rules),
            TrackingMode::Direct
        );
        // Anchored pattern does not reach into other directories
        assert_eq!(
            classify_file(Path::new("other/scripts/analysis.py"), 10 * MIN, &rules),
            TrackingMode::Annexed
        );
    }

    #[test]
    fn test_glob_syntax() {
        let rules = rules(&["raw/**", "img?.png", "a.b"]);

        assert_eq!(
            classify_file(Path::new("raw/x/y/z.dat"), MIN, &rules),
            TrackingMode::Direct
        );
        assert_eq!(
            classify_file(Path::new("img1.png"), MIN, &rules),
            TrackingMode::Direct
        );
        assert_eq!(
            classify_file(Path::new("img10.png"), MIN, &rules),
            TrackingMode::Annexed
        );
        // '.' is literal
        assert_eq!(
            classify_file(Path::new("axb"), MIN, &rules),
            TrackingMode::Annexed
        );
        assert_eq!(
            classify_file(Path::new("./a.b"), MIN, &rules),
            TrackingMode::Direct
        );
    }

    #[test]
    fn test_character_classes() {
        let rules = rules(&["*.[ch]", "run[0-9].log"]);

        assert_eq!(
            classify_file(Path::new("main.c"), 10 * MIN, &rules),
            TrackingMode::Direct
        );
        assert_eq!(
            classify_file(Path::new("src/util.h"), 10 * MIN, &rules),
            TrackingMode::Direct
        );
        assert_eq!(
            classify_file(Path::new("main.cpp"), 10 * MIN, &rules),
            TrackingMode::Annexed
        );
        assert_eq!(
            classify_file(Path::new("run7.log"), 10 * MIN, &rules),
            TrackingMode::Direct
        );
        assert_eq!(
            classify_file(Path::new("runX.log"), 10 * MIN, &rules),
            TrackingMode::Annexed
        );
    }

    #[test]
    fn test_wildcards_cross_directories_like_annex_include() {
        let rules = rules(&["raw/*"]);

        assert_eq!(
            classify_file(Path::new("raw/x/y.dat"), 10 * MIN, &rules),
            TrackingMode::Direct
        );
        assert_eq!(
            classify_file(Path::new("raw/top.dat"), 10 * MIN, &rules),
            TrackingMode::Direct
        );
        assert_eq!(
            classify_file(Path::new("cooked/raw/y.dat"), 10 * MIN, &rules),
            TrackingMode::Annexed
        );
        assert_eq!(
            rules.largefiles_expression(),
            "largerthan=9999999b and not (include=raw/*)"
        );
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = AnnexRule::new(["data/[unclosed"], MIN).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_zero_min_size_annexes_everything_not_excluded() {
        let rules = AnnexRule::new(["*.txt"], 0).unwrap();
        assert_eq!(
            classify_file(Path::new("empty.dat"), 0, &rules),
            TrackingMode::Annexed
        );
        assert_eq!(
            classify_file(Path::new("empty.txt"), 0, &rules),
            TrackingMode::Direct
        );
    }

    #[test]
    fn test_from_config() {
        let config = AnnexConfig {
            exclude: vec!["*.csv".to_string()],
            minsize: "1kB".to_string(),
        };
        let rules = AnnexRule::from_config(&config).unwrap();
        assert_eq!(
            rules.largefiles_expression(),
            "largerthan=999b and not (include=*.csv)"
        );
        assert_eq!(
            classify_file(Path::new("table.csv"), 5000, &rules),
            TrackingMode::Direct
        );

        let bad = AnnexConfig {
            exclude: Vec::new(),
            minsize: "lots".to_string(),
        };
        assert!(AnnexRule::from_config(&bad).is_err());
    }

    #[test]
    fn test_largefiles_expression() {
        assert_eq!(rules(&[]).largefiles_expression(), "largerthan=9999999b");
        assert_eq!(
            rules(&["*.md", "docs/*"]).largefiles_expression(),
            "largerthan=9999999b and not (include=*.md or include=docs/*)"
        );
        assert_eq!(
            AnnexRule::new(Vec::<String>::new(), 0)
                .unwrap()
                .largefiles_expression(),
            "anything"
        );
    }

    #[quickcheck]
    fn prop_excluded_always_direct(name: String, size: u64) -> bool {
        let name: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let path = format!("{}.md", name);
        classify_file(Path::new(&path), size, &rules(&["*.md"])) == TrackingMode::Direct
    }

    #[quickcheck]
    fn prop_classification_is_monotonic_in_size(size: u64) -> bool {
        let rules = rules(&[]);
        let path = Path::new("file.dat");
        let here = classify_file(path, size, &rules);
        let bigger = classify_file(path, size.saturating_add(1), &rules);
        here == TrackingMode::Direct || bigger == TrackingMode::Annexed
    }
}
