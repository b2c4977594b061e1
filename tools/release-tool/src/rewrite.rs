//! Text rewriting behind the release subcommands.

use anyhow::{anyhow, Context, Result};
use regex::Regex;

const GENERATION_PATTERN: &str = r"(?m)^pub const CACHE_GENERATION: u64 = (\d+);";
const TAG_PATTERN: &str = r#"(?m)^pub const APP_VERSION: &str = "([^"]*)";"#;

/// What a bump did to the worker source.
#[derive(Debug, PartialEq, Eq)]
pub struct BumpOutcome {
    /// Generation found in the source.
    pub previous: u64,
    /// Generation written back.
    pub next: u64,
    /// Version tag written back, when one was requested.
    pub tag: Option<String>,
}

/// Rewrite the embedded cache generation, and optionally the version tag,
/// in the worker source text.
///
/// With no explicit `generation` the current value is incremented. A
/// requested `tag` replaces the embedded one, or is inserted right after
/// the generation constant when the source has none yet.
pub fn bump_source(
    source: &str,
    generation: Option<u64>,
    tag: Option<&str>,
) -> Result<(String, BumpOutcome)> {
    let generation_re = Regex::new(GENERATION_PATTERN).expect("static pattern");
    let captures = generation_re
        .captures(source)
        .ok_or_else(|| anyhow!("no embedded CACHE_GENERATION constant found"))?;

    let previous: u64 = captures[1]
        .parse()
        .context("embedded generation is not a number")?;
    let next = generation.unwrap_or(previous + 1);

    let mut rewritten = generation_re
        .replace(source, format!("pub const CACHE_GENERATION: u64 = {next};"))
        .into_owned();

    if let Some(tag) = tag {
        let tag_re = Regex::new(TAG_PATTERN).expect("static pattern");
        if tag_re.is_match(&rewritten) {
            rewritten = tag_re
                .replace(&rewritten, format!(r#"pub const APP_VERSION: &str = "{tag}";"#))
                .into_owned();
        } else {
            // No embedded tag yet: insert one after the generation line.
            let end = generation_re
                .find(&rewritten)
                .map(|m| m.end())
                .ok_or_else(|| anyhow!("generation constant vanished during rewrite"))?;
            rewritten.insert_str(end, &format!("\n\npub const APP_VERSION: &str = \"{tag}\";"));
        }
    }

    Ok((
        rewritten,
        BumpOutcome {
            previous,
            next,
            tag: tag.map(str::to_string),
        },
    ))
}

/// A date-based version tag, `YYYY.MM.DD.<build>`, where the build suffix
/// is derived from the current time.
pub fn dated_tag() -> String {
    use chrono::{Datelike, Local, Utc};
    let now = Local::now();
    let build = Utc::now().timestamp() % 10_000;
    format!("{}.{:02}.{:02}.{}", now.year(), now.month(), now.day(), build)
}

/// Replace each named placeholder token in `template` with the value the
/// lookup yields, failing open to an empty string when a value is absent.
/// Everything that is not a listed placeholder is preserved byte-for-byte.
pub fn substitute_source<F>(template: &str, keys: &[String], lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut output = template.to_string();
    for key in keys {
        let value = lookup(key).unwrap_or_default();
        output = output.replace(key.as_str(), &value);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
//! Build-stamped deployment identity.

pub const CACHE_GENERATION: u64 = 18;

pub const APP_VERSION: &str = \"2026.07.28.2214\";
";

    #[test]
    fn test_bump_increments_without_target() {
        let (rewritten, outcome) = bump_source(SOURCE, None, None).unwrap();
        assert_eq!(outcome.previous, 18);
        assert_eq!(outcome.next, 19);
        assert!(rewritten.contains("pub const CACHE_GENERATION: u64 = 19;"));
        // The tag is untouched when none is requested.
        assert!(rewritten.contains("2026.07.28.2214"));
    }

    #[test]
    fn test_bump_honors_explicit_target() {
        let (rewritten, outcome) = bump_source(SOURCE, Some(42), None).unwrap();
        assert_eq!(outcome.next, 42);
        assert!(rewritten.contains("pub const CACHE_GENERATION: u64 = 42;"));
    }

    #[test]
    fn test_bump_rewrites_tag() {
        let (rewritten, outcome) = bump_source(SOURCE, None, Some("2026.08.05.1234")).unwrap();
        assert_eq!(outcome.tag.as_deref(), Some("2026.08.05.1234"));
        assert!(rewritten.contains(r#"pub const APP_VERSION: &str = "2026.08.05.1234";"#));
        assert!(!rewritten.contains("2026.07.28.2214"));
    }

    #[test]
    fn test_bump_inserts_missing_tag() {
        let tagless = "pub const CACHE_GENERATION: u64 = 3;\n";
        let (rewritten, _) = bump_source(tagless, None, Some("1.2.3")).unwrap();
        assert!(rewritten.contains("pub const CACHE_GENERATION: u64 = 4;"));
        assert!(rewritten.contains(r#"pub const APP_VERSION: &str = "1.2.3";"#));
    }

    #[test]
    fn test_bump_fails_without_pattern() {
        assert!(bump_source("fn main() {}\n", None, None).is_err());
    }

    #[test]
    fn test_dated_tag_shape() {
        let tag = dated_tag();
        let parts: Vec<&str> = tag.split('.').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 2);
    }

    #[test]
    fn test_substitute_replaces_supplied_subset() {
        let template = "key: 'APP_API_KEY'\nid: 'APP_ANALYTICS_ID'\n";
        let keys = vec!["APP_API_KEY".to_string(), "APP_ANALYTICS_ID".to_string()];
        let output = substitute_source(template, &keys, |key| match key {
            "APP_API_KEY" => Some("sk-123".to_string()),
            _ => None,
        });

        // Supplied values land; absent ones fail open to empty.
        assert_eq!(output, "key: 'sk-123'\nid: ''\n");
        assert!(!output.contains("APP_API_KEY"));
        assert!(!output.contains("APP_ANALYTICS_ID"));
    }

    #[test]
    fn test_substitute_preserves_other_bytes() {
        let template = "// header\nlet x = 'TOKEN_A';\n// trailer\n";
        let keys = vec!["TOKEN_A".to_string()];
        let output = substitute_source(template, &keys, |_| Some("v".to_string()));
        assert_eq!(output, "// header\nlet x = 'v';\n// trailer\n");
    }
}
