//! Feature key aliases
//!
//! Some features are known under more than one key (`timetable` and `timetables`).
//! Every lookup canonicalizes first; enabled sets are expanded to all variants so
//! callers may use either spelling.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct FeatureAliases {
    /// alias -> canonical key
    aliases: HashMap<String, String>,
}

impl FeatureAliases {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        Self { aliases }
    }

    pub fn canonical<'a>(&'a self, key: &'a str) -> &'a str {
        self.aliases.get(key).map(String::as_str).unwrap_or(key)
    }

    /// Original key, its canonical form, and every alias of that canonical form
    pub fn variants(&self, key: &str) -> Vec<String> {
        let canonical = self.canonical(key);
        let mut variants = vec![key.to_string()];
        if canonical != key {
            variants.push(canonical.to_string());
        }

        let mut aliases: Vec<&String> = self
            .aliases
            .iter()
            .filter(|(_, target)| target.as_str() == canonical)
            .map(|(alias, _)| alias)
            .collect();
        aliases.sort();

        for alias in aliases {
            if !variants.iter().any(|v| v == alias) {
                variants.push(alias.clone());
            }
        }
        variants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases() -> FeatureAliases {
        FeatureAliases::new(HashMap::from([
            ("timetable".to_string(), "timetables".to_string()),
            ("reports".to_string(), "pdf_reports".to_string()),
        ]))
    }

    #[test]
    fn test_canonical_resolves_alias() {
        let aliases = aliases();
        assert_eq!(aliases.canonical("reports"), "pdf_reports");
        assert_eq!(aliases.canonical("pdf_reports"), "pdf_reports");
        assert_eq!(aliases.canonical("hostel"), "hostel");
    }

    #[test]
    fn test_variants_cover_both_directions() {
        let aliases = aliases();
        assert_eq!(aliases.variants("timetable"), vec!["timetable", "timetables"]);
        assert_eq!(aliases.variants("timetables"), vec!["timetables", "timetable"]);
        assert_eq!(aliases.variants("library"), vec!["library"]);
    }
}
