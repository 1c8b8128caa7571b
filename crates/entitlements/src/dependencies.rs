//! Feature prerequisite graph
//!
//! Each feature lists the features it needs (its dependencies plus its parent).
//! The graph may contain cycles; traversal is iterative with a visited set.

use std::collections::{HashMap, HashSet};

use crate::aliases::FeatureAliases;
use crate::models::FeatureDefinition;

#[derive(Debug, Clone, Default)]
pub struct FeatureGraph {
    /// canonical key -> canonical prerequisites, in declaration order
    prerequisites: HashMap<String, Vec<String>>,
    parents: HashMap<String, String>,
}

impl FeatureGraph {
    pub fn from_definitions(definitions: &[FeatureDefinition], aliases: &FeatureAliases) -> Self {
        let mut prerequisites: HashMap<String, Vec<String>> = HashMap::new();
        let mut parents = HashMap::new();

        for def in definitions {
            let key = aliases.canonical(&def.feature_key).to_string();
            let entry = prerequisites.entry(key.clone()).or_default();

            for dep in &def.dependencies {
                let dep = aliases.canonical(dep).to_string();
                if dep != key && !entry.contains(&dep) {
                    entry.push(dep);
                }
            }
            if let Some(parent) = &def.parent {
                let parent = aliases.canonical(parent).to_string();
                if parent != key && !entry.contains(&parent) {
                    entry.push(parent.clone());
                }
                parents.insert(key, parent);
            }
        }

        Self {
            prerequisites,
            parents,
        }
    }

    pub fn parent(&self, feature: &str) -> Option<&str> {
        self.parents.get(feature).map(String::as_str)
    }

    pub fn prerequisites(&self, feature: &str) -> &[String] {
        self.prerequisites
            .get(feature)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Direct and transitive prerequisites of `feature` absent from `enabled`,
    /// in discovery order. `feature` must already be canonical.
    pub fn missing_dependencies(&self, feature: &str, enabled: &HashSet<String>) -> Vec<String> {
        let mut missing = Vec::new();
        let mut visited: HashSet<&str> = HashSet::from([feature]);
        let mut stack: Vec<&str> = self
            .prerequisites(feature)
            .iter()
            .rev()
            .map(String::as_str)
            .collect();

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if !enabled.contains(current) {
                missing.push(current.to_string());
            }
            stack.extend(
                self.prerequisites(current)
                    .iter()
                    .rev()
                    .map(String::as_str)
                    .filter(|dep| !visited.contains(dep)),
            );
        }

        missing
    }
}
