//! Story dependency graph.
//!
//! Each story maps to the stories it must wait for (prerequisites) and the
//! stories it must never run alongside (conflicts). The graph is built once per
//! build run from a backlog snapshot and is immutable afterwards.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BuildResult;
use crate::model::{Story, StoryStatus};

/// Prerequisites and conflicts of one story.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryDependencies {
    pub prerequisites: Vec<String>,
    pub conflicts: Vec<String>,
}

/// Dependency analysis collaborator.
#[async_trait]
pub trait DependencyAnalyzer: Send + Sync {
    async fn analyze(&self, stories: &[Story]) -> BuildResult<HashMap<String, StoryDependencies>>;
}

/// Analyzer driven by what stories declare about themselves.
///
/// Prerequisites come from `dependsOn`. Conflicts come from `conflictsWith`
/// plus every other story whose `targetFiles` overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredDependencies;

#[async_trait]
impl DependencyAnalyzer for DeclaredDependencies {
    async fn analyze(&self, stories: &[Story]) -> BuildResult<HashMap<String, StoryDependencies>> {
        let mut result = HashMap::new();
        for story in stories {
            let files: HashSet<&String> = story.target_files.iter().collect();
            let mut conflicts: BTreeSet<String> = story.conflicts_with.iter().cloned().collect();
            for other in stories {
                if other.id != story.id && other.target_files.iter().any(|f| files.contains(f)) {
                    conflicts.insert(other.id.clone());
                }
            }
            result.insert(
                story.id.clone(),
                StoryDependencies {
                    prerequisites: story.depends_on.clone(),
                    conflicts: conflicts.into_iter().collect(),
                },
            );
        }
        Ok(result)
    }
}

/// Immutable dependency graph for one build run.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, StoryDependencies>,
}

impl DependencyGraph {
    /// Builds a graph from analyzer output restricted to `story_ids`.
    ///
    /// References to unknown stories and self references are dropped, and
    /// conflicts are made symmetric.
    pub fn new<'a>(
        story_ids: impl IntoIterator<Item = &'a str>,
        analysis: HashMap<String, StoryDependencies>,
    ) -> Self {
        let known: HashSet<&str> = story_ids.into_iter().collect();
        let mut prerequisites: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut conflicts: HashMap<String, BTreeSet<String>> = HashMap::new();
        for id in &known {
            prerequisites.insert(id.to_string(), BTreeSet::new());
            conflicts.insert(id.to_string(), BTreeSet::new());
        }

        for (id, deps) in analysis {
            if !known.contains(id.as_str()) {
                warn!(story_id = %id, "Dependency analysis returned an unknown story, ignoring");
                continue;
            }
            for prereq in deps.prerequisites {
                if prereq == id {
                    continue;
                }
                if !known.contains(prereq.as_str()) {
                    warn!(story_id = %id, prerequisite = %prereq, "Ignoring unknown prerequisite");
                    continue;
                }
                if let Some(set) = prerequisites.get_mut(&id) {
                    set.insert(prereq);
                }
            }
            for other in deps.conflicts {
                if other == id || !known.contains(other.as_str()) {
                    continue;
                }
                if let Some(set) = conflicts.get_mut(&other) {
                    set.insert(id.clone());
                }
                if let Some(set) = conflicts.get_mut(&id) {
                    set.insert(other);
                }
            }
        }

        let nodes = prerequisites
            .into_iter()
            .map(|(id, prereqs)| {
                let conflicts = conflicts.remove(&id).unwrap_or_default();
                (
                    id,
                    StoryDependencies {
                        prerequisites: prereqs.into_iter().collect(),
                        conflicts: conflicts.into_iter().collect(),
                    },
                )
            })
            .collect();
        Self { nodes }
    }

    pub fn get(&self, story_id: &str) -> Option<&StoryDependencies> {
        self.nodes.get(story_id)
    }

    pub fn prerequisites(&self, story_id: &str) -> &[String] {
        self.nodes
            .get(story_id)
            .map(|d| d.prerequisites.as_slice())
            .unwrap_or(&[])
    }

    pub fn conflicts(&self, story_id: &str) -> &[String] {
        self.nodes
            .get(story_id)
            .map(|d| d.conflicts.as_slice())
            .unwrap_or(&[])
    }

    /// Groups of stories that depend on each other in a cycle.
    ///
    /// Stories in a cycle can never become ready and end a build as blocked.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for id in self.nodes.keys() {
            indices.insert(id.as_str(), graph.add_node(id.as_str()));
        }
        for (id, deps) in &self.nodes {
            for prereq in &deps.prerequisites {
                if let (Some(&from), Some(&to)) = (indices.get(prereq.as_str()), indices.get(id.as_str())) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                let mut ids: Vec<String> = component.into_iter().map(|ix| graph[ix].to_string()).collect();
                ids.sort();
                ids
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Prerequisites of `story_id` that are neither complete this run nor
    /// previously passing.
    pub fn unsatisfied_prerequisites(
        &self,
        story_id: &str,
        statuses: &HashMap<String, StoryStatus>,
        passing: &HashSet<String>,
    ) -> Vec<String> {
        self.prerequisites(story_id)
            .iter()
            .filter(|prereq| {
                !passing.contains(*prereq) && statuses.get(*prereq) != Some(&StoryStatus::Complete)
            })
            .cloned()
            .collect()
    }

    /// Whether `story_id` may start now.
    ///
    /// Ready means pending, every prerequisite complete or already passing,
    /// and no conflicting story in progress.
    pub fn is_ready(
        &self,
        story_id: &str,
        statuses: &HashMap<String, StoryStatus>,
        passing: &HashSet<String>,
    ) -> bool {
        if statuses.get(story_id) != Some(&StoryStatus::Pending) {
            return false;
        }
        if !self.unsatisfied_prerequisites(story_id, statuses, passing).is_empty() {
            return false;
        }
        !self
            .conflicts(story_id)
            .iter()
            .any(|other| statuses.get(other) == Some(&StoryStatus::InProgress))
    }
}
