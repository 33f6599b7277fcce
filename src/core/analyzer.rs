//! Batch analysis: validation, cycle detection and implicit file-conflict edges.

use std::collections::HashSet;

use glob::{MatchOptions, Pattern};
use serde::Serialize;

use crate::core::dag::{DependencyType, SchedulingLevel, TaskDAG};
use crate::core::task::{ErrorKind, Task, TaskFailure, TaskId, TaskSpec, TaskStatus};
use crate::error::{Result, SpecError};
use crate::{wlog_debug, wlog_warn};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// An edge synthesized because two tasks target overlapping files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImplicitEdge {
    pub before: TaskId,
    pub after: TaskId,
    pub patterns: Vec<String>,
}

/// Result of analyzing a task batch.
#[derive(Debug)]
pub struct Analysis {
    pub dag: TaskDAG,
    pub levels: Vec<SchedulingLevel>,
    /// Tasks that entered the graph already failed, with the reason.
    pub rejected: Vec<(TaskId, SpecError)>,
    pub implicit_edges: Vec<ImplicitEdge>,
}

pub struct TaskAnalyzer;

impl TaskAnalyzer {
    /// Build the dependency graph for a batch.
    ///
    /// # Errors
    /// Returns `Error::Spec` for batch-fatal problems: an empty or duplicate
    /// id, or a dependency cycle. Problems local to one task reject only
    /// that task (see [`Analysis::rejected`]).
    pub fn analyze(specs: Vec<TaskSpec>) -> Result<Analysis> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if spec.id.as_str().trim().is_empty() {
                return Err(SpecError::EmptyId.into());
            }
            if !seen.insert(spec.id.clone()) {
                return Err(SpecError::DuplicateTask(spec.id.clone()).into());
            }
        }

        let mut rejected: Vec<(TaskId, SpecError)> = Vec::new();
        for spec in &specs {
            if let Some(err) = validate_task(spec, &seen) {
                wlog_warn!("Rejecting task {}: {}", spec.id, err);
                rejected.push((spec.id.clone(), err));
            }
        }

        let mut dag = TaskDAG::new();
        for (seq, spec) in specs.iter().enumerate() {
            dag.add_task(Task::from_spec(spec.clone(), seq));
        }
        for spec in &specs {
            for dep in &spec.depends_on {
                if dep != &spec.id && seen.contains(dep) {
                    dag.add_dependency_unchecked(dep, &spec.id, DependencyType::Declared)?;
                }
            }
        }

        if let Some(path) = dag.find_cycle() {
            return Err(SpecError::Cycle { path }.into());
        }

        let rejected_ids: HashSet<&TaskId> = rejected.iter().map(|(id, _)| id).collect();
        let implicit_edges = synthesize_conflict_edges(&mut dag, &specs, &rejected_ids)?;

        for (id, err) in &rejected {
            if let Some(task) = dag.get_task_mut(id) {
                task.transition(TaskStatus::Failed {
                    failure: TaskFailure::permanent(
                        ErrorKind::SpecError,
                        err.to_string(),
                        "fix the task definition and resubmit",
                    ),
                })?;
            }
        }

        let levels = dag.levels()?;
        wlog_debug!(
            "Analyzed {} tasks: {} levels, {} implicit edges, {} rejected",
            dag.task_count(),
            levels.len(),
            implicit_edges.len(),
            rejected.len()
        );

        Ok(Analysis {
            dag,
            levels,
            rejected,
            implicit_edges,
        })
    }
}

fn validate_task(spec: &TaskSpec, known: &HashSet<TaskId>) -> Option<SpecError> {
    for dep in &spec.depends_on {
        if dep == &spec.id {
            return Some(SpecError::SelfDependency(spec.id.clone()));
        }
        if !known.contains(dep) {
            return Some(SpecError::UnknownDependency {
                task: spec.id.clone(),
                dependency: dep.clone(),
            });
        }
    }
    for target in &spec.target_files {
        let normalized = normalize(target);
        let reason = if normalized.is_empty() {
            Some("empty pattern".to_string())
        } else {
            Pattern::new(&normalized).err().map(|e| e.msg.to_string())
        };
        if let Some(reason) = reason {
            return Some(SpecError::InvalidPattern {
                task: spec.id.clone(),
                pattern: target.clone(),
                reason,
            });
        }
    }
    None
}

/// Pairwise overlap check in insertion order. Rejected tasks never run, so
/// they cannot conflict.
fn synthesize_conflict_edges(
    dag: &mut TaskDAG,
    specs: &[TaskSpec],
    rejected: &HashSet<&TaskId>,
) -> Result<Vec<ImplicitEdge>> {
    let mut edges = Vec::new();
    let candidates: Vec<(usize, &TaskSpec)> = specs
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.target_files.is_empty() && !rejected.contains(&s.id))
        .collect();

    for (i, (seq_a, a)) in candidates.iter().enumerate() {
        for (seq_b, b) in &candidates[i + 1..] {
            let patterns = overlapping_targets(&a.target_files, &b.target_files);
            if patterns.is_empty() {
                continue;
            }
            if dag.has_path(&a.id, &b.id) || dag.has_path(&b.id, &a.id) {
                continue;
            }

            // Higher priority goes first; ties keep insertion order.
            let a_first =
                (a.priority, std::cmp::Reverse(*seq_a)) >= (b.priority, std::cmp::Reverse(*seq_b));
            let (before, after) = if a_first { (&a.id, &b.id) } else { (&b.id, &a.id) };

            dag.add_dependency(
                before,
                after,
                DependencyType::FileConflict {
                    patterns: patterns.clone(),
                },
            )?;
            wlog_debug!(
                "Implicit edge {} -> {} on {}",
                before,
                after,
                patterns.join(", ")
            );
            edges.push(ImplicitEdge {
                before: before.clone(),
                after: after.clone(),
                patterns,
            });
        }
    }
    Ok(edges)
}

/// Targets of `a` that overlap some target of `b`.
fn overlapping_targets(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for x in a {
        for y in b {
            if targets_overlap(x, y) {
                let n = normalize(x);
                if !out.contains(&n) {
                    out.push(n);
                }
            }
        }
    }
    out
}

/// Strip a leading `./` and use forward slashes.
pub fn normalize(target: &str) -> String {
    let unified = target.trim().replace('\\', "/");
    let mut s = unified.as_str();
    while let Some(rest) = s.strip_prefix("./") {
        s = rest;
    }
    s.to_string()
}

fn is_glob(target: &str) -> bool {
    target.contains(['*', '?', '['])
}

/// Directory part of the literal prefix before the first wildcard.
fn literal_dir_prefix(pattern: &str) -> &str {
    let first_wild = pattern.find(['*', '?', '[']).unwrap_or(pattern.len());
    let literal = &pattern[..first_wild];
    match literal.rfind('/') {
        Some(slash) => &literal[..=slash],
        None => "",
    }
}

/// Whether two target entries may name a common file.
///
/// Two globs are compared by their literal directory prefixes, which can
/// report an overlap that no concrete file would produce.
pub fn targets_overlap(a: &str, b: &str) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    match (is_glob(&a), is_glob(&b)) {
        (false, false) => a == b,
        (true, false) => glob_matches(&a, &b),
        (false, true) => glob_matches(&b, &a),
        (true, true) => {
            let (pa, pb) = (literal_dir_prefix(&a), literal_dir_prefix(&b));
            pa.starts_with(pb) || pb.starts_with(pa)
        }
    }
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    Pattern::new(pattern)
        .map(|p| p.matches_with(path, MATCH_OPTIONS))
        .unwrap_or(false)
}
