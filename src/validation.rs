//! Structural validation of workflow definitions.
//!
//! [`validate`] is a pure function over a [`WorkflowDefinition`]: no side
//! effects, safe to call repeatedly. It reports every problem it finds rather
//! than stopping at the first, in check order: duplicate node ids, dangling
//! references, then dependency cycles. The orchestrator refuses to construct
//! for any definition with a non-empty error list.

use std::fmt;

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::definition::WorkflowDefinition;
use crate::types::NodeId;

/// Which field of a node held a dangling reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceField {
    DependsOn,
    OnSuccess,
    OnFailure,
}

impl fmt::Display for ReferenceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependsOn => write!(f, "depends_on"),
            Self::OnSuccess => write!(f, "on_success"),
            Self::OnFailure => write!(f, "on_failure"),
        }
    }
}

/// A structural defect in a workflow definition.
#[derive(Clone, Debug, Error, Diagnostic, PartialEq)]
pub enum ValidationError {
    #[error("duplicate node id: {node_id}")]
    #[diagnostic(
        code(taskloom::validation::duplicate_id),
        help("node ids must be unique within a definition")
    )]
    DuplicateNodeId { node_id: NodeId },

    #[error("node {node_id} references unknown node {reference} in {field}")]
    #[diagnostic(
        code(taskloom::validation::dangling_reference),
        help("every id in depends_on, on_success, and on_failure must name a node in the definition")
    )]
    DanglingReference {
        node_id: NodeId,
        reference: NodeId,
        field: ReferenceField,
    },

    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    #[diagnostic(
        code(taskloom::validation::cycle),
        help("depends_on edges must form a directed acyclic graph")
    )]
    Cycle { cycle: Vec<NodeId> },
}

/// Validate a definition, returning every structural error found.
///
/// An empty result means the definition is safe to execute. Checks run in
/// order; cycle detection skips edges to unknown ids so a dangling reference
/// is reported exactly once.
///
/// # Examples
///
/// ```
/// use taskloom::definition::{DagNode, WorkflowDefinition};
/// use taskloom::validation::{validate, ValidationError};
///
/// let cyclic = WorkflowDefinition::new("wf")
///     .add_node(DagNode::new("a").depends_on(["b"]))
///     .add_node(DagNode::new("b").depends_on(["a"]));
///
/// let errors = validate(&cyclic);
/// assert!(matches!(errors.as_slice(), [ValidationError::Cycle { .. }]));
/// ```
#[must_use]
pub fn validate(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // (a) duplicate ids
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for node in &definition.nodes {
        if !seen.insert(&node.id) {
            errors.push(ValidationError::DuplicateNodeId {
                node_id: node.id.clone(),
            });
        }
    }

    // (b) dangling references
    let known: FxHashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();
    for node in &definition.nodes {
        for dep in &node.depends_on {
            if !known.contains(dep.as_str()) {
                errors.push(dangling(&node.id, dep, ReferenceField::DependsOn));
            }
        }
        if let Some(next) = &node.conditional_next {
            for id in &next.on_success {
                if !known.contains(id.as_str()) {
                    errors.push(dangling(&node.id, id, ReferenceField::OnSuccess));
                }
            }
            for id in &next.on_failure {
                if !known.contains(id.as_str()) {
                    errors.push(dangling(&node.id, id, ReferenceField::OnFailure));
                }
            }
        }
    }

    // (c) cycles among depends_on edges
    errors.extend(find_cycles(definition));

    errors
}

fn dangling(node_id: &str, reference: &str, field: ReferenceField) -> ValidationError {
    ValidationError::DanglingReference {
        node_id: node_id.to_string(),
        reference: reference.to_string(),
        field,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// DFS back-edge detection over `depends_on` edges.
///
/// Each cycle is reported once, listing the node ids along it in traversal
/// order. Edges to unknown ids are skipped (reported as dangling above).
fn find_cycles(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    let index: FxHashMap<&str, usize> = definition
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut marks = vec![Mark::Unvisited; definition.nodes.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut errors = Vec::new();

    fn visit(
        at: usize,
        definition: &WorkflowDefinition,
        index: &FxHashMap<&str, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        errors: &mut Vec<ValidationError>,
    ) {
        marks[at] = Mark::InProgress;
        stack.push(at);

        for dep in &definition.nodes[at].depends_on {
            let Some(&next) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[next] {
                Mark::Unvisited => visit(next, definition, index, marks, stack, errors),
                Mark::InProgress => {
                    // Back edge: the cycle is the stack slice from `next` on.
                    let start = stack
                        .iter()
                        .position(|&i| i == next)
                        .expect("in-progress node is on the stack");
                    let cycle = stack[start..]
                        .iter()
                        .map(|&i| definition.nodes[i].id.clone())
                        .collect();
                    errors.push(ValidationError::Cycle { cycle });
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[at] = Mark::Done;
    }

    for i in 0..definition.nodes.len() {
        if marks[i] == Mark::Unvisited {
            visit(i, definition, &index, &mut marks, &mut stack, &mut errors);
        }
    }

    errors
}
