//! Static validation of graph definitions.
//!
//! Everything that can be rejected before a run is created is rejected
//! here: duplicate ids, references to unknown nodes, edges contradicting
//! declared inputs, cycles, and nonsensical contract or assertion
//! parameters. The output is a [`ValidatedGraph`]: the definition plus the
//! derived structures the scheduler needs (topological order, dependency
//! and dependent maps, per-node contract index).
//!
//! Ordering ties are broken by ascending node id everywhere, so the derived
//! structures are identical across processes for the same definition.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::instrument;

use super::{AssertionDef, ContractDef, GraphDef, NodeDef};
use crate::assertions::AssertionCheck;

/// Rejections produced by [`validate`].
#[derive(Debug, Error, Diagnostic)]
pub enum GraphValidationError {
    #[error("graph '{graph_id}' defines no nodes")]
    #[diagnostic(code(gauntlet::validate::empty))]
    EmptyGraph { graph_id: String },

    #[error("duplicate node id '{id}'")]
    #[diagnostic(
        code(gauntlet::validate::duplicate_node),
        help("node ids must be unique within a graph")
    )]
    DuplicateNode { id: String },

    #[error("duplicate contract id '{id}'")]
    #[diagnostic(code(gauntlet::validate::duplicate_contract))]
    DuplicateContract { id: String },

    #[error("duplicate assertion id '{id}'")]
    #[diagnostic(code(gauntlet::validate::duplicate_assertion))]
    DuplicateAssertion { id: String },

    #[error("'{by}' references unknown node '{referenced}'")]
    #[diagnostic(
        code(gauntlet::validate::unknown_node),
        help("edges, inputs, contract sources, and assertion targets must name defined nodes")
    )]
    UnknownNode { referenced: String, by: String },

    #[error("edge {from} -> {to} has no matching entry in '{to}' inputs")]
    #[diagnostic(
        code(gauntlet::validate::edge_without_input),
        help("every edge target must list the edge source in its `inputs`")
    )]
    EdgeWithoutInput { from: String, to: String },

    #[error("node '{id}' depends on itself")]
    #[diagnostic(code(gauntlet::validate::self_loop))]
    SelfLoop { id: String },

    #[error("dependency cycle: {path}")]
    #[diagnostic(
        code(gauntlet::validate::cycle),
        help("behavioral graphs must be acyclic; break the cycle or model the loop inside one node")
    )]
    Cycle { path: String },

    #[error("contract '{id}' is invalid: {reason}")]
    #[diagnostic(code(gauntlet::validate::contract))]
    InvalidContract { id: String, reason: String },

    #[error("assertion '{id}' is invalid: {reason}")]
    #[diagnostic(code(gauntlet::validate::assertion))]
    InvalidAssertion { id: String, reason: String },

    #[error("chaos config is invalid: {reason}")]
    #[diagnostic(
        code(gauntlet::validate::chaos),
        help("rates are probabilities in [0.0, 1.0]")
    )]
    InvalidChaos { reason: String },
}

/// A definition that passed static validation, plus derived lookups.
#[derive(Clone, Debug)]
pub struct ValidatedGraph {
    def: GraphDef,
    topo_order: Vec<String>,
    dependencies: FxHashMap<String, Vec<String>>,
    dependents: FxHashMap<String, Vec<String>>,
    contracts_by_source: FxHashMap<String, Vec<usize>>,
}

impl ValidatedGraph {
    #[must_use]
    pub fn def(&self) -> &GraphDef {
        &self.def
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.def.nodes.iter().find(|n| n.id == id)
    }

    /// Node ids in deterministic topological order.
    #[must_use]
    pub fn topo_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Upstream node ids (sorted) whose outputs the node consumes.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map_or(&[], Vec::as_slice)
    }

    /// Downstream node ids (sorted) consuming this node's output.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    /// Contracts constraining the node's output.
    #[must_use]
    pub fn contracts_for(&self, id: &str) -> Vec<&ContractDef> {
        self.contracts_by_source
            .get(id)
            .map(|indices| indices.iter().map(|&i| &self.def.contracts[i]).collect())
            .unwrap_or_default()
    }

    /// A terminal node has no dependents; its failure always fails the run.
    #[must_use]
    pub fn is_terminal(&self, id: &str) -> bool {
        self.dependents_of(id).is_empty()
    }

    #[must_use]
    pub fn assertions(&self) -> &[AssertionDef] {
        &self.def.assertions
    }
}

/// Validate a parsed definition into a scheduler-ready graph.
#[instrument(skip_all, fields(graph_id = %def.id))]
pub fn validate(def: GraphDef) -> Result<ValidatedGraph, GraphValidationError> {
    if def.nodes.is_empty() {
        return Err(GraphValidationError::EmptyGraph { graph_id: def.id });
    }

    let mut node_ids = FxHashSet::default();
    for node in &def.nodes {
        if !node_ids.insert(node.id.as_str()) {
            return Err(GraphValidationError::DuplicateNode {
                id: node.id.clone(),
            });
        }
    }

    check_references(&def, &node_ids)?;
    check_contracts(&def)?;
    check_assertions(&def)?;
    check_chaos(&def)?;

    // Dependency set per node: declared inputs plus edge sources. Edges
    // contradicting inputs were rejected above, so edges only confirm what
    // inputs already declare; inputs without an edge are implied ordering.
    let mut dependencies: FxHashMap<String, Vec<String>> = FxHashMap::default();
    let mut dependents: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for node in &def.nodes {
        let mut deps: BTreeSet<String> = node.inputs.iter().cloned().collect();
        for edge in &def.edges {
            if edge.to == node.id {
                deps.insert(edge.from.clone());
            }
        }
        if deps.contains(&node.id) {
            return Err(GraphValidationError::SelfLoop {
                id: node.id.clone(),
            });
        }
        for dep in &deps {
            dependents
                .entry(dep.clone())
                .or_default()
                .push(node.id.clone());
        }
        dependencies.insert(node.id.clone(), deps.into_iter().collect());
    }
    for downstream in dependents.values_mut() {
        downstream.sort();
    }

    let topo_order = topological_order(&def, &dependencies)?;

    let mut contracts_by_source: FxHashMap<String, Vec<usize>> = FxHashMap::default();
    for (i, contract) in def.contracts.iter().enumerate() {
        contracts_by_source
            .entry(contract.source.clone())
            .or_default()
            .push(i);
    }

    Ok(ValidatedGraph {
        def,
        topo_order,
        dependencies,
        dependents,
        contracts_by_source,
    })
}

fn check_references(
    def: &GraphDef,
    node_ids: &FxHashSet<&str>,
) -> Result<(), GraphValidationError> {
    for node in &def.nodes {
        for input in &node.inputs {
            if !node_ids.contains(input.as_str()) {
                return Err(GraphValidationError::UnknownNode {
                    referenced: input.clone(),
                    by: format!("node '{}'", node.id),
                });
            }
        }
    }
    for edge in &def.edges {
        for end in [&edge.from, &edge.to] {
            if !node_ids.contains(end.as_str()) {
                return Err(GraphValidationError::UnknownNode {
                    referenced: end.clone(),
                    by: format!("edge {} -> {}", edge.from, edge.to),
                });
            }
        }
        let target = def
            .nodes
            .iter()
            .find(|n| n.id == edge.to)
            .filter(|n| n.inputs.contains(&edge.from));
        if target.is_none() && edge.from != edge.to {
            return Err(GraphValidationError::EdgeWithoutInput {
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        }
    }
    for contract in &def.contracts {
        if !node_ids.contains(contract.source.as_str()) {
            return Err(GraphValidationError::UnknownNode {
                referenced: contract.source.clone(),
                by: format!("contract '{}'", contract.id),
            });
        }
    }
    for assertion in &def.assertions {
        if !node_ids.contains(assertion.target.as_str()) {
            return Err(GraphValidationError::UnknownNode {
                referenced: assertion.target.clone(),
                by: format!("assertion '{}'", assertion.id),
            });
        }
    }
    Ok(())
}

fn check_contracts(def: &GraphDef) -> Result<(), GraphValidationError> {
    let mut seen = FxHashSet::default();
    for contract in &def.contracts {
        if !seen.insert(contract.id.as_str()) {
            return Err(GraphValidationError::DuplicateContract {
                id: contract.id.clone(),
            });
        }
        for (field, spec) in &contract.fields {
            if let (Some(min), Some(max)) = (spec.min, spec.max)
                && min > max
            {
                return Err(GraphValidationError::InvalidContract {
                    id: contract.id.clone(),
                    reason: format!("field '{field}' has min {min} above max {max}"),
                });
            }
            if let (Some(min), Some(max)) = (spec.min_length, spec.max_length)
                && min > max
            {
                return Err(GraphValidationError::InvalidContract {
                    id: contract.id.clone(),
                    reason: format!("field '{field}' has min_length {min} above max_length {max}"),
                });
            }
        }
    }
    Ok(())
}

fn check_assertions(def: &GraphDef) -> Result<(), GraphValidationError> {
    let invalid = |id: &str, reason: String| GraphValidationError::InvalidAssertion {
        id: id.to_string(),
        reason,
    };
    let mut seen = FxHashSet::default();
    for assertion in &def.assertions {
        if !seen.insert(assertion.id.as_str()) {
            return Err(GraphValidationError::DuplicateAssertion {
                id: assertion.id.clone(),
            });
        }
        match &assertion.check {
            AssertionCheck::GreaterThan { threshold } => {
                if !threshold.is_finite() {
                    return Err(invalid(&assertion.id, "threshold must be finite".into()));
                }
            }
            AssertionCheck::Range { min, max } => {
                if !min.is_finite() || !max.is_finite() {
                    return Err(invalid(&assertion.id, "range bounds must be finite".into()));
                }
                if min > max {
                    return Err(invalid(
                        &assertion.id,
                        format!("range min {min} above max {max}"),
                    ));
                }
            }
            AssertionCheck::LatencyUnder { max_ms } => {
                if !max_ms.is_finite() || *max_ms <= 0.0 {
                    return Err(invalid(&assertion.id, "max_ms must be positive".into()));
                }
            }
            AssertionCheck::CostUnder { max_usd } => {
                if !max_usd.is_finite() || *max_usd <= 0.0 {
                    return Err(invalid(&assertion.id, "max_usd must be positive".into()));
                }
            }
            AssertionCheck::SemanticSimilarity { threshold, .. } => {
                if !(0.0..=1.0).contains(threshold) {
                    return Err(invalid(
                        &assertion.id,
                        format!("similarity threshold {threshold} outside [0.0, 1.0]"),
                    ));
                }
            }
            AssertionCheck::Convergence { rounds, threshold } => {
                if *rounds < 2 {
                    return Err(invalid(
                        &assertion.id,
                        "convergence needs at least 2 rounds".into(),
                    ));
                }
                if !threshold.is_finite() || *threshold < 0.0 {
                    return Err(invalid(
                        &assertion.id,
                        "convergence threshold must be non-negative".into(),
                    ));
                }
            }
            AssertionCheck::Equals { .. }
            | AssertionCheck::Contains { .. }
            | AssertionCheck::NotContains { .. }
            | AssertionCheck::SchemaValid { .. } => {}
        }
    }
    Ok(())
}

fn check_chaos(def: &GraphDef) -> Result<(), GraphValidationError> {
    let Some(chaos) = def
        .execution_config
        .as_ref()
        .and_then(|c| c.chaos_config.as_ref())
    else {
        return Ok(());
    };
    for (name, rate) in [("drop_rate", chaos.drop_rate), ("corrupt_rate", chaos.corrupt_rate)] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(GraphValidationError::InvalidChaos {
                reason: format!("{name} {rate} outside [0.0, 1.0]"),
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm with a sorted ready set, so ties always resolve to the
/// smallest node id.
fn topological_order(
    def: &GraphDef,
    dependencies: &FxHashMap<String, Vec<String>>,
) -> Result<Vec<String>, GraphValidationError> {
    let mut indegree: FxHashMap<&str, usize> = FxHashMap::default();
    for node in &def.nodes {
        indegree.insert(node.id.as_str(), dependencies[&node.id].len());
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(def.nodes.len());

    while let Some(&id) = ready.iter().next() {
        ready.remove(id);
        order.push(id.to_string());
        for node in &def.nodes {
            if dependencies[&node.id].iter().any(|d| d == id) {
                let deg = indegree.get_mut(node.id.as_str()).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(node.id.as_str());
                }
            }
        }
    }

    if order.len() < def.nodes.len() {
        let remaining: BTreeSet<&str> = indegree
            .iter()
            .filter(|&(_, &deg)| deg > 0)
            .map(|(&id, _)| id)
            .collect();
        return Err(GraphValidationError::Cycle {
            path: cycle_path(&remaining, dependencies),
        });
    }
    Ok(order)
}

/// Walk dependencies inside the stuck set until a node repeats, yielding a
/// concrete cycle like `a -> b -> a`.
fn cycle_path(remaining: &BTreeSet<&str>, dependencies: &FxHashMap<String, Vec<String>>) -> String {
    let Some(&start) = remaining.iter().next() else {
        return "<unknown>".to_string();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(next) = dependencies
            .get(current)
            .and_then(|deps| deps.iter().find(|d| remaining.contains(d.as_str())))
        else {
            return path.join(" -> ");
        };
        if let Some(pos) = path.iter().position(|&p| p == next.as_str()) {
            let mut cycle: Vec<&str> = path[pos..].to_vec();
            cycle.push(next.as_str());
            return cycle.join(" -> ");
        }
        path.push(next.as_str());
        current = next.as_str();
    }
}
