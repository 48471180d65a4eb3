//! Tree model: recursive decision/leaf nodes, ensembles of component trees,
//! and the compiled pre-order node table the trace engine walks.
//!
//! Pre-order numbering (root = 0, true branch before false branch) is the
//! node identity shared by traces and layouts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::condition::{extract_feature_name, flag_feature, parse_condition, Predicate};
use crate::error::ScoringError;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Decision {
        condition: String,
        true_branch: Box<TreeNode>,
        false_branch: Box<TreeNode>,
    },
    Leaf {
        value: f64,
    },
}

impl TreeNode {
    pub fn leaf(value: f64) -> Self {
        TreeNode::Leaf { value }
    }

    pub fn decision(condition: &str, true_branch: TreeNode, false_branch: TreeNode) -> Self {
        TreeNode::Decision {
            condition: condition.to_string(),
            true_branch: Box::new(true_branch),
            false_branch: Box::new(false_branch),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, TreeNode::Leaf { .. })
    }

    /// Nodes in pre-order with their depth (root at level 0).
    pub fn preorder(&self) -> PreOrder<'_> {
        PreOrder { stack: vec![(self, 0)] }
    }

    pub fn node_count(&self) -> usize {
        self.preorder().count()
    }

    pub fn leaf_count(&self) -> usize {
        self.preorder().filter(|(n, _)| n.is_leaf()).count()
    }

    /// Number of edges on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        self.preorder().map(|(_, level)| level).max().unwrap_or(0)
    }

    pub fn leaf_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.preorder().filter_map(|(n, _)| match n {
            TreeNode::Leaf { value } => Some(*value),
            TreeNode::Decision { .. } => None,
        })
    }
}

/// Explicit-stack pre-order traversal; deep trees never touch the call stack.
pub struct PreOrder<'a> {
    stack: Vec<(&'a TreeNode, usize)>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = (&'a TreeNode, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let (node, level) = self.stack.pop()?;
        if let TreeNode::Decision { true_branch, false_branch, .. } = node {
            self.stack.push((false_branch.as_ref(), level + 1));
            self.stack.push((true_branch.as_ref(), level + 1));
        }
        Some((node, level))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeType {
    Medical,
    Motor,
}

impl TreeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeType::Medical => "medical",
            TreeType::Motor => "motor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentTree {
    pub title: String,
    pub root: TreeNode,
}

impl ComponentTree {
    pub fn new(title: &str, root: TreeNode) -> Self {
        Self { title: title.to_string(), root }
    }
}

/// An additive ensemble as handed over by the ensemble source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ensemble {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub tree_type: TreeType,
    #[serde(rename = "structure")]
    pub trees: Vec<ComponentTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleSummary {
    pub tree_count: usize,
    pub node_count: usize,
    pub leaf_count: usize,
    pub max_depth: usize,
    pub features: Vec<String>,
    pub leaf_range: Option<(f64, f64)>,
}

impl Ensemble {
    pub fn new(name: &str, tree_type: TreeType, trees: Vec<ComponentTree>) -> Self {
        Self { id: String::new(), name: name.to_string(), tree_type, trees, created_at: None }
    }

    pub fn from_json_str(source: &str, json: &str) -> Result<Self, ScoringError> {
        serde_json::from_str(json).map_err(|e| ScoringError::load(source, e.to_string()))
    }

    pub fn from_json_path(path: &Path) -> Result<Self, ScoringError> {
        let source = path.display().to_string();
        let text =
            fs::read_to_string(path).map_err(|e| ScoringError::load(&source, e.to_string()))?;
        Self::from_json_str(&source, &text)
    }

    /// Global (min, max) leaf value across every component tree.
    pub fn leaf_range(&self) -> Option<(f64, f64)> {
        leaf_range(self.trees.iter().map(|t| &t.root))
    }

    /// Header statistics. Unlike [`compile`], this never fails: features of
    /// conditions that do not parse are reported by their leading name.
    pub fn summary(&self) -> EnsembleSummary {
        let mut features = BTreeSet::new();
        let mut node_count = 0;
        let mut leaf_count = 0;
        let mut max_depth = 0;
        for tree in &self.trees {
            for (node, level) in tree.root.preorder() {
                node_count += 1;
                max_depth = max_depth.max(level);
                match node {
                    TreeNode::Leaf { .. } => leaf_count += 1,
                    TreeNode::Decision { condition, .. } => {
                        let name = parse_condition(condition)
                            .map(|p| p.feature)
                            .ok()
                            .or_else(|| extract_feature_name(condition));
                        if let Some(name) = name {
                            features.insert(name);
                        }
                    }
                }
            }
        }
        EnsembleSummary {
            tree_count: self.trees.len(),
            node_count,
            leaf_count,
            max_depth,
            features: features.into_iter().collect(),
            leaf_range: self.leaf_range(),
        }
    }
}

pub fn leaf_range<'a>(roots: impl IntoIterator<Item = &'a TreeNode>) -> Option<(f64, f64)> {
    let mut range: Option<(f64, f64)> = None;
    for root in roots {
        for v in root.leaf_values() {
            range = Some(match range {
                None => (v, v),
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
            });
        }
    }
    range
}

// =============================================================================
// Compiled form
// =============================================================================

/// What a decision node checks.
#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    Predicate(Predicate),
    /// Bare feature name read as a boolean.
    Flag(String),
}

impl Test {
    pub fn feature(&self) -> &str {
        match self {
            Test::Predicate(p) => &p.feature,
            Test::Flag(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledNode {
    Split {
        condition: String,
        test: Test,
        true_id: usize,
        false_id: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTree {
    pub title: String,
    nodes: Vec<CompiledNode>,
}

impl CompiledTree {
    pub fn root_id(&self) -> usize {
        0
    }

    pub fn node(&self, id: usize) -> &CompiledNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledEnsemble {
    pub id: String,
    pub name: String,
    pub tree_type: TreeType,
    pub trees: Vec<CompiledTree>,
}

impl CompiledEnsemble {
    /// Every feature referenced by any decision node.
    pub fn features(&self) -> BTreeSet<String> {
        self.trees
            .iter()
            .flat_map(|t| t.nodes.iter())
            .filter_map(|n| match n {
                CompiledNode::Split { test, .. } => Some(test.feature().to_string()),
                CompiledNode::Leaf { .. } => None,
            })
            .collect()
    }
}

fn compile_test(
    ensemble: &Ensemble,
    tree_idx: usize,
    condition: &str,
) -> Result<Test, ScoringError> {
    match parse_condition(condition) {
        Ok(p) => Ok(Test::Predicate(p)),
        Err(failure) => match flag_feature(condition) {
            Some(name) => {
                log(
                    Level::Debug,
                    Domain::Parse,
                    "flag_condition",
                    obj(&[
                        ("ensemble", v_str(&ensemble.name)),
                        ("tree_index", v_num(tree_idx as f64)),
                        ("feature", v_str(&name)),
                    ]),
                );
                Ok(Test::Flag(name))
            }
            None => Err(ScoringError::configuration(
                &ensemble.name,
                format!("tree {} ('{}'): {}", tree_idx, ensemble.trees[tree_idx].title, failure),
            )),
        },
    }
}

/// Parse every condition once and flatten each tree into a pre-order table.
pub fn compile(ensemble: &Ensemble) -> Result<CompiledEnsemble, ScoringError> {
    if ensemble.trees.is_empty() {
        return Err(ScoringError::configuration(&ensemble.name, "ensemble has no component trees"));
    }

    let mut trees = Vec::with_capacity(ensemble.trees.len());
    for (tree_idx, tree) in ensemble.trees.iter().enumerate() {
        let mut nodes: Vec<CompiledNode> = Vec::new();
        // (node, parent slot to patch, is true branch)
        let mut stack: Vec<(&TreeNode, Option<(usize, bool)>)> = vec![(&tree.root, None)];
        while let Some((node, parent)) = stack.pop() {
            let id = nodes.len();
            if let Some((parent_id, is_true)) = parent {
                if let CompiledNode::Split { true_id, false_id, .. } = &mut nodes[parent_id] {
                    if is_true {
                        *true_id = id;
                    } else {
                        *false_id = id;
                    }
                }
            }
            match node {
                TreeNode::Leaf { value } => nodes.push(CompiledNode::Leaf { value: *value }),
                TreeNode::Decision { condition, true_branch, false_branch } => {
                    let test = compile_test(ensemble, tree_idx, condition)?;
                    nodes.push(CompiledNode::Split {
                        condition: condition.clone(),
                        test,
                        true_id: usize::MAX,
                        false_id: usize::MAX,
                    });
                    stack.push((false_branch.as_ref(), Some((id, false))));
                    stack.push((true_branch.as_ref(), Some((id, true))));
                }
            }
        }
        trees.push(CompiledTree { title: tree.title.clone(), nodes });
    }

    Ok(CompiledEnsemble {
        id: ensemble.id.clone(),
        name: ensemble.name.clone(),
        tree_type: ensemble.tree_type,
        trees,
    })
}
