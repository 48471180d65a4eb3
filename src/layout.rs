//! Tree-to-graph layout: positioned nodes and labeled edges for a renderer.
//!
//! Geometry: each node owns a horizontal band. A decision splits its band at
//! the midpoint, true branch left and false branch right, and sits at the
//! band's center. Rows are `row_height` apart. Ids are `<prefix>-node-<n>`
//! with `n` the pre-order index used by traces.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::condition::{
    extract_feature_name, flag_feature, format_false_label, format_number, format_true_label,
    parse_condition,
};
use crate::logging::{log, obj, v_num, v_str, Domain, Level, ProfileScope};
use crate::trace::TraceResult;
use crate::tree::{leaf_range, ComponentTree, Ensemble, TreeNode};

pub const NEUTRAL_HUE: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutConfig {
    pub min_x: f64,
    pub max_x: f64,
    pub row_height: f64,
    pub cell_width: f64,
    pub cell_height: f64,
    pub columns_per_row: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            min_x: 0.0,
            max_x: 800.0,
            row_height: 100.0,
            cell_width: 1000.0,
            cell_height: 800.0,
            columns_per_row: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Root,
    Decision,
    Leaf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    pub x: f64,
    pub y: f64,
    /// Pre-order index within the component tree.
    pub index: usize,
    pub tree_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub highlighted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub label: String,
    pub branch: bool,
    pub highlighted: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Graph {
    fn extend(&mut self, other: Graph) {
        self.nodes.extend(other.nodes);
        self.edges.extend(other.edges);
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// `hsl(h, 70%, 50%)` with hue 0 at the range minimum and 120 at the maximum.
pub fn leaf_color(value: f64, range: (f64, f64)) -> String {
    let (lo, hi) = range;
    let hue = if hi > lo {
        ((value - lo) / (hi - lo)).clamp(0.0, 1.0) * 120.0
    } else {
        NEUTRAL_HUE
    };
    format!("hsl({:.0}, 70%, 50%)", hue)
}

struct Frame<'a> {
    node: &'a TreeNode,
    level: usize,
    lo: f64,
    hi: f64,
    parent: Option<(String, bool, String)>,
}

fn branch_labels(condition: &str) -> (String, String) {
    match parse_condition(condition) {
        Ok(p) => (format_true_label(&p), format_false_label(&p)),
        Err(_) => ("Yes".to_string(), "No".to_string()),
    }
}

fn node_label(condition: &str) -> String {
    parse_condition(condition)
        .map(|p| p.feature)
        .ok()
        .or_else(|| flag_feature(condition))
        .or_else(|| extract_feature_name(condition))
        .unwrap_or_else(|| condition.trim().to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutEngine {
    config: LayoutConfig,
}

impl LayoutEngine {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Lay out one tree, coloring leaves over that tree's own value range.
    pub fn layout_tree(
        &self,
        root: &TreeNode,
        title: &str,
        offset_x: f64,
        offset_y: f64,
        id_prefix: &str,
    ) -> Graph {
        let range = leaf_range([root]).unwrap_or((0.0, 0.0));
        self.place(root, title, 0, (offset_x, offset_y), id_prefix, range)
    }

    /// One component tree of an ensemble on its own, colored over the whole
    /// ensemble's leaf range and numbered as in the grid (`tree-<index>`), so
    /// colors and highlighted paths agree with the grid view.
    pub fn layout_component(&self, ensemble: &Ensemble, index: usize) -> Option<Graph> {
        let tree = ensemble.trees.get(index)?;
        let range = ensemble.leaf_range().unwrap_or((0.0, 0.0));
        let prefix = format!("tree-{}", index);
        Some(self.place(&tree.root, &tree.title, index, (0.0, 0.0), &prefix, range))
    }

    /// Grid of component trees, colored over the global leaf range.
    pub fn layout_ensemble_grid(&self, trees: &[ComponentTree], columns_per_row: usize) -> Graph {
        let _profile =
            ProfileScope::with_context("layout_grid", &[("trees", v_num(trees.len() as f64))]);
        let cols = columns_per_row.max(1);
        let range = leaf_range(trees.iter().map(|t| &t.root)).unwrap_or((0.0, 0.0));
        let (cell_width, cell_height) = self.cell_size(trees);

        let mut graph = Graph::default();
        for (i, tree) in trees.iter().enumerate() {
            let offset = ((i % cols) as f64 * cell_width, (i / cols) as f64 * cell_height);
            let prefix = format!("tree-{}", i);
            graph.extend(self.place(&tree.root, &tree.title, i, offset, &prefix, range));
        }

        log(
            Level::Debug,
            Domain::Layout,
            "grid_layout",
            obj(&[
                ("trees", v_num(trees.len() as f64)),
                ("nodes", v_num(graph.nodes.len() as f64)),
                ("edges", v_num(graph.edges.len() as f64)),
                ("cell_height", v_num(cell_height)),
            ]),
        );
        graph
    }

    pub fn layout_ensemble(&self, ensemble: &Ensemble) -> Graph {
        log(
            Level::Debug,
            Domain::Layout,
            "ensemble_layout",
            obj(&[("ensemble", v_str(&ensemble.name))]),
        );
        self.layout_ensemble_grid(&ensemble.trees, self.config.columns_per_row)
    }

    /// Cells are at least as wide as the band and tall enough for the deepest
    /// tree plus one spare row.
    fn cell_size(&self, trees: &[ComponentTree]) -> (f64, f64) {
        let cfg = &self.config;
        let width = cfg.cell_width.max(cfg.max_x - cfg.min_x);
        let deepest = trees.iter().map(|t| t.root.depth()).max().unwrap_or(0);
        let needed = (deepest + 1) as f64 * cfg.row_height;
        (width, cfg.cell_height.max(needed))
    }

    fn place(
        &self,
        root: &TreeNode,
        title: &str,
        tree_index: usize,
        offset: (f64, f64),
        id_prefix: &str,
        range: (f64, f64),
    ) -> Graph {
        let (offset_x, offset_y) = offset;
        let mut graph = Graph::default();
        let mut counter = 0usize;
        let mut stack = vec![Frame {
            node: root,
            level: 0,
            lo: self.config.min_x,
            hi: self.config.max_x,
            parent: None,
        }];

        while let Some(frame) = stack.pop() {
            let index = counter;
            counter += 1;
            let id = format!("{}-node-{}", id_prefix, index);
            let mid = (frame.lo + frame.hi) / 2.0;

            if let Some((source, branch, label)) = frame.parent {
                graph.edges.push(GraphEdge {
                    id: format!("{}->{}", source, id),
                    source,
                    target: id.clone(),
                    label,
                    branch,
                    highlighted: false,
                });
            }

            let (kind, label, color, value) = match frame.node {
                TreeNode::Leaf { value } => (
                    NodeKind::Leaf,
                    format_number(*value),
                    Some(leaf_color(*value, range)),
                    Some(*value),
                ),
                TreeNode::Decision { condition, true_branch, false_branch } => {
                    let (yes, no) = branch_labels(condition);
                    // Pushed false first so the true branch takes the next index.
                    stack.push(Frame {
                        node: false_branch.as_ref(),
                        level: frame.level + 1,
                        lo: mid,
                        hi: frame.hi,
                        parent: Some((id.clone(), false, no)),
                    });
                    stack.push(Frame {
                        node: true_branch.as_ref(),
                        level: frame.level + 1,
                        lo: frame.lo,
                        hi: mid,
                        parent: Some((id.clone(), true, yes)),
                    });
                    let kind = if index == 0 { NodeKind::Root } else { NodeKind::Decision };
                    (kind, node_label(condition), None, None)
                }
            };

            graph.nodes.push(GraphNode {
                id,
                kind,
                label,
                x: mid + offset_x,
                y: frame.level as f64 * self.config.row_height + offset_y,
                index,
                tree_index,
                tree_title: if index == 0 { Some(title.to_string()) } else { None },
                color,
                value,
                highlighted: false,
            });
        }
        graph
    }
}

/// Mark the nodes and edges a claim's trace passed through.
pub fn highlight_trace(graph: &mut Graph, trace: &TraceResult) {
    let on_path: HashSet<(usize, usize)> = trace
        .paths
        .iter()
        .flat_map(|p| p.node_path.iter().map(move |&n| (p.tree_index, n)))
        .collect();

    let mut ids = HashSet::new();
    for node in &mut graph.nodes {
        node.highlighted = on_path.contains(&(node.tree_index, node.index));
        if node.highlighted {
            ids.insert(node.id.clone());
        }
    }
    for edge in &mut graph.edges {
        edge.highlighted = ids.contains(&edge.source) && ids.contains(&edge.target);
    }
}
