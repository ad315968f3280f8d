//! Dependency resolution: reference extraction, graph construction,
//! topological ordering, cycle detection, and diagram emission.
//!
//! Dependencies are inferred by scanning each step's expressions for
//! `${…}` references rather than requiring an explicit `depends_on` list.

use std::collections::{HashMap, HashSet};

use flowcraft_core::error::DependencyError;
use flowcraft_core::model::{Flow, Step, StepKind, StepType, TransformOp};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;

use crate::path;

/// Names never treated as step dependencies: the reserved scope bindings
///.
fn reserved_names() -> HashSet<&'static str> {
    ["context", "metadata", "item", "acc", "a", "b"].into_iter().collect()
}

/// One node in the rendered dependency graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub name: String,
    pub step_type: StepType,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index_of: HashMap<String, NodeIndex>,
    step_types: HashMap<String, StepType>,
    dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph for `flow`, validating that every extracted
    /// reference resolves to a step in the same flow.
    pub fn build(flow: &Flow) -> Result<Self, DependencyError> {
        let available: Vec<String> = flow.step_names();
        let available_set: HashSet<&str> = available.iter().map(String::as_str).collect();

        let mut graph = DiGraph::new();
        let mut index_of = HashMap::new();
        let mut step_types = HashMap::new();
        let mut dependencies = HashMap::new();

        for step in &flow.steps {
            let idx = graph.add_node(step.name.clone());
            index_of.insert(step.name.clone(), idx);
            step_types.insert(step.name.clone(), step.step_type());
        }

        for step in &flow.steps {
            let mut deps = HashSet::new();
            let mut skip = reserved_names();
            extract_from_step(step, &mut skip, &mut deps);

            let mut sorted: Vec<String> = deps.into_iter().collect();
            sorted.sort();

            for dep in &sorted {
                if !available_set.contains(dep.as_str()) {
                    return Err(DependencyError::UnknownDependency {
                        dependent: step.name.clone(),
                        dependency: dep.clone(),
                        available: available.clone(),
                    });
                }
                graph.add_edge(index_of[dep], index_of[&step.name], ());
            }

            dependencies.insert(step.name.clone(), sorted);
        }

        Ok(DependencyGraph {
            graph,
            index_of,
            step_types,
            dependencies,
        })
    }

    pub fn get_dependencies(&self, name: &str) -> Result<&[String], DependencyError> {
        self.dependencies
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| DependencyError::StepNotFound {
                step: name.to_string(),
                available: self.dependencies.keys().cloned().collect(),
            })
    }

    pub fn get_dependents(&self, name: &str) -> Result<Vec<String>, DependencyError> {
        let idx = *self.index_of.get(name).ok_or_else(|| DependencyError::StepNotFound {
            step: name.to_string(),
            available: self.dependencies.keys().cloned().collect(),
        })?;
        let mut dependents: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        dependents.sort();
        Ok(dependents)
    }

    /// Topological order via depth-first traversal with a gray/black
    /// marker; unknown nodes are tolerated (there are none once `build`
    /// has succeeded, but the traversal stays defensive per ).
    pub fn get_execution_order(&self) -> Result<Vec<String>, DependencyError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Gray,
            Black,
        }

        let mut marks: HashMap<NodeIndex, Mark> = HashMap::new();
        let mut order = Vec::new();
        let mut names: Vec<&String> = self.index_of.keys().collect();
        names.sort();

        fn dfs(
            node: NodeIndex,
            graph: &DiGraph<String, ()>,
            marks: &mut HashMap<NodeIndex, Mark>,
            order: &mut Vec<String>,
            path_stack: &mut Vec<String>,
        ) -> Result<(), DependencyError> {
            match marks.get(&node) {
                Some(Mark::Black) => return Ok(()),
                Some(Mark::Gray) => {
                    let name = graph[node].clone();
                    let mut cycle = path_stack.clone();
                    cycle.push(name);
                    return Err(DependencyError::CircularDependency { cycle });
                }
                None => {}
            }
            marks.insert(node, Mark::Gray);
            path_stack.push(graph[node].clone());
            let mut preds: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Incoming).collect();
            preds.sort_by_key(|n| graph[*n].clone());
            for pred in preds {
                dfs(pred, graph, marks, order, path_stack)?;
            }
            path_stack.pop();
            marks.insert(node, Mark::Black);
            order.push(graph[node].clone());
            Ok(())
        }

        let mut order_vec = Vec::new();
        for name in names {
            let idx = self.index_of[name];
            if marks.get(&idx).copied() != Some(Mark::Black) {
                dfs(idx, &self.graph, &mut marks, &mut order_vec, &mut Vec::new())?;
            }
        }
        order.extend(order_vec);
        Ok(order)
    }

    pub fn get_dependency_graph(&self) -> (Vec<GraphNode>, Vec<GraphEdge>) {
        let mut names: Vec<&String> = self.index_of.keys().collect();
        names.sort();

        let nodes = names
            .iter()
            .map(|name| GraphNode {
                name: (*name).clone(),
                step_type: self.step_types[*name],
                dependencies: self.dependencies[*name].clone(),
                dependents: self.get_dependents(name).unwrap_or_default(),
            })
            .collect();

        let mut edges = Vec::new();
        for name in &names {
            for dep in &self.dependencies[*name] {
                edges.push(GraphEdge {
                    from: dep.clone(),
                    to: (*name).clone(),
                });
            }
        }
        (nodes, edges)
    }

    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Render a Mermaid flowchart: one shape per step type plus labeled
    /// edges for dependency, loop-body, condition-branch, and delayed-inner
    /// relationships.
    pub fn mermaid(&self, flow: &Flow) -> String {
        let mut out = String::from("flowchart TD\n");
        for step in &flow.steps {
            let shape = shape_for(step.step_type());
            out.push_str(&format!("  {}{}\n", step.name, shape(&step.name)));
            out.push_str(&format!("  class {} {}\n", step.name, class_for(step.step_type())));
        }
        for (name, deps) in &self.dependencies {
            for dep in deps {
                out.push_str(&format!("  {dep} --> {name}\n"));
            }
        }
        for step in &flow.steps {
            render_nested_edges(step, &mut out);
        }
        out.push_str("  classDef request fill:#e1f5ff\n");
        out.push_str("  classDef condition fill:#fff4e1\n");
        out.push_str("  classDef loop fill:#f0e1ff\n");
        out.push_str("  classDef transform fill:#e1ffe4\n");
        out.push_str("  classDef delay fill:#ffe1e1\n");
        out.push_str("  classDef stop fill:#d9d9d9\n");
        out
    }
}

fn shape_for(step_type: StepType) -> fn(&str) -> String {
    match step_type {
        StepType::Request => |n: &str| format!("[{n}]"),
        StepType::Transform => |n: &str| format!("{{{{{n}}}}}"),
        StepType::Condition => |n: &str| format!("{{{n}}}"),
        StepType::Loop => |n: &str| format!("(({n}))"),
        StepType::Delay => |n: &str| format!("([{n}])"),
        StepType::Stop => |n: &str| format!("[[{n}]]"),
    }
}

fn class_for(step_type: StepType) -> &'static str {
    match step_type {
        StepType::Request => "request",
        StepType::Condition => "condition",
        StepType::Loop => "loop",
        StepType::Transform => "transform",
        StepType::Delay => "delay",
        StepType::Stop => "stop",
    }
}

fn render_nested_edges(step: &Step, out: &mut String) {
    match &step.kind {
        StepKind::Condition { condition } => {
            out.push_str(&format!("  {} -->|then| {}\n", step.name, condition.then.name));
            render_nested_edges(&condition.then, out);
            if let Some(else_step) = &condition.else_step {
                out.push_str(&format!("  {} -->|else| {}\n", step.name, else_step.name));
                render_nested_edges(else_step, out);
            }
        }
        StepKind::Loop { loop_ } => {
            for body_step in loop_.body() {
                out.push_str(&format!("  {} -->|loop body| {}\n", step.name, body_step.name));
                render_nested_edges(body_step, out);
            }
        }
        StepKind::Delay { delay } => {
            out.push_str(&format!("  {} -->|after delay| {}\n", step.name, delay.step.name));
            render_nested_edges(&delay.step, out);
        }
        _ => {}
    }
}

// -- Reference extraction -------------------------------------------------

fn extract_from_step(step: &Step, skip: &mut HashSet<&'static str>, out: &mut HashSet<String>) {
    extract_from_kind(&step.kind, skip, out);
}

fn extract_from_kind(kind: &StepKind, skip: &mut HashSet<&'static str>, out: &mut HashSet<String>) {
    match kind {
        StepKind::Request { request } => {
            extract_from_value(&request.params, skip, out);
        }
        StepKind::Condition { condition } => {
            extract_from_text(&condition.if_expr, skip, out);
            extract_from_step(&condition.then, skip, out);
            if let Some(else_step) = &condition.else_step {
                extract_from_step(else_step, skip, out);
            }
        }
        StepKind::Loop { loop_ } => {
            extract_from_text(&loop_.over, skip, out);
            let mut nested_skip = skip.clone();
            nested_skip.insert(leak_ident(&loop_.as_ident));
            if let Some(condition) = &loop_.condition {
                extract_from_text(condition, &mut nested_skip, out);
            }
            for body_step in loop_.body() {
                extract_from_step(body_step, &mut nested_skip, out);
            }
        }
        StepKind::Transform { transform } => {
            extract_from_value(&transform.input, skip, out);
            for op in &transform.operations {
                if let Some(using) = transform_op_using(op) {
                    extract_from_text(using, skip, out);
                }
            }
        }
        StepKind::Delay { delay } => {
            extract_from_step(&delay.step, skip, out);
        }
        StepKind::Stop { .. } => {}
    }
}

fn transform_op_using(op: &TransformOp) -> Option<&str> {
    match op {
        TransformOp::Map { using, .. }
        | TransformOp::Filter { using, .. }
        | TransformOp::Reduce { using, .. }
        | TransformOp::Sort { using, .. }
        | TransformOp::Group { using, .. }
        | TransformOp::Join { using, .. } => Some(using),
        TransformOp::Flatten { .. } | TransformOp::Unique { .. } => None,
    }
}

fn extract_from_value(value: &Value, skip: &HashSet<&'static str>, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => extract_from_text(s, skip, out),
        Value::Array(items) => {
            for item in items {
                extract_from_value(item, skip, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                extract_from_value(v, skip, out);
            }
        }
        _ => {}
    }
}

fn extract_from_text(text: &str, skip: &HashSet<&'static str>, out: &mut HashSet<String>) {
    for reference in find_reference_spans(text) {
        let inner = &reference[2..reference.len() - 1];
        if let Ok(segments) = path::parse_path(inner) {
            if let Some(path::Segment::Property(root)) = segments.first() {
                if !skip.contains(root.as_str()) {
                    out.insert(root.clone());
                }
            }
        }
    }
}

fn find_reference_spans(s: &str) -> Vec<String> {
    let bytes = s.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let start = i;
            let mut depth = 1;
            let mut j = i + 2;
            while j < bytes.len() && depth > 0 {
                match bytes[j] {
                    b'{' => depth += 1,
                    b'}' => depth -= 1,
                    _ => {}
                }
                j += 1;
            }
            if depth == 0 {
                spans.push(s[start..j].to_string());
                i = j;
                continue;
            }
        }
        i += 1;
    }
    spans
}

/// `HashSet<&'static str>` can't hold a borrowed, non-'static `String` from
/// the flow document; leak once per loop-step build so the skip set stays
/// `Copy`-friendly. Flow documents are loaded once per process lifetime, so
/// this is bounded by the number of loop steps, not by execution count.
fn leak_ident(ident: &str) -> &'static str {
    Box::leak(ident.to_string().into_boxed_str())
}
