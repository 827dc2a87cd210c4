//! Graph resolution: reference validation, cycle detection, type inference.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::data_type::DataType;
use crate::error::{Error, Result};
use crate::graph::{is_standard_domain, ArgId, AttributeValue, Graph, Node, NodeIndex, TypeInfo};
use crate::shape::Shape;

pub(super) fn resolve(graph: &mut Graph, outer_scope: &HashSet<String>) -> Result<Vec<NodeIndex>> {
    let producers = collect_producers(graph)?;
    check_references(graph, &producers, outer_scope)?;
    check_domains(graph)?;
    let order = topological_sort(graph, &producers)?;
    resolve_subgraphs(graph, outer_scope)?;
    infer_types(graph, &order)?;
    Ok(order)
}

fn integrity(graph: &Graph, message: String) -> Error {
    Error::graph_integrity(format!("graph '{}': {message}", graph.name))
}

fn collect_producers(graph: &Graph) -> Result<HashMap<ArgId, NodeIndex>> {
    let mut producers = HashMap::new();
    for (index, node) in graph.nodes() {
        for &output in &node.outputs {
            let name = graph.arg_name(output);
            if graph.is_graph_input(output) || graph.is_initializer(output) {
                return Err(integrity(
                    graph,
                    format!("node '{}' output '{name}' shadows a graph input or initializer", node.name),
                ));
            }
            if let Some(previous) = producers.insert(output, index) {
                let previous = graph.node(previous).map_or("?", |n| n.name.as_str());
                return Err(integrity(
                    graph,
                    format!("value '{name}' is produced by both '{previous}' and '{}'", node.name),
                ));
            }
        }
    }
    Ok(producers)
}

fn check_references(
    graph: &Graph,
    producers: &HashMap<ArgId, NodeIndex>,
    outer_scope: &HashSet<String>,
) -> Result<()> {
    let defined = |arg: ArgId| {
        producers.contains_key(&arg)
            || graph.is_graph_input(arg)
            || graph.is_initializer(arg)
            || outer_scope.contains(graph.arg_name(arg))
    };

    for (_, node) in graph.nodes() {
        if let Some(missing) = node.inputs.iter().copied().find(|arg| !defined(*arg)) {
            return Err(integrity(
                graph,
                format!(
                    "node '{}' reads '{}' which no node, input or initializer provides",
                    node.name,
                    graph.arg_name(missing)
                ),
            ));
        }
    }

    if let Some(missing) = graph.outputs().iter().copied().find(|arg| !defined(*arg)) {
        return Err(integrity(
            graph,
            format!("graph output '{}' is never produced", graph.arg_name(missing)),
        ));
    }
    Ok(())
}

fn check_domains(graph: &Graph) -> Result<()> {
    let imports = graph.opset_imports();
    if imports.is_empty() {
        return Ok(());
    }
    let standard_imported = imports.keys().any(|domain| is_standard_domain(domain));
    for (_, node) in graph.nodes() {
        let declared = if is_standard_domain(&node.domain) {
            standard_imported
        } else {
            imports.contains_key(&node.domain)
        };
        if !declared {
            return Err(integrity(
                graph,
                format!("node '{}' uses undeclared domain '{}'", node.name, node.domain),
            ));
        }
    }
    Ok(())
}

/// Kahn's algorithm, smallest ready index first so the order is deterministic.
fn topological_sort(graph: &Graph, producers: &HashMap<ArgId, NodeIndex>) -> Result<Vec<NodeIndex>> {
    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    let mut successors: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();

    for (index, node) in graph.nodes() {
        let upstream: BTreeSet<NodeIndex> = node.inputs.iter().filter_map(|arg| producers.get(arg).copied()).collect();
        in_degree.insert(index, upstream.len());
        for producer in upstream {
            successors.entry(producer).or_default().push(index);
        }
    }

    let mut ready: BTreeSet<NodeIndex> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| *index)
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(index) = ready.pop_first() {
        order.push(index);
        for successor in successors.get(&index).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*successor);
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        let placed: HashSet<NodeIndex> = order.iter().copied().collect();
        let mut stuck: Vec<&str> = graph
            .nodes()
            .filter(|(index, _)| !placed.contains(index))
            .map(|(_, node)| node.name.as_str())
            .collect();
        stuck.sort_unstable();
        return Err(integrity(graph, format!("cycle detected among nodes {stuck:?}")));
    }
    Ok(order)
}

fn resolve_subgraphs(graph: &mut Graph, outer_scope: &HashSet<String>) -> Result<()> {
    let has_subgraphs = graph.nodes().any(|(_, node)| node.has_subgraph());
    if !has_subgraphs {
        return Ok(());
    }

    let mut visible: HashSet<String> = outer_scope.clone();
    visible.extend(graph.args.iter().map(|arg| arg.name.clone()));

    let parent = graph.name.clone();
    for node in graph.nodes.iter_mut().flatten() {
        for (attr, value) in node.attributes.iter_mut() {
            if let AttributeValue::Graph(body) = value {
                body.resolve_with_outer_scope(&visible).map_err(|err| {
                    Error::graph_integrity(format!(
                        "graph '{parent}': sub-graph '{attr}' of node '{}' failed to resolve: {err}",
                        node.name
                    ))
                })?;
            }
        }
    }
    Ok(())
}

fn infer_types(graph: &mut Graph, order: &[NodeIndex]) -> Result<()> {
    let initializer_types: Vec<(ArgId, TypeInfo)> = graph
        .initializers
        .iter()
        .filter_map(|(name, tensor)| {
            graph
                .arg_id(name)
                .map(|id| (id, TypeInfo::new(tensor.dtype(), tensor.shape().clone())))
        })
        .collect();

    for (id, actual) in initializer_types {
        if let Some(declared) = graph.arg(id).dtype() {
            if declared != actual.dtype {
                return Err(integrity(
                    graph,
                    format!(
                        "initializer '{}' holds {} but is declared {declared}",
                        graph.arg_name(id),
                        actual.dtype
                    ),
                ));
            }
        }
        graph.args[id.index()].type_info = Some(actual);
    }

    for &index in order {
        let Some(node) = graph.node(index) else {
            continue;
        };
        let input_types: Vec<Option<TypeInfo>> =
            node.inputs.iter().map(|arg| graph.arg(*arg).type_info.clone()).collect();
        let inferred = infer_output_types(node, &input_types).map_err(|message| {
            integrity(graph, format!("node '{}' ({}): {message}", node.name, node.op_type))
        })?;

        let outputs = node.outputs.clone();
        let node_name = node.name.clone();
        for (arg, inferred) in outputs.into_iter().zip(inferred) {
            let Some(inferred) = inferred else {
                continue;
            };
            let declared_dtype = match graph.args[arg.index()].type_info.as_mut() {
                Some(declared) if declared.dtype != inferred.dtype => Some(declared.dtype),
                Some(declared) => {
                    if inferred.shape.is_some() {
                        declared.shape = inferred.shape;
                    }
                    None
                }
                None => {
                    graph.args[arg.index()].type_info = Some(inferred.clone());
                    None
                }
            };
            if let Some(declared) = declared_dtype {
                let message = format!(
                    "node '{node_name}' produces {} for '{}' declared as {declared}",
                    inferred.dtype,
                    graph.arg_name(arg)
                );
                return Err(integrity(graph, message));
            }
        }
    }
    Ok(())
}

/// Static output types of `node` given its input types.
///
/// Returns one entry per output (`None` where nothing can be inferred), or a
/// message describing why the inputs are inconsistent. Unknown operators
/// infer nothing.
pub fn infer_output_types(
    node: &Node,
    inputs: &[Option<TypeInfo>],
) -> std::result::Result<Vec<Option<TypeInfo>>, String> {
    let mut outputs = vec![None; node.outputs.len()];
    let Some(first) = outputs.first_mut() else {
        return Ok(outputs);
    };

    match node.op_type.as_str() {
        "Add" | "Sub" | "Mul" | "Div" | "Pow" => {
            if inputs.len() != 2 {
                return Err(format!("expects 2 inputs, got {}", inputs.len()));
            }
            if let (Some(lhs), Some(rhs)) = (&inputs[0], &inputs[1]) {
                if lhs.dtype != rhs.dtype {
                    return Err(format!("input types differ: {} vs {}", lhs.dtype, rhs.dtype));
                }
                let shape = match (&lhs.shape, &rhs.shape) {
                    (Some(l), Some(r)) => Some(Shape::broadcast(l, r).map_err(|e| e.to_string())?),
                    _ => None,
                };
                *first = Some(TypeInfo {
                    dtype: lhs.dtype,
                    shape,
                });
            }
        }
        "Neg" | "Abs" | "Relu" | "Sqrt" | "Exp" | "Identity" | "BatchNormalization" => {
            if let Some(Some(input)) = inputs.first() {
                *first = Some(input.clone());
            }
        }
        "Constant" => {
            if let Some(tensor) = node.attribute("value").and_then(AttributeValue::as_tensor) {
                *first = Some(TypeInfo::new(tensor.dtype(), tensor.shape().clone()));
            }
        }
        "RandomUniform" | "RandomNormal" => {
            let dtype = dtype_attribute(node)?.unwrap_or(DataType::F32);
            let shape = node
                .attribute("shape")
                .and_then(AttributeValue::as_ints)
                .map(|dims| dims.iter().map(|d| (*d).max(0) as usize).collect::<Vec<_>>())
                .map(Shape::from);
            *first = Some(TypeInfo { dtype, shape });
        }
        "RandomUniformLike" | "RandomNormalLike" => {
            if let Some(Some(input)) = inputs.first() {
                let dtype = dtype_attribute(node)?.unwrap_or(input.dtype);
                *first = Some(TypeInfo {
                    dtype,
                    shape: input.shape.clone(),
                });
            }
        }
        _ => {}
    }
    Ok(outputs)
}

fn dtype_attribute(node: &Node) -> std::result::Result<Option<DataType>, String> {
    match node.attribute("dtype").and_then(AttributeValue::as_int) {
        None => Ok(None),
        Some(code) => DataType::from_onnx(code)
            .map(Some)
            .ok_or_else(|| format!("unsupported dtype code {code}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeDef;
    use crate::tensor::Tensor;

    #[test]
    fn test_topological_order_follows_dependencies() {
        let mut graph = Graph::new("chain");
        graph.add_input("x", TypeInfo::new(DataType::F32, [4]));
        // inserted out of order on purpose
        graph.add_node(NodeDef::new("Relu").name("second").inputs(["h"]).outputs(["y"]));
        graph.add_node(NodeDef::new("Neg").name("first").inputs(["x"]).outputs(["h"]));
        graph.add_output("y");
        graph.resolve().unwrap();

        let names: Vec<&str> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|i| graph.node(*i).unwrap().name.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(graph.arg(graph.arg_id("y").unwrap()).type_info, Some(TypeInfo::new(DataType::F32, [4])));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = Graph::new("cyclic");
        graph.add_node(NodeDef::new("Neg").name("a").inputs(["q"]).outputs(["p"]));
        graph.add_node(NodeDef::new("Neg").name("b").inputs(["p"]).outputs(["q"]));
        graph.add_output("q");
        let err = graph.resolve().unwrap_err();
        assert!(err.is_graph_integrity());
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_dangling_input_is_rejected() {
        let mut graph = Graph::new("dangling");
        graph.add_node(NodeDef::new("Relu").inputs(["nowhere"]).outputs(["y"]));
        graph.add_output("y");
        let err = graph.resolve().unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_duplicate_producer_is_rejected() {
        let mut graph = Graph::new("dup");
        graph.add_input("x", TypeInfo::of(DataType::F32));
        graph.add_node(NodeDef::new("Relu").name("r1").inputs(["x"]).outputs(["y"]));
        graph.add_node(NodeDef::new("Neg").name("r2").inputs(["x"]).outputs(["y"]));
        graph.add_output("y");
        let err = graph.resolve().unwrap_err();
        assert!(err.to_string().contains("produced by both"));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let mut graph = Graph::new("types");
        graph.add_input("a", TypeInfo::of(DataType::F32));
        graph.add_initializer("b", Tensor::scalar(1i64).unwrap());
        graph.add_node(NodeDef::new("Add").inputs(["a", "b"]).outputs(["y"]));
        graph.add_output("y");
        let err = graph.resolve().unwrap_err();
        assert!(err.to_string().contains("input types differ"));
    }

    #[test]
    fn test_missing_graph_output_is_rejected() {
        let mut graph = Graph::new("outputs");
        graph.add_output("ghost");
        assert!(graph.resolve().unwrap_err().is_graph_integrity());
    }

    #[test]
    fn test_undeclared_domain_is_rejected() {
        let mut graph = Graph::new("domains");
        graph.add_opset_import("", 17);
        graph.add_input("x", TypeInfo::of(DataType::F32));
        graph.add_node(NodeDef::new("Fancy").domain("com.example").inputs(["x"]).outputs(["y"]));
        graph.add_output("y");
        assert!(graph.resolve().unwrap_err().to_string().contains("com.example"));

        graph.add_opset_import("com.example", 1);
        graph.resolve().unwrap();
    }

    #[test]
    fn test_subgraph_sees_outer_scope() {
        let mut body = Graph::new("body");
        body.add_node(NodeDef::new("Neg").inputs(["outer"]).outputs(["inner"]));
        body.add_output("inner");

        let mut graph = Graph::new("parent");
        graph.add_input("outer", TypeInfo::of(DataType::F32));
        graph.add_input("cond", TypeInfo::of(DataType::Bool));
        graph.add_node(
            NodeDef::new("If")
                .inputs(["cond"])
                .outputs(["out"])
                .attr("then_branch", body),
        );
        graph.add_output("out");
        graph.resolve().unwrap();

        let mut orphan = Graph::new("orphan");
        orphan.add_node(NodeDef::new("Neg").inputs(["outer"]).outputs(["inner"]));
        orphan.add_output("inner");
        assert!(orphan.resolve().is_err());
    }

    #[test]
    fn test_broadcast_shape_inference() {
        let node = Node {
            name: "add".into(),
            op_type: "Add".into(),
            domain: String::new(),
            inputs: vec![ArgId::new(0), ArgId::new(1)],
            outputs: vec![ArgId::new(2)],
            attributes: Default::default(),
            provider: None,
        };
        let inferred = infer_output_types(
            &node,
            &[
                Some(TypeInfo::new(DataType::F32, [2, 3])),
                Some(TypeInfo::new(DataType::F32, [3])),
            ],
        )
        .unwrap();
        assert_eq!(inferred, vec![Some(TypeInfo::new(DataType::F32, [2, 3]))]);
    }
}
