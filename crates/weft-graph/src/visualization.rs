use crate::node::NodeId;
use crate::router::{Route, Target, EDGES, ENTRY};

const START: &str = "__start__";
const END: &str = "__end__";

fn target_name(target: &Target) -> &'static str {
    match target {
        Target::Node(id) => id.as_str(),
        Target::End => END,
    }
}

fn route_label(route: &Route) -> &'static str {
    match route {
        Route::Tools => "tools",
        Route::Agent => "agent",
        Route::End => "end",
    }
}

/// Nodes with a single outgoing edge are drawn with a solid arrow, decision
/// points with labelled dashed arrows.
fn is_conditional(source: NodeId) -> bool {
    EDGES.iter().filter(|(s, _, _)| *s == source).count() > 1
}

/// Render the graph as a Mermaid flowchart string.
pub fn draw_mermaid() -> String {
    let mut lines = vec!["graph TD".to_string()];

    lines.push(format!("    {START}([\"{START}\"])"));
    for node in NodeId::ALL {
        lines.push(format!("    {node}[\"{node}\"]"));
    }
    lines.push(format!("    {END}([\"{END}\"])"));

    lines.push(format!("    {START} --> {ENTRY}"));
    for (source, route, target) in EDGES.iter() {
        let target = target_name(target);
        if is_conditional(*source) {
            lines.push(format!(
                "    {source} -.-> |{}| {target}",
                route_label(route)
            ));
        } else {
            lines.push(format!("    {source} --> {target}"));
        }
    }

    lines.join("\n")
}

/// Render the graph as a simple ASCII text summary.
pub fn draw_ascii() -> String {
    let mut lines = vec!["Graph:".to_string()];

    let names: Vec<&str> = NodeId::ALL.iter().map(|n| n.as_str()).collect();
    lines.push(format!("  Nodes: {}", names.join(", ")));
    lines.push(format!("  Entry: {START} -> {ENTRY}"));
    lines.push("  Edges:".to_string());

    for (source, route, target) in EDGES.iter() {
        let target = target_name(target);
        if is_conditional(*source) {
            lines.push(format!(
                "    {source} -> {target} [{}]",
                route_label(route)
            ));
        } else {
            lines.push(format!("    {source} -> {target}"));
        }
    }

    lines.join("\n")
}
