use crate::{END, START};

/// Renders a graph as Mermaid flowchart source. Unconditional edges are
/// solid arrows; conditional edges are dashed and labeled with their routing
/// key. Output is deterministic given the same topology.
pub(crate) fn mermaid(
    name: &str,
    node_order: &[String],
    edges: &[(String, String)],
    mut conditional: Vec<(&str, &Vec<(String, String)>)>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("---\ntitle: {name}\n---\n"));
    out.push_str("flowchart TD\n");
    out.push_str(&format!("    {}([start])\n", ident(START)));
    out.push_str(&format!("    {}([end])\n", ident(END)));

    for node in node_order {
        out.push_str(&format!("    {}[{node}]\n", ident(node)));
    }

    for (from, to) in edges {
        out.push_str(&format!("    {} --> {}\n", ident(from), ident(to)));
    }

    conditional.sort_by(|a, b| a.0.cmp(b.0));
    for (from, mapping) in conditional {
        for (label, dest) in mapping {
            out.push_str(&format!(
                "    {} -. {label} .-> {}\n",
                ident(from),
                ident(dest)
            ));
        }
    }

    out
}

fn ident(name: &str) -> String {
    match name {
        START => "start".to_string(),
        END => "finish".to_string(),
        other => other.replace(|c: char| !c.is_ascii_alphanumeric(), "_"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_edges_and_conditionals() {
        let nodes = vec!["fetch".to_string(), "answer".to_string()];
        let edges = vec![
            (START.to_string(), "fetch".to_string()),
            ("answer".to_string(), END.to_string()),
        ];
        let mapping = vec![
            ("go".to_string(), "answer".to_string()),
            ("stop".to_string(), END.to_string()),
        ];
        let conditional = vec![("fetch", &mapping)];

        let source = mermaid("retrieval", &nodes, &edges, conditional);

        assert!(source.contains("title: retrieval"));
        assert!(source.contains("start --> fetch"));
        assert!(source.contains("fetch -. go .-> answer"));
        assert!(source.contains("fetch -. stop .-> finish"));
    }
}
