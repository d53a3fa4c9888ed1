//! GraphViz rendering of how tags spread through a module, for debugging the classification.

use crate::ir::{Module, ValueId};
use crate::propagation::{Classification, Rule, TagEvent};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Node {
    /// Tags with no originating value: static types, annotations and patches
    Seed,
    Value(ValueId),
}

type Edge = (Node, Node, String);

fn rule_text(m: &Module, rule: &Rule) -> String {
    match rule {
        Rule::Field { struct_ty, field } => format!("field {}.{}", m.types.name(*struct_ty), field),
        Rule::Patch(p) => format!("patch {}", p),
        r => format!("{:?}", r).to_lowercase(),
    }
}

fn edge_of(m: &Module, e: &TagEvent) -> Edge {
    let from = e.from.map_or(Node::Seed, Node::Value);
    (
        from,
        Node::Value(e.value),
        format!("{:?} by {} (round {})", e.tag, rule_text(m, &e.rule), e.round),
    )
}

impl Classification {
    /// Write a `.dot` graph with one edge per tag insertion, from the value that caused it
    pub fn write_dot<W: std::io::Write>(&self, m: &Module, w: &mut W) -> std::io::Result<()> {
        struct Graph<'a> {
            m: &'a Module,
            c: &'a Classification,
        }

        impl<'a> Graph<'a> {
            fn nodes_and_edges(&self) -> (Vec<Node>, Vec<Edge>) {
                let edges: Vec<Edge> = self.c.events().iter().map(|e| edge_of(self.m, e)).collect();
                let nodes: std::collections::BTreeSet<Node> =
                    edges.iter().flat_map(|e| [e.0, e.1]).collect();
                (nodes.into_iter().collect(), edges)
            }
        }

        impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("Tags").unwrap()
            }
            fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
                dot::Id::new(match n {
                    Node::Seed => "seed".to_string(),
                    Node::Value(v) => format!("v{}", v.index()),
                })
                .unwrap()
            }
            fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
                match n {
                    Node::Seed => dot::LabelText::label("static"),
                    Node::Value(v) => {
                        let mut text = self.m.value_text(*v);
                        if let Some(i) = self.m.producer(*v) {
                            if self.m.inst(i).block.is_some() {
                                let f = self.m.parent_function(i);
                                text = format!("{} in @{}", text, self.m.function(f).name);
                            }
                        }
                        dot::LabelText::label(text)
                    }
                }
            }
            fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
                match n {
                    Node::Seed => Some(dot::LabelText::label("note")),
                    Node::Value(_) => None,
                }
            }
            fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
                dot::LabelText::label(e.2.clone())
            }
        }

        impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, Node> {
                self.nodes_and_edges().0.into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.nodes_and_edges().1.into()
            }
            fn source(&self, e: &Edge) -> Node {
                e.0
            }
            fn target(&self, e: &Edge) -> Node {
                e.1
            }
        }

        dot::render(&Graph { m, c: self }, w)
    }

    /// Generate a `.dot` file of the tag provenance
    pub fn generate_dot(&self, m: &Module) -> String {
        let mut s: Vec<u8> = vec![];
        self.write_dot(m, &mut s).unwrap();
        String::from_utf8(s).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse_module;
    use crate::propagation::classify;
    use crate::tests::{callback_annotations, CALLBACK_THROUGH_VOID_POINTER};

    #[test]
    fn every_tagged_value_is_drawn() {
        let m = parse_module(CALLBACK_THROUGH_VOID_POINTER).unwrap();
        let c = classify(&m, &callback_annotations(), &Default::default());
        let dot = c.generate_dot(&m);
        assert!(dot.starts_with("digraph Tags {"));
        assert!(dot.contains("seed"));
        for v in c.fp_values().chain(c.fpp_values()) {
            assert!(dot.contains(&format!("v{}", v.index())), "{}", dot);
        }
    }
}
