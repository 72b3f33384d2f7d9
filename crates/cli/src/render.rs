use repoqa_core::index::ScoredNode;
use repoqa_core::query::Response;
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Serialize)]
pub struct Source<'a> {
    pub doc_id: &'a str,
    pub url: Option<&'a str>,
    pub score: f32,
}

fn source(node: &ScoredNode) -> Source<'_> {
    Source {
        doc_id: &node.node.doc_id,
        url: node.node.metadata.get("url").map(String::as_str),
        score: node.score,
    }
}

/// Answer followed by the numbered list of cited files.
pub fn text(resp: &Response) -> String {
    let mut out = resp.answer.trim_end().to_string();
    if !resp.source_nodes.is_empty() {
        out.push_str("\n\nSources:");
        for (i, node) in resp.source_nodes.iter().enumerate() {
            let s = source(node);
            let _ = write!(out, "\n  [{}] {} (score {:.3})", i + 1, s.doc_id, s.score);
            if let Some(url) = s.url {
                let _ = write!(out, " {}", url);
            }
        }
    }
    if let Some(trace) = &resp.trace {
        let _ = write!(
            out,
            "\n\nTrace: {} nodes retrieved, {} model calls",
            trace.retrieved.len(),
            trace.prompts.len()
        );
    }
    out
}

pub fn json(resp: &Response) -> serde_json::Value {
    let sources: Vec<Source<'_>> = resp.source_nodes.iter().map(source).collect();
    let mut value = serde_json::json!({
        "answer": resp.answer,
        "sources": sources,
    });
    if let (Some(trace), Some(obj)) = (&resp.trace, value.as_object_mut()) {
        obj.insert(
            "trace".into(),
            serde_json::to_value(trace).unwrap_or(serde_json::Value::Null),
        );
    }
    value
}
