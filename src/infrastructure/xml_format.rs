// XML pretty printer for the document viewer download
use crate::domain::document::{Document, NodeId, NodeKind};
use crate::infrastructure::xml_parser::parse_xml;

const INDENT: &str = "  ";

enum Visit {
    Enter(NodeId, usize),
    Leave(NodeId, usize),
}

/// Re-indent `raw` two spaces per level, one node per line. Text is
/// trimmed, childless elements self-close. Text that does not parse is
/// returned unchanged.
pub fn prettify(raw: &str) -> String {
    match parse_xml(raw.trim()) {
        Ok(doc) => render(&doc),
        Err(e) => {
            tracing::debug!(error = %e, "Not well-formed, showing raw XML");
            raw.to_string()
        }
    }
}

fn render(doc: &Document) -> String {
    let mut out = String::new();
    let mut stack: Vec<Visit> = doc
        .children(Document::ROOT)
        .iter()
        .rev()
        .map(|child| Visit::Enter(*child, 0))
        .collect();

    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(id, level) => match &doc.node(id).kind {
                NodeKind::Text(text) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        line(&mut out, level, &html_escape::encode_text(text));
                    }
                }
                NodeKind::Element { name, attributes } => {
                    let mut tag = format!("<{name}");
                    for (key, value) in attributes {
                        tag.push_str(&format!(" {key}=\"{}\"", html_escape::encode_double_quoted_attribute(value)));
                    }
                    let children = doc.children(id);
                    if children.is_empty() {
                        tag.push_str(" />");
                        line(&mut out, level, &tag);
                        continue;
                    }
                    tag.push('>');
                    line(&mut out, level, &tag);
                    stack.push(Visit::Leave(id, level));
                    stack.extend(children.iter().rev().map(|child| Visit::Enter(*child, level + 1)));
                }
                NodeKind::Document => {}
            },
            Visit::Leave(id, level) => {
                line(&mut out, level, &format!("</{}>", doc.name(id).unwrap_or_default()));
            }
        }
    }
    out.trim_end().to_string()
}

fn line(out: &mut String, level: usize, content: &str) {
    out.push_str(&INDENT.repeat(level));
    out.push_str(content);
    out.push('\n');
}

/// Download name for a viewer title: whitespace runs become `_`, lowercase,
/// `document` when blank.
pub fn viewer_filename(title: Option<&str>) -> String {
    let words: Vec<&str> = title.unwrap_or_default().split_whitespace().collect();
    let stem = if words.is_empty() {
        "document".to_string()
    } else {
        words.join("_").to_lowercase()
    };
    format!("{stem}.xml")
}
