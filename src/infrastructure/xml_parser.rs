// XML text -> Document tree, built on quick-xml's pull reader
use crate::domain::document::{Document, NodeId, NodeKind};
use crate::domain::error::ParseError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Parse `text` into a complete [`Document`].
///
/// Either the whole tree is returned or a [`ParseError`]; never a partial
/// tree. Whitespace-only text between elements is dropped, comments,
/// processing instructions and the prolog are skipped.
pub fn parse_xml(text: &str) -> Result<Document, ParseError> {
    parse(text, false)
}

/// Like [`parse_xml`] but keeps whitespace-only text inside elements.
/// Stylesheets need it: `<xsl:text> </xsl:text>` is significant.
pub fn parse_template(text: &str) -> Result<Document, ParseError> {
    parse(text, true)
}

fn parse(text: &str, keep_whitespace: bool) -> Result<Document, ParseError> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(false);

    let mut doc = Document::new();
    let mut open: Vec<(NodeId, String)> = Vec::new();
    let mut has_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| error_at(text, reader.buffer_position(), e.to_string()))?;
        let position = reader.buffer_position();
        let fail = |message: String| error_at(text, position, message);

        match event {
            Event::Start(start) => {
                let (id, name) = open_element(&mut doc, &open, &start, &mut has_root).map_err(fail)?;
                open.push((id, name));
            }
            Event::Empty(start) => {
                open_element(&mut doc, &open, &start, &mut has_root).map_err(fail)?;
            }
            Event::End(end) => {
                let name = decode(end.name().as_ref()).map_err(fail)?;
                match open.pop() {
                    Some((_, expected)) if expected == name => {}
                    Some((_, expected)) => {
                        return Err(fail(format!("expected </{expected}> but found </{name}>")));
                    }
                    None => return Err(fail(format!("unexpected closing tag </{name}>"))),
                }
            }
            Event::Text(content) => {
                let content = content.unescape().map_err(|e| fail(e.to_string()))?;
                if content.trim().is_empty() && (!keep_whitespace || open.is_empty()) {
                    continue;
                }
                let (parent, _) = open
                    .last()
                    .ok_or_else(|| fail("text outside of the root element".to_string()))?;
                doc.append(*parent, NodeKind::Text(content.into_owned()));
            }
            Event::CData(data) => {
                let content = decode(&data.into_inner()).map_err(fail)?;
                let (parent, _) = open
                    .last()
                    .ok_or_else(|| fail("CDATA outside of the root element".to_string()))?;
                doc.append(*parent, NodeKind::Text(content));
            }
            Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    if let Some((_, name)) = open.last() {
        return Err(error_at(text, text.len(), format!("unclosed element <{name}>")));
    }
    if !has_root {
        return Err(error_at(text, text.len(), "document has no root element".to_string()));
    }
    Ok(doc)
}

fn open_element(
    doc: &mut Document,
    open: &[(NodeId, String)],
    start: &BytesStart,
    has_root: &mut bool,
) -> Result<(NodeId, String), String> {
    let name = decode(start.name().as_ref())?;
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| e.to_string())?;
        let key = decode(attribute.key.as_ref())?;
        let value = attribute.unescape_value().map_err(|e| e.to_string())?;
        attributes.push((key, value.into_owned()));
    }

    let parent = match open.last() {
        Some((id, _)) => *id,
        None if *has_root => return Err(format!("second root element <{name}>")),
        None => {
            *has_root = true;
            Document::ROOT
        }
    };
    let id = doc.append(
        parent,
        NodeKind::Element {
            name: name.clone(),
            attributes,
        },
    );
    Ok((id, name))
}

fn decode(bytes: &[u8]) -> Result<String, String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())
}

fn error_at(text: &str, position: usize, message: String) -> ParseError {
    let consumed = &text.as_bytes()[..position.min(text.len())];
    let line = consumed.iter().filter(|b| **b == b'\n').count() + 1;
    let column = consumed.iter().rev().take_while(|b| **b != b'\n').count() + 1;
    ParseError {
        line,
        column,
        message,
    }
}
