// XSLT 1.0 subset - renders a data Document through a stylesheet Document
use crate::application::report_service::TemplateEngine;
use crate::domain::document::{Document, NodeId, NodeKind};
use crate::domain::error::TransformError;
use crate::infrastructure::xpath::{self, Context, Expr, NodeRef, NodeTest, Value, Variables};
use std::cmp::Ordering;
use std::collections::HashMap;

const XSLT_NAMESPACE: &str = "http://www.w3.org/1999/XSL/Transform";
/// Budget shared by template instantiation, instruction nesting, built-in
/// recursion over the data and deep copies.
const MAX_DEPTH: usize = 512;
/// Transforms run on their own thread so the depth budget never depends on
/// the caller's stack.
const WORKER_STACK_SIZE: usize = 32 * 1024 * 1024;
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr",
];

/// Template engine backed by a built-in interpreter for the common XSLT 1.0
/// instructions. Stateless; the stylesheet is compiled on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct XsltEngine;

impl TemplateEngine for XsltEngine {
    fn apply_template(&self, data: &Document, template: &Document) -> Result<String, TransformError> {
        std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name("xslt-transform".to_string())
                .stack_size(WORKER_STACK_SIZE)
                .spawn_scoped(scope, || transform(data, template))
                .map_err(|e| TransformError::Worker(e.to_string()))?;
            worker
                .join()
                .map_err(|_| TransformError::Worker("transform panicked".to_string()))?
        })
    }
}

fn transform(data: &Document, template: &Document) -> Result<String, TransformError> {
    let stylesheet = Stylesheet::compile(template)?;
    let mut run = Transform {
        sheet: &stylesheet,
        data,
        globals: Variables::new(),
        depth: 0,
    };
    run.execute()
}

struct Rule {
    pattern: Expr,
    priority: f64,
    mode: Option<String>,
    body: NodeId,
}

struct Stylesheet<'t> {
    doc: &'t Document,
    prefix: String,
    rules: Vec<Rule>,
    named: HashMap<String, NodeId>,
    globals: Vec<NodeId>,
    text_output: bool,
}

impl<'t> Stylesheet<'t> {
    fn compile(doc: &'t Document) -> Result<Self, TransformError> {
        let root = doc
            .root_element()
            .ok_or_else(|| TransformError::Stylesheet("template has no root element".to_string()))?;
        let prefix = doc
            .attributes(root)
            .iter()
            .find(|(key, value)| value == XSLT_NAMESPACE && (key == "xmlns" || key.starts_with("xmlns:")))
            .map(|(key, _)| key.strip_prefix("xmlns:").unwrap_or_default().to_string())
            .unwrap_or_else(|| "xsl".to_string());

        let mut sheet = Self {
            doc,
            prefix,
            rules: Vec::new(),
            named: HashMap::new(),
            globals: Vec::new(),
            text_output: false,
        };

        if !(sheet.is_xsl(root, "stylesheet") || sheet.is_xsl(root, "transform")) {
            // Literal result element used as the whole stylesheet.
            sheet.rules.push(Rule {
                pattern: xpath::compile("/")?,
                priority: 0.5,
                mode: None,
                body: Document::ROOT,
            });
            return Ok(sheet);
        }

        for child in doc.child_elements(root) {
            match sheet.xsl_name(child) {
                Some("template") => sheet.add_template(child)?,
                Some("variable" | "param") => sheet.globals.push(child),
                Some("output") => sheet.text_output = doc.attribute(child, "method") == Some("text"),
                Some(other) => tracing::debug!(instruction = other, "Ignoring top-level stylesheet element"),
                None => {}
            }
        }
        tracing::debug!(rules = sheet.rules.len(), named = sheet.named.len(), "Stylesheet compiled");
        Ok(sheet)
    }

    fn add_template(&mut self, node: NodeId) -> Result<(), TransformError> {
        if let Some(name) = self.doc.attribute(node, "name") {
            self.named.insert(name.to_string(), node);
        }
        let Some(pattern) = self.doc.attribute(node, "match") else {
            return Ok(());
        };
        let explicit = match self.doc.attribute(node, "priority") {
            Some(p) => Some(p.trim().parse::<f64>().map_err(|_| {
                TransformError::Stylesheet(format!("invalid template priority '{p}'"))
            })?),
            None => None,
        };
        let mode = self.doc.attribute(node, "mode").map(str::to_string);

        let mut alternatives = Vec::new();
        flatten_union(xpath::compile(pattern)?, &mut alternatives);
        for alternative in alternatives {
            if !matches!(alternative, Expr::Path { .. } | Expr::Filter { .. }) {
                return Err(TransformError::Stylesheet(format!("unsupported match pattern '{pattern}'")));
            }
            self.rules.push(Rule {
                priority: explicit.unwrap_or_else(|| default_priority(&alternative)),
                pattern: alternative,
                mode: mode.clone(),
                body: node,
            });
        }
        Ok(())
    }

    fn xsl_name(&self, node: NodeId) -> Option<&'t str> {
        let name = self.doc.name(node)?;
        if self.prefix.is_empty() {
            return (!name.contains(':')).then_some(name);
        }
        name.strip_prefix(self.prefix.as_str())?.strip_prefix(':')
    }

    fn is_xsl(&self, node: NodeId, local: &str) -> bool {
        self.xsl_name(node) == Some(local)
    }

    fn attr(&self, node: NodeId, name: &str) -> Option<&'t str> {
        self.doc.attribute(node, name)
    }

    fn required(&self, node: NodeId, name: &str) -> Result<&'t str, TransformError> {
        self.attr(node, name).ok_or_else(|| {
            TransformError::Stylesheet(format!(
                "<{}> requires a '{name}' attribute",
                self.doc.name(node).unwrap_or_default()
            ))
        })
    }
}

fn flatten_union(expr: Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Union(left, right) => {
            flatten_union(*left, out);
            flatten_union(*right, out);
        }
        other => out.push(other),
    }
}

fn default_priority(pattern: &Expr) -> f64 {
    match pattern {
        Expr::Path { absolute: false, steps } if steps.len() == 1 && steps[0].predicates.is_empty() => {
            match steps[0].test {
                NodeTest::Name(_) => 0.0,
                NodeTest::Wildcard | NodeTest::Text | NodeTest::AnyNode => -0.5,
            }
        }
        _ => 0.5,
    }
}

// ---------------------------------------------------------------------------
// Result tree
// ---------------------------------------------------------------------------

enum OutNode {
    Element(OutElement),
    Text(String),
    Raw(String),
}

#[derive(Default)]
struct OutElement {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<OutNode>,
}

impl OutElement {
    fn named(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    fn push_text(&mut self, text: String) {
        if !text.is_empty() {
            self.children.push(OutNode::Text(text));
        }
    }

    fn set_attribute(&mut self, name: String, value: String) {
        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some(existing) => existing.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    fn text(&self) -> String {
        let mut buf = String::new();
        collect_text(&self.children, &mut buf);
        buf
    }

    fn write(&self, buf: &mut String) {
        buf.push('<');
        buf.push_str(&self.name);
        for (key, value) in &self.attributes {
            buf.push(' ');
            buf.push_str(key);
            buf.push_str("=\"");
            buf.push_str(&html_escape::encode_double_quoted_attribute(value));
            buf.push('"');
        }
        if self.children.is_empty() && VOID_ELEMENTS.contains(&self.name.to_ascii_lowercase().as_str()) {
            buf.push_str("/>");
            return;
        }
        buf.push('>');
        write_children(&self.children, buf);
        buf.push_str("</");
        buf.push_str(&self.name);
        buf.push('>');
    }
}

fn collect_text(children: &[OutNode], buf: &mut String) {
    for child in children {
        match child {
            OutNode::Element(element) => collect_text(&element.children, buf),
            OutNode::Text(text) | OutNode::Raw(text) => buf.push_str(text),
        }
    }
}

fn write_children(children: &[OutNode], buf: &mut String) {
    for child in children {
        match child {
            OutNode::Element(element) => element.write(buf),
            OutNode::Text(text) => buf.push_str(&html_escape::encode_text(text)),
            OutNode::Raw(text) => buf.push_str(text),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Focus {
    node: NodeRef,
    position: usize,
    size: usize,
}

impl Focus {
    fn root() -> Self {
        Self {
            node: NodeRef::Node(Document::ROOT),
            position: 1,
            size: 1,
        }
    }
}

struct SortSpec<'t> {
    select: &'t str,
    numeric: bool,
    descending: bool,
}

enum SortKey {
    Number(f64),
    Text(String),
}

struct Transform<'a, 't> {
    sheet: &'a Stylesheet<'t>,
    data: &'a Document,
    globals: Variables,
    depth: usize,
}

impl<'a, 't> Transform<'a, 't> {
    fn execute(&mut self) -> Result<String, TransformError> {
        let sheet = self.sheet;
        for node in &sheet.globals {
            let name = sheet.required(*node, "name")?;
            let scope = self.globals.clone();
            let value = self.variable_value(*node, Focus::root(), &scope)?;
            self.globals.insert(name.to_string(), value);
        }

        let mut out = OutElement::default();
        self.apply_templates(vec![NodeRef::Node(Document::ROOT)], None, &Variables::new(), &mut out)?;

        if sheet.text_output {
            return Ok(out.text());
        }
        let mut buf = String::new();
        write_children(&out.children, &mut buf);
        Ok(buf)
    }

    fn eval(&self, expr: &str, focus: Focus, scope: &Variables) -> Result<Value, TransformError> {
        let compiled = xpath::compile(expr)?;
        let ctx = Context {
            doc: self.data,
            node: focus.node,
            position: focus.position,
            size: focus.size,
            variables: scope,
        };
        xpath::evaluate(&compiled, &ctx)
    }

    fn eval_nodes(&self, expr: &str, focus: Focus, scope: &Variables) -> Result<Vec<NodeRef>, TransformError> {
        self.eval(expr, focus, scope)?
            .into_nodes()
            .map_err(|message| TransformError::expression(expr, message))
    }

    /// Attribute value template: `{expr}` segments are evaluated, `{{` and
    /// `}}` are literal braces.
    fn avt(&self, template: &str, focus: Focus, scope: &Variables) -> Result<String, TransformError> {
        let mut out = String::new();
        let mut rest = template;
        while let Some(at) = rest.find(['{', '}']) {
            out.push_str(&rest[..at]);
            let brace = &rest[at..at + 1];
            let after = &rest[at + 1..];
            if let Some(tail) = after.strip_prefix(brace) {
                out.push_str(brace);
                rest = tail;
                continue;
            }
            if brace == "}" {
                return Err(TransformError::expression(template, "unbalanced '}' in attribute value"));
            }
            let end = after
                .find('}')
                .ok_or_else(|| TransformError::expression(template, "unterminated '{' in attribute value"))?;
            out.push_str(&self.eval(&after[..end], focus, scope)?.to_text(self.data));
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn parent_of(&self, node: NodeRef) -> Option<NodeId> {
        match node {
            NodeRef::Node(id) => self.data.parent(id),
            NodeRef::Attribute(owner, _) => Some(owner),
        }
    }

    /// A node matches a pattern when the pattern, evaluated from the root
    /// or from one of the node's ancestors, selects it.
    fn matches(&self, pattern: &Expr, node: NodeRef) -> Result<bool, TransformError> {
        let selects = |anchor: NodeId| -> Result<bool, TransformError> {
            let ctx = Context::new(self.data, NodeRef::Node(anchor), &self.globals);
            Ok(match xpath::evaluate(pattern, &ctx)? {
                Value::Nodes(nodes) => nodes.contains(&node),
                _ => false,
            })
        };
        if let Expr::Path { absolute: true, .. } = pattern {
            return selects(Document::ROOT);
        }
        let mut anchor = self.parent_of(node);
        while let Some(id) = anchor {
            if selects(id)? {
                return Ok(true);
            }
            anchor = self.data.parent(id);
        }
        Ok(false)
    }

    fn best_rule(&self, node: NodeRef, mode: Option<&str>) -> Result<Option<NodeId>, TransformError> {
        let mut best: Option<&Rule> = None;
        for rule in &self.sheet.rules {
            if rule.mode.as_deref() != mode {
                continue;
            }
            // Later rules win ties.
            if best.is_some_and(|b| b.priority > rule.priority) {
                continue;
            }
            if self.matches(&rule.pattern, node)? {
                best = Some(rule);
            }
        }
        Ok(best.map(|rule| rule.body))
    }

    /// Run `step` one level deeper, failing once the budget is spent.
    fn nested<T>(&mut self, step: impl FnOnce(&mut Self) -> Result<T, TransformError>) -> Result<T, TransformError> {
        if self.depth >= MAX_DEPTH {
            return Err(TransformError::DepthExceeded(MAX_DEPTH));
        }
        self.depth += 1;
        let result = step(self);
        self.depth -= 1;
        result
    }

    fn apply_templates(
        &mut self,
        nodes: Vec<NodeRef>,
        mode: Option<&str>,
        params: &Variables,
        out: &mut OutElement,
    ) -> Result<(), TransformError> {
        self.nested(|run| {
            let size = nodes.len();
            for (index, node) in nodes.into_iter().enumerate() {
                let focus = Focus {
                    node,
                    position: index + 1,
                    size,
                };
                match run.best_rule(node, mode)? {
                    Some(body) => run.instantiate(body, focus, params, out)?,
                    None => run.builtin(focus, mode, out)?,
                }
            }
            Ok(())
        })
    }

    fn builtin(&mut self, focus: Focus, mode: Option<&str>, out: &mut OutElement) -> Result<(), TransformError> {
        match focus.node {
            NodeRef::Node(id) => match &self.data.node(id).kind {
                NodeKind::Text(text) => out.push_text(text.clone()),
                NodeKind::Document | NodeKind::Element { .. } => {
                    let children = self.data.children(id).iter().map(|c| NodeRef::Node(*c)).collect();
                    self.apply_templates(children, mode, &Variables::new(), out)?;
                }
            },
            NodeRef::Attribute(..) => out.push_text(xpath::string_value(self.data, focus.node)),
        }
        Ok(())
    }

    fn instantiate(&mut self, body: NodeId, focus: Focus, params: &Variables, out: &mut OutElement) -> Result<(), TransformError> {
        let globals = self.globals.clone();
        self.nested(|run| run.execute_children(body, focus, globals, params, out))
    }

    fn execute_children(
        &mut self,
        parent: NodeId,
        focus: Focus,
        mut scope: Variables,
        params: &Variables,
        out: &mut OutElement,
    ) -> Result<(), TransformError> {
        let sheet = self.sheet;
        for &child in sheet.doc.children(parent) {
            match sheet.xsl_name(child) {
                Some("variable") => {
                    let name = sheet.required(child, "name")?;
                    let value = self.variable_value(child, focus, &scope)?;
                    scope.insert(name.to_string(), value);
                }
                Some("param") => {
                    let name = sheet.required(child, "name")?;
                    let value = match params.get(name) {
                        Some(passed) => passed.clone(),
                        None => self.variable_value(child, focus, &scope)?,
                    };
                    scope.insert(name.to_string(), value);
                }
                Some("sort" | "with-param") => {}
                _ => self.nested(|run| run.instruction(child, focus, &scope, out))?,
            }
        }
        Ok(())
    }

    fn variable_value(&mut self, node: NodeId, focus: Focus, scope: &Variables) -> Result<Value, TransformError> {
        if let Some(select) = self.sheet.attr(node, "select") {
            return self.eval(select, focus, scope);
        }
        let mut fragment = OutElement::default();
        self.execute_children(node, focus, scope.clone(), &Variables::new(), &mut fragment)?;
        Ok(Value::Str(fragment.text()))
    }

    fn with_params(&mut self, node: NodeId, focus: Focus, scope: &Variables) -> Result<Variables, TransformError> {
        let sheet = self.sheet;
        let mut params = Variables::new();
        for child in sheet.doc.child_elements(node) {
            if sheet.is_xsl(child, "with-param") {
                let name = sheet.required(child, "name")?;
                let value = self.variable_value(child, focus, scope)?;
                params.insert(name.to_string(), value);
            }
        }
        Ok(params)
    }

    fn instruction(&mut self, node: NodeId, focus: Focus, scope: &Variables, out: &mut OutElement) -> Result<(), TransformError> {
        let sheet = self.sheet;
        let doc = sheet.doc;

        let name = match &doc.node(node).kind {
            // Whitespace-only stylesheet text is layout, except inside xsl:text.
            NodeKind::Text(text) => {
                if !text.trim().is_empty() {
                    out.push_text(text.clone());
                }
                return Ok(());
            }
            NodeKind::Document => return Ok(()),
            NodeKind::Element { name, .. } => name,
        };

        let Some(instruction) = sheet.xsl_name(node) else {
            return self.literal_element(node, name, focus, scope, out);
        };

        match instruction {
            "apply-templates" => {
                let select = sheet.attr(node, "select").unwrap_or("node()");
                let nodes = self.eval_nodes(select, focus, scope)?;
                let nodes = self.sorted(node, nodes, scope)?;
                let params = self.with_params(node, focus, scope)?;
                self.apply_templates(nodes, sheet.attr(node, "mode"), &params, out)
            }
            "call-template" => {
                let target = sheet.required(node, "name")?;
                let body = *sheet
                    .named
                    .get(target)
                    .ok_or_else(|| TransformError::Stylesheet(format!("no template named '{target}'")))?;
                let params = self.with_params(node, focus, scope)?;
                self.instantiate(body, focus, &params, out)
            }
            "value-of" => {
                let select = sheet.required(node, "select")?;
                let text = self.eval(select, focus, scope)?.to_text(self.data);
                push_text(out, text, sheet.attr(node, "disable-output-escaping"));
                Ok(())
            }
            "text" => {
                push_text(out, doc.text_content(node), sheet.attr(node, "disable-output-escaping"));
                Ok(())
            }
            "for-each" => {
                let select = sheet.required(node, "select")?;
                let nodes = self.eval_nodes(select, focus, scope)?;
                let nodes = self.sorted(node, nodes, scope)?;
                let size = nodes.len();
                for (index, item) in nodes.into_iter().enumerate() {
                    let inner = Focus {
                        node: item,
                        position: index + 1,
                        size,
                    };
                    self.execute_children(node, inner, scope.clone(), &Variables::new(), out)?;
                }
                Ok(())
            }
            "if" => {
                let test = sheet.required(node, "test")?;
                if self.eval(test, focus, scope)?.to_bool() {
                    self.execute_children(node, focus, scope.clone(), &Variables::new(), out)?;
                }
                Ok(())
            }
            "choose" => {
                for branch in doc.child_elements(node) {
                    let taken = match sheet.xsl_name(branch) {
                        Some("when") => self.eval(sheet.required(branch, "test")?, focus, scope)?.to_bool(),
                        Some("otherwise") => true,
                        _ => false,
                    };
                    if taken {
                        return self.execute_children(branch, focus, scope.clone(), &Variables::new(), out);
                    }
                }
                Ok(())
            }
            "attribute" => {
                let name = self.avt(sheet.required(node, "name")?, focus, scope)?;
                let mut fragment = OutElement::default();
                self.execute_children(node, focus, scope.clone(), &Variables::new(), &mut fragment)?;
                out.set_attribute(name, fragment.text());
                Ok(())
            }
            "element" => {
                let name = self.avt(sheet.required(node, "name")?, focus, scope)?;
                let mut element = OutElement::named(name);
                self.execute_children(node, focus, scope.clone(), &Variables::new(), &mut element)?;
                out.children.push(OutNode::Element(element));
                Ok(())
            }
            "copy-of" => {
                let select = sheet.required(node, "select")?;
                match self.eval(select, focus, scope)? {
                    Value::Nodes(nodes) => {
                        for item in nodes {
                            self.copy_node(item, out, 0)?;
                        }
                    }
                    other => out.push_text(other.to_text(self.data)),
                }
                Ok(())
            }
            "copy" => match focus.node {
                NodeRef::Node(id) if self.data.is_element(id) => {
                    let mut element = OutElement::named(self.data.name(id).unwrap_or_default().to_string());
                    self.execute_children(node, focus, scope.clone(), &Variables::new(), &mut element)?;
                    out.children.push(OutNode::Element(element));
                    Ok(())
                }
                NodeRef::Node(id) if id == Document::ROOT => {
                    self.execute_children(node, focus, scope.clone(), &Variables::new(), out)
                }
                other => self.copy_node(other, out, 0),
            },
            "message" => {
                let mut fragment = OutElement::default();
                self.execute_children(node, focus, scope.clone(), &Variables::new(), &mut fragment)?;
                let message = fragment.text();
                if sheet.attr(node, "terminate") == Some("yes") {
                    return Err(TransformError::Stylesheet(format!("terminated by xsl:message: {message}")));
                }
                tracing::info!(message = %message, "Stylesheet message");
                Ok(())
            }
            "comment" | "processing-instruction" | "fallback" => Ok(()),
            other => Err(TransformError::Stylesheet(format!("unsupported instruction xsl:{other}"))),
        }
    }

    fn literal_element(
        &mut self,
        node: NodeId,
        name: &str,
        focus: Focus,
        scope: &Variables,
        out: &mut OutElement,
    ) -> Result<(), TransformError> {
        let sheet = self.sheet;
        let mut element = OutElement::named(name.to_string());
        for (key, value) in sheet.doc.attributes(node) {
            if value == XSLT_NAMESPACE || key.starts_with(&format!("{}:", sheet.prefix)) {
                continue;
            }
            element.attributes.push((key.clone(), self.avt(value, focus, scope)?));
        }
        self.execute_children(node, focus, scope.clone(), &Variables::new(), &mut element)?;
        out.children.push(OutNode::Element(element));
        Ok(())
    }

    fn copy_node(&self, node: NodeRef, out: &mut OutElement, level: usize) -> Result<(), TransformError> {
        if self.depth + level > MAX_DEPTH {
            return Err(TransformError::DepthExceeded(MAX_DEPTH));
        }
        match node {
            NodeRef::Attribute(owner, index) => {
                let (key, value) = &self.data.attributes(owner)[index];
                out.set_attribute(key.clone(), value.clone());
            }
            NodeRef::Node(id) => match &self.data.node(id).kind {
                NodeKind::Text(text) => out.push_text(text.clone()),
                NodeKind::Document => {
                    for child in self.data.children(id) {
                        self.copy_node(NodeRef::Node(*child), out, level + 1)?;
                    }
                }
                NodeKind::Element { name, attributes } => {
                    let mut element = OutElement::named(name.clone());
                    element.attributes = attributes.clone();
                    for child in self.data.children(id) {
                        self.copy_node(NodeRef::Node(*child), &mut element, level + 1)?;
                    }
                    out.children.push(OutNode::Element(element));
                }
            },
        }
        Ok(())
    }

    fn sorted(&self, instruction: NodeId, nodes: Vec<NodeRef>, scope: &Variables) -> Result<Vec<NodeRef>, TransformError> {
        let sheet = self.sheet;
        let specs: Vec<SortSpec> = sheet
            .doc
            .child_elements(instruction)
            .filter(|child| sheet.is_xsl(*child, "sort"))
            .map(|sort| SortSpec {
                select: sheet.attr(sort, "select").unwrap_or("."),
                numeric: sheet.attr(sort, "data-type") == Some("number"),
                descending: sheet.attr(sort, "order") == Some("descending"),
            })
            .collect();
        if specs.is_empty() {
            return Ok(nodes);
        }

        let size = nodes.len();
        let mut keyed = Vec::with_capacity(size);
        for (index, node) in nodes.into_iter().enumerate() {
            let focus = Focus {
                node,
                position: index + 1,
                size,
            };
            let mut keys = Vec::with_capacity(specs.len());
            for spec in &specs {
                let value = self.eval(spec.select, focus, scope)?;
                keys.push(if spec.numeric {
                    SortKey::Number(value.to_number(self.data))
                } else {
                    SortKey::Text(value.to_text(self.data))
                });
            }
            keyed.push((keys, node));
        }

        keyed.sort_by(|(a, _), (b, _)| {
            for ((x, y), spec) in a.iter().zip(b).zip(&specs) {
                let ordering = compare_keys(x, y);
                let ordering = if spec.descending { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        Ok(keyed.into_iter().map(|(_, node)| node).collect())
    }
}

/// NaN sorts before every number.
fn compare_keys(a: &SortKey, b: &SortKey) -> Ordering {
    match (a, b) {
        (SortKey::Number(x), SortKey::Number(y)) => match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        },
        (SortKey::Text(x), SortKey::Text(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn push_text(out: &mut OutElement, text: String, disable_escaping: Option<&str>) {
    if disable_escaping == Some("yes") {
        if !text.is_empty() {
            out.children.push(OutNode::Raw(text));
        }
    } else {
        out.push_text(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::xml_parser::{parse_template, parse_xml};

    const DATA: &str = r#"<Payload>
  <DeviceConfig>
    <MetaData><DeviceId>IOT-001</DeviceId><Protocol>MQTT</Protocol></MetaData>
    <Sensors>
      <SensorConfig type="Temperature"><Unit>F</Unit><Threshold>80</Threshold></SensorConfig>
      <SensorConfig type="Humidity"><Unit>%</Unit><Threshold>60</Threshold></SensorConfig>
    </Sensors>
  </DeviceConfig>
  <SensorData>
    <Reading type="Temperature"><Value>95</Value></Reading>
    <Reading type="Humidity"><Value>40</Value></Reading>
    <Reading type="Pressure"><Value>1013</Value></Reading>
  </SensorData>
</Payload>"#;

    fn render(stylesheet: &str) -> Result<String, TransformError> {
        let data = parse_xml(DATA).unwrap();
        let template = parse_template(stylesheet).unwrap();
        XsltEngine.apply_template(&data, &template)
    }

    fn sheet(body: &str) -> String {
        format!(r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">{body}</xsl:stylesheet>"#)
    }

    #[test]
    fn test_report_with_threshold_lookup() {
        let html = render(&sheet(
            r#"<xsl:template match="/">
                 <table><xsl:apply-templates select="//Reading"/></table>
               </xsl:template>
               <xsl:template match="Reading">
                 <xsl:variable name="t" select="@type"/>
                 <xsl:variable name="limit" select="//SensorConfig[@type = $t]/Threshold"/>
                 <tr class="{@type}">
                   <td><xsl:value-of select="Value"/></td>
                   <xsl:choose>
                     <xsl:when test="not($limit)"><td>n/a</td></xsl:when>
                     <xsl:when test="number(Value) &gt; number($limit)"><td>ALERT</td></xsl:when>
                     <xsl:otherwise><td>OK</td></xsl:otherwise>
                   </xsl:choose>
                 </tr>
               </xsl:template>"#,
        ))
        .unwrap();
        assert_eq!(
            html,
            "<table><tr class=\"Temperature\"><td>95</td><td>ALERT</td></tr>\
             <tr class=\"Humidity\"><td>40</td><td>OK</td></tr>\
             <tr class=\"Pressure\"><td>1013</td><td>n/a</td></tr></table>"
        );
    }

    #[test]
    fn test_builtin_rules_copy_text() {
        let html = render(&sheet(r#"<xsl:template match="Sensors"/>"#)).unwrap();
        assert_eq!(html, "IOT-001MQTT95401013");
    }

    #[test]
    fn test_sort_and_position() {
        let html = render(&sheet(
            r#"<xsl:template match="/">
                 <xsl:for-each select="//Reading">
                   <xsl:sort select="Value" data-type="number" order="descending"/>
                   <xsl:value-of select="position()"/>:<xsl:value-of select="@type"/>
                   <xsl:if test="position() != last()"><xsl:text>,</xsl:text></xsl:if>
                 </xsl:for-each>
               </xsl:template>"#,
        ))
        .unwrap();
        assert_eq!(html, "1:Pressure,2:Temperature,3:Humidity");
    }

    #[test]
    fn test_named_template_with_params() {
        let html = render(&sheet(
            r#"<xsl:template match="/">
                 <xsl:call-template name="badge">
                   <xsl:with-param name="label" select="count(//Reading)"/>
                 </xsl:call-template>
               </xsl:template>
               <xsl:template name="badge">
                 <xsl:param name="label" select="'none'"/>
                 <xsl:param name="tone">grey</xsl:param>
                 <xsl:element name="span">
                   <xsl:attribute name="data-tone"><xsl:value-of select="$tone"/></xsl:attribute>
                   <xsl:value-of select="$label"/>
                 </xsl:element>
               </xsl:template>"#,
        ))
        .unwrap();
        assert_eq!(html, "<span data-tone=\"grey\">3</span>");
    }

    #[test]
    fn test_output_is_escaped_and_void_elements_close() {
        let data = parse_xml("<Payload><Note>a &lt; b &amp; c</Note></Payload>").unwrap();
        let template = parse_template(&sheet(
            r#"<xsl:template match="/"><p><xsl:value-of select="//Note"/></p><br/><div/></xsl:template>"#,
        ))
        .unwrap();
        let html = XsltEngine.apply_template(&data, &template).unwrap();
        assert_eq!(html, "<p>a &lt; b &amp; c</p><br/><div></div>");
    }

    #[test]
    fn test_priority_and_copy_of() {
        let html = render(&sheet(
            r#"<xsl:template match="/"><xsl:apply-templates select="//Reading"/></xsl:template>
               <xsl:template match="Reading"><x/></xsl:template>
               <xsl:template match="Reading[@type='Humidity']"><xsl:copy-of select="Value"/></xsl:template>"#,
        ))
        .unwrap();
        assert_eq!(html, "<x></x><Value>40</Value><x></x>");
    }

    #[test]
    fn test_simplified_stylesheet_and_custom_prefix() {
        let html = render(
            r#"<html xmlns:t="http://www.w3.org/1999/XSL/Transform"><b><t:value-of select="count(//SensorConfig)"/></b></html>"#,
        )
        .unwrap();
        assert_eq!(html, "<html><b>2</b></html>");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            render(&sheet(r#"<xsl:template match="/"><xsl:value-of select="//["/></xsl:template>"#)),
            Err(TransformError::Expression { .. })
        ));
        assert!(matches!(
            render(&sheet(r#"<xsl:template match="/"><xsl:call-template name="nope"/></xsl:template>"#)),
            Err(TransformError::Stylesheet(_))
        ));
    }

    #[test]
    fn test_xsl_text_keeps_whitespace() {
        let html = render(&sheet(
            r#"<xsl:template match="/">
                 <xsl:value-of select="//Reading[1]/Value"/><xsl:text> </xsl:text><xsl:value-of select="//Unit"/>
               </xsl:template>"#,
        ))
        .unwrap();
        assert_eq!(html, "95 F");
    }

    #[test]
    fn test_runaway_recursion_is_stopped() {
        let outcome = render(&sheet(
            r#"<xsl:template name="loop"><xsl:call-template name="loop"/></xsl:template>
               <xsl:template match="/"><xsl:call-template name="loop"/></xsl:template>"#,
        ));
        assert!(matches!(outcome, Err(TransformError::DepthExceeded(MAX_DEPTH))));
    }

    fn nested_data(levels: usize) -> Document {
        let mut xml = String::from("<Payload>");
        xml.push_str(&"<G>".repeat(levels));
        xml.push('x');
        xml.push_str(&"</G>".repeat(levels));
        xml.push_str("</Payload>");
        parse_xml(&xml).unwrap()
    }

    #[test]
    fn test_deep_data_through_builtin_rules_fails_cleanly() {
        let data = nested_data(20_000);
        let template = parse_template(&sheet(r#"<xsl:template match="DeviceId"/>"#)).unwrap();
        let outcome = XsltEngine.apply_template(&data, &template);
        assert!(matches!(outcome, Err(TransformError::DepthExceeded(_))));
    }

    #[test]
    fn test_deep_copy_fails_cleanly() {
        let data = nested_data(20_000);
        let template = parse_template(&sheet(r#"<xsl:template match="/"><xsl:copy-of select="/"/></xsl:template>"#)).unwrap();
        let outcome = XsltEngine.apply_template(&data, &template);
        assert!(matches!(outcome, Err(TransformError::DepthExceeded(_))));
    }

    #[test]
    fn test_moderate_nesting_renders() {
        let data = nested_data(100);
        let template = parse_template(&sheet(r#"<xsl:template match="DeviceId"/>"#)).unwrap();
        assert_eq!(XsltEngine.apply_template(&data, &template).unwrap(), "x");
    }
}
