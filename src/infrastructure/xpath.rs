// XPath expression subset - parsing and evaluation over Document trees
use crate::domain::document::{Document, NodeId, NodeKind};
use crate::domain::error::TransformError;
use std::collections::HashMap;

/// A node reachable from an expression. Attributes are addressed by their
/// owning element and index since the tree stores them inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Node(NodeId),
    Attribute(NodeId, usize),
}

impl NodeRef {
    fn order_key(self) -> (NodeId, usize) {
        match self {
            NodeRef::Node(id) => (id, 0),
            NodeRef::Attribute(id, index) => (id, index + 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nodes(Vec<NodeRef>),
    Str(String),
    Num(f64),
    Bool(bool),
}

pub type Variables = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Child,
    Attribute,
    SelfNode,
    Parent,
    Descendant,
    DescendantOrSelf,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeTest {
    Name(String),
    Wildcard,
    Text,
    AnyNode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Path { absolute: bool, steps: Vec<Step> },
    Filter { base: Box<Expr>, predicates: Vec<Expr>, steps: Vec<Step> },
    Literal(String),
    Number(f64),
    Variable(String),
    Negate(Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Evaluation context: the focus node plus its position within the
/// current node list.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub doc: &'a Document,
    pub node: NodeRef,
    pub position: usize,
    pub size: usize,
    pub variables: &'a Variables,
}

impl<'a> Context<'a> {
    pub fn new(doc: &'a Document, node: NodeRef, variables: &'a Variables) -> Self {
        Self {
            doc,
            node,
            position: 1,
            size: 1,
            variables,
        }
    }

    pub fn focus(&self, node: NodeRef, position: usize, size: usize) -> Self {
        Self {
            node,
            position,
            size,
            ..*self
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    Star,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Pipe,
    Dollar(String),
    Name(String),
    Literal(String),
    Number(f64),
    Op(BinaryOp),
}

fn ends_operand(token: &Token) -> bool {
    if let Token::Name(name) = token {
        return !name.ends_with("::");
    }
    matches!(
        token,
        Token::Literal(_)
            | Token::Number(_)
            | Token::Dollar(_)
            | Token::RParen
            | Token::RBracket
            | Token::Dot
            | Token::DotDot
            | Token::Star
    )
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let after_operand = tokens.last().is_some_and(ends_operand);

        let token = match c {
            '/' if next == Some('/') => {
                i += 1;
                Token::DoubleSlash
            }
            '/' => Token::Slash,
            '.' if next == Some('.') => {
                i += 1;
                Token::DotDot
            }
            '.' if next.is_some_and(|n| n.is_ascii_digit()) => {
                let (number, len) = read_number(&chars[i..]);
                i += len - 1;
                Token::Number(number)
            }
            '.' => Token::Dot,
            '@' => Token::At,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            '|' => Token::Pipe,
            '+' => Token::Op(BinaryOp::Add),
            '-' => Token::Op(BinaryOp::Sub),
            '=' => Token::Op(BinaryOp::Eq),
            '!' if next == Some('=') => {
                i += 1;
                Token::Op(BinaryOp::NotEq)
            }
            '<' if next == Some('=') => {
                i += 1;
                Token::Op(BinaryOp::Le)
            }
            '<' => Token::Op(BinaryOp::Lt),
            '>' if next == Some('=') => {
                i += 1;
                Token::Op(BinaryOp::Ge)
            }
            '>' => Token::Op(BinaryOp::Gt),
            '*' if after_operand => Token::Op(BinaryOp::Mul),
            '*' => Token::Star,
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|ch| *ch == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                let literal: String = chars[i + 1..i + 1 + end].iter().collect();
                i += end + 1;
                Token::Literal(literal)
            }
            '$' => {
                let len = chars[i + 1..].iter().take_while(|ch| is_name_char(**ch)).count();
                if len == 0 {
                    return Err("expected variable name after '$'".to_string());
                }
                let name: String = chars[i + 1..i + 1 + len].iter().collect();
                i += len;
                Token::Dollar(name)
            }
            d if d.is_ascii_digit() => {
                let (number, len) = read_number(&chars[i..]);
                i += len - 1;
                Token::Number(number)
            }
            n if n.is_alphabetic() || n == '_' => {
                let len = chars[i..].iter().take_while(|ch| is_name_char(**ch)).count();
                let name: String = chars[i..i + len].iter().collect();
                i += len - 1;
                match name.as_str() {
                    "and" if after_operand => Token::Op(BinaryOp::And),
                    "or" if after_operand => Token::Op(BinaryOp::Or),
                    "div" if after_operand => Token::Op(BinaryOp::Div),
                    "mod" if after_operand => Token::Op(BinaryOp::Mod),
                    _ => Token::Name(name),
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
        };
        tokens.push(token);
        i += 1;
    }
    Ok(tokens)
}

fn read_number(chars: &[char]) -> (f64, usize) {
    let mut len = chars.iter().take_while(|c| c.is_ascii_digit()).count();
    if chars.get(len) == Some(&'.') {
        len += 1;
        len += chars[len..].iter().take_while(|c| c.is_ascii_digit()).count();
    }
    let text: String = chars[..len].iter().collect();
    (text.parse().unwrap_or(f64::NAN), len)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse an expression into an [`Expr`] tree.
pub fn compile(src: &str) -> Result<Expr, TransformError> {
    let tokens = tokenize(src).map_err(|message| TransformError::expression(src, message))?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser
        .parse_or()
        .map_err(|message| TransformError::expression(src, message))?;
    if parser.pos < parser.tokens.len() {
        return Err(TransformError::expression(
            src,
            format!("unexpected token {:?}", parser.tokens[parser.pos]),
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(format!("expected {:?}, found {:?}", token, self.peek()))
        }
    }

    fn eat_op(&mut self, ops: &[BinaryOp]) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn binary_level(
        &mut self,
        ops: &[BinaryOp],
        next: fn(&mut Self) -> Result<Expr, String>,
    ) -> Result<Expr, String> {
        let mut left = next(self)?;
        while let Some(op) = self.eat_op(ops) {
            let right = next(self)?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        self.binary_level(&[BinaryOp::Or], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        self.binary_level(&[BinaryOp::And], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        self.binary_level(&[BinaryOp::Eq, BinaryOp::NotEq], Self::parse_relational)
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[BinaryOp::Lt, BinaryOp::Le, BinaryOp::Gt, BinaryOp::Ge],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        self.binary_level(&[BinaryOp::Add, BinaryOp::Sub], Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat_op(&[BinaryOp::Sub]).is_some() {
            return Ok(Expr::Negate(Box::new(self.parse_unary()?)));
        }
        let mut left = self.parse_path_expr()?;
        while self.eat(&Token::Pipe) {
            let right = self.parse_path_expr()?;
            left = Expr::Union(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_path_expr(&mut self) -> Result<Expr, String> {
        let primary = match self.peek() {
            Some(Token::Literal(_)) | Some(Token::Number(_)) | Some(Token::Dollar(_)) | Some(Token::LParen) => {
                self.parse_primary()?
            }
            Some(Token::Name(name))
                if self.peek_at(1) == Some(&Token::LParen) && !is_node_type(name) =>
            {
                self.parse_primary()?
            }
            _ => return self.parse_location_path(),
        };

        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.parse_or()?);
            self.expect(Token::RBracket)?;
        }
        let mut steps = Vec::new();
        if matches!(self.peek(), Some(Token::Slash) | Some(Token::DoubleSlash)) {
            self.parse_relative_steps(&mut steps, true)?;
        }
        if predicates.is_empty() && steps.is_empty() {
            return Ok(primary);
        }
        Ok(Expr::Filter {
            base: Box::new(primary),
            predicates,
            steps,
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Literal(text)) => Ok(Expr::Literal(text)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Dollar(name)) => Ok(Expr::Variable(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Name(name)) => {
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.parse_or()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(Token::RParen)?;
                        break;
                    }
                }
                Ok(Expr::Call(name, args))
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn parse_location_path(&mut self) -> Result<Expr, String> {
        let mut steps = Vec::new();
        let absolute = matches!(self.peek(), Some(Token::Slash) | Some(Token::DoubleSlash));
        if self.eat(&Token::Slash) {
            if self.peek().is_some_and(starts_step) {
                self.parse_step_sequence(&mut steps)?;
            }
        } else if self.eat(&Token::DoubleSlash) {
            steps.push(descendant_or_self());
            self.parse_step_sequence(&mut steps)?;
        } else {
            self.parse_step_sequence(&mut steps)?;
        }
        Ok(Expr::Path { absolute, steps })
    }

    /// Continues a path with `/step` or `//step` segments.
    fn parse_relative_steps(&mut self, steps: &mut Vec<Step>, leading: bool) -> Result<(), String> {
        if leading {
            if self.eat(&Token::DoubleSlash) {
                steps.push(descendant_or_self());
            } else {
                self.expect(Token::Slash)?;
            }
        }
        self.parse_step_sequence(steps)
    }

    fn parse_step_sequence(&mut self, steps: &mut Vec<Step>) -> Result<(), String> {
        loop {
            steps.push(self.parse_step()?);
            if self.eat(&Token::Slash) {
                continue;
            }
            if self.eat(&Token::DoubleSlash) {
                steps.push(descendant_or_self());
                continue;
            }
            return Ok(());
        }
    }

    fn parse_step(&mut self) -> Result<Step, String> {
        let (axis, test) = match self.advance() {
            Some(Token::Dot) => return Ok(step(Axis::SelfNode, NodeTest::AnyNode)),
            Some(Token::DotDot) => return Ok(step(Axis::Parent, NodeTest::AnyNode)),
            Some(Token::At) => match self.advance() {
                Some(Token::Name(name)) => (Axis::Attribute, NodeTest::Name(name)),
                Some(Token::Star) => (Axis::Attribute, NodeTest::Wildcard),
                other => return Err(format!("expected attribute name, found {other:?}")),
            },
            Some(Token::Star) => (Axis::Child, NodeTest::Wildcard),
            Some(Token::Name(name)) => {
                let (axis, local) = match name.split_once("::") {
                    Some((axis, rest)) => (parse_axis(axis)?, rest.to_string()),
                    None => (Axis::Child, name),
                };
                let test = if local.is_empty() && self.eat(&Token::Star) {
                    NodeTest::Wildcard
                } else if is_node_type(&local) && self.peek() == Some(&Token::LParen) {
                    self.expect(Token::LParen)?;
                    self.expect(Token::RParen)?;
                    if local == "text" { NodeTest::Text } else { NodeTest::AnyNode }
                } else {
                    NodeTest::Name(local)
                };
                (axis, test)
            }
            other => return Err(format!("expected location step, found {other:?}")),
        };

        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.parse_or()?);
            self.expect(Token::RBracket)?;
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }
}

fn is_node_type(name: &str) -> bool {
    matches!(name, "text" | "node")
}

fn starts_step(token: &Token) -> bool {
    matches!(
        token,
        Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_)
    )
}

fn step(axis: Axis, test: NodeTest) -> Step {
    Step {
        axis,
        test,
        predicates: Vec::new(),
    }
}

fn descendant_or_self() -> Step {
    step(Axis::DescendantOrSelf, NodeTest::AnyNode)
}

fn parse_axis(name: &str) -> Result<Axis, String> {
    Ok(match name {
        "child" => Axis::Child,
        "attribute" => Axis::Attribute,
        "self" => Axis::SelfNode,
        "parent" => Axis::Parent,
        "descendant" => Axis::Descendant,
        "descendant-or-self" => Axis::DescendantOrSelf,
        "ancestor" => Axis::Ancestor,
        "ancestor-or-self" => Axis::AncestorOrSelf,
        "following-sibling" => Axis::FollowingSibling,
        "preceding-sibling" => Axis::PrecedingSibling,
        other => return Err(format!("unsupported axis '{other}'")),
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub fn evaluate(expr: &Expr, ctx: &Context) -> Result<Value, TransformError> {
    match expr {
        Expr::Literal(text) => Ok(Value::Str(text.clone())),
        Expr::Number(n) => Ok(Value::Num(*n)),
        Expr::Variable(name) => ctx
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| TransformError::expression(&format!("${name}"), "undefined variable")),
        Expr::Negate(inner) => Ok(Value::Num(-evaluate(inner, ctx)?.to_number(ctx.doc))),
        Expr::Path { absolute, steps } => {
            let start = if *absolute {
                NodeRef::Node(Document::ROOT)
            } else {
                ctx.node
            };
            Ok(Value::Nodes(walk(vec![start], steps, ctx)?))
        }
        Expr::Filter {
            base,
            predicates,
            steps,
        } => {
            let mut nodes = evaluate(base, ctx)?
                .into_nodes()
                .map_err(|message| TransformError::expression("filter", message))?;
            for predicate in predicates {
                nodes = apply_predicate(nodes, predicate, ctx)?;
            }
            Ok(Value::Nodes(walk(nodes, steps, ctx)?))
        }
        Expr::Union(left, right) => {
            let mut nodes = evaluate(left, ctx)?
                .into_nodes()
                .map_err(|message| TransformError::expression("|", message))?;
            nodes.extend(
                evaluate(right, ctx)?
                    .into_nodes()
                    .map_err(|message| TransformError::expression("|", message))?,
            );
            sort_document_order(&mut nodes);
            Ok(Value::Nodes(nodes))
        }
        Expr::Binary(left, op, right) => binary(*op, left, right, ctx),
        Expr::Call(name, args) => call(name, args, ctx),
    }
}

fn walk(start: Vec<NodeRef>, steps: &[Step], ctx: &Context) -> Result<Vec<NodeRef>, TransformError> {
    let mut current = start;
    for step in steps {
        let mut next = Vec::new();
        for node in &current {
            let mut candidates: Vec<NodeRef> = axis_nodes(ctx.doc, *node, step.axis)
                .into_iter()
                .filter(|candidate| node_test(ctx.doc, *candidate, step.axis, &step.test))
                .collect();
            for predicate in &step.predicates {
                candidates = apply_predicate(candidates, predicate, ctx)?;
            }
            next.extend(candidates);
        }
        sort_document_order(&mut next);
        current = next;
    }
    Ok(current)
}

fn apply_predicate(nodes: Vec<NodeRef>, predicate: &Expr, ctx: &Context) -> Result<Vec<NodeRef>, TransformError> {
    let size = nodes.len();
    let mut kept = Vec::new();
    for (index, node) in nodes.into_iter().enumerate() {
        let inner = ctx.focus(node, index + 1, size);
        let keep = match evaluate(predicate, &inner)? {
            Value::Num(n) => n == (index + 1) as f64,
            other => other.to_bool(),
        };
        if keep {
            kept.push(node);
        }
    }
    Ok(kept)
}

fn sort_document_order(nodes: &mut Vec<NodeRef>) {
    nodes.sort_by_key(|node| node.order_key());
    nodes.dedup();
}

/// Nodes along `axis`; reverse axes come back nearest-first.
fn axis_nodes(doc: &Document, node: NodeRef, axis: Axis) -> Vec<NodeRef> {
    let element = match node {
        NodeRef::Node(id) => Some(id),
        NodeRef::Attribute(..) => None,
    };
    let parent = match node {
        NodeRef::Node(id) => doc.parent(id),
        NodeRef::Attribute(owner, _) => Some(owner),
    };
    let wrap = |ids: Vec<NodeId>| ids.into_iter().map(NodeRef::Node).collect::<Vec<_>>();

    match axis {
        Axis::SelfNode => vec![node],
        Axis::Child => element.map(|id| wrap(doc.children(id).to_vec())).unwrap_or_default(),
        Axis::Attribute => element
            .map(|id| {
                doc.attributes(id)
                    .iter()
                    .enumerate()
                    .filter(|(_, (key, _))| key != "xmlns" && !key.starts_with("xmlns:"))
                    .map(|(index, _)| NodeRef::Attribute(id, index))
                    .collect()
            })
            .unwrap_or_default(),
        Axis::Parent => parent.map(|id| vec![NodeRef::Node(id)]).unwrap_or_default(),
        Axis::Descendant => element.map(|id| wrap(doc.descendants(id))).unwrap_or_default(),
        Axis::DescendantOrSelf => {
            let mut out = vec![node];
            if let Some(id) = element {
                out.extend(wrap(doc.descendants(id)));
            }
            out
        }
        Axis::Ancestor | Axis::AncestorOrSelf => {
            let mut out = Vec::new();
            if axis == Axis::AncestorOrSelf {
                out.push(node);
            }
            let mut current = parent;
            while let Some(id) = current {
                out.push(NodeRef::Node(id));
                current = doc.parent(id);
            }
            out
        }
        Axis::FollowingSibling | Axis::PrecedingSibling => {
            let (Some(id), Some(parent)) = (element, parent) else {
                return Vec::new();
            };
            let siblings = doc.children(parent);
            let at = siblings.iter().position(|s| *s == id).unwrap_or(0);
            if axis == Axis::FollowingSibling {
                wrap(siblings[at + 1..].to_vec())
            } else {
                wrap(siblings[..at].iter().rev().copied().collect())
            }
        }
    }
}

fn node_test(doc: &Document, node: NodeRef, axis: Axis, test: &NodeTest) -> bool {
    match node {
        NodeRef::Attribute(owner, index) => {
            if axis != Axis::Attribute && !matches!(test, NodeTest::AnyNode) {
                return false;
            }
            match test {
                NodeTest::Name(name) => doc.attributes(owner)[index].0 == *name,
                NodeTest::Wildcard | NodeTest::AnyNode => true,
                NodeTest::Text => false,
            }
        }
        NodeRef::Node(id) => match (&doc.node(id).kind, test) {
            (_, NodeTest::AnyNode) => true,
            (NodeKind::Element { name: actual, .. }, NodeTest::Name(name)) => actual == name,
            (NodeKind::Element { .. }, NodeTest::Wildcard) => true,
            (NodeKind::Text(_), NodeTest::Text) => true,
            _ => false,
        },
    }
}

pub fn string_value(doc: &Document, node: NodeRef) -> String {
    match node {
        NodeRef::Node(id) => doc.text_content(id),
        NodeRef::Attribute(owner, index) => doc.attributes(owner)[index].1.clone(),
    }
}

fn node_name(doc: &Document, node: NodeRef) -> String {
    match node {
        NodeRef::Node(id) => doc.name(id).unwrap_or_default().to_string(),
        NodeRef::Attribute(owner, index) => doc.attributes(owner)[index].0.clone(),
    }
}

/// Number formatting for string conversion: integers print without a
/// fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{:.0}", n + 0.0)
    } else {
        n.to_string()
    }
}

fn parse_number(text: &str) -> f64 {
    text.trim().parse().unwrap_or(f64::NAN)
}

impl Value {
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Nodes(nodes) => !nodes.is_empty(),
            Value::Str(text) => !text.is_empty(),
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Bool(b) => *b,
        }
    }

    pub fn to_number(&self, doc: &Document) -> f64 {
        match self {
            Value::Num(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Str(text) => parse_number(text),
            Value::Nodes(_) => parse_number(&self.to_text(doc)),
        }
    }

    /// String conversion; a node list converts through its first node.
    pub fn to_text(&self, doc: &Document) -> String {
        match self {
            Value::Nodes(nodes) => nodes
                .first()
                .map(|node| string_value(doc, *node))
                .unwrap_or_default(),
            Value::Str(text) => text.clone(),
            Value::Num(n) => format_number(*n),
            Value::Bool(b) => b.to_string(),
        }
    }

    pub fn into_nodes(self) -> Result<Vec<NodeRef>, String> {
        match self {
            Value::Nodes(nodes) => Ok(nodes),
            other => Err(format!("expected a node-set, found {other:?}")),
        }
    }
}

fn binary(op: BinaryOp, left: &Expr, right: &Expr, ctx: &Context) -> Result<Value, TransformError> {
    match op {
        BinaryOp::Or => {
            return Ok(Value::Bool(
                evaluate(left, ctx)?.to_bool() || evaluate(right, ctx)?.to_bool(),
            ));
        }
        BinaryOp::And => {
            return Ok(Value::Bool(
                evaluate(left, ctx)?.to_bool() && evaluate(right, ctx)?.to_bool(),
            ));
        }
        _ => {}
    }

    let l = evaluate(left, ctx)?;
    let r = evaluate(right, ctx)?;
    let doc = ctx.doc;
    let arithmetic = |f: fn(f64, f64) -> f64| Ok(Value::Num(f(l.to_number(doc), r.to_number(doc))));
    match op {
        BinaryOp::Add => arithmetic(|a, b| a + b),
        BinaryOp::Sub => arithmetic(|a, b| a - b),
        BinaryOp::Mul => arithmetic(|a, b| a * b),
        BinaryOp::Div => arithmetic(|a, b| a / b),
        BinaryOp::Mod => arithmetic(|a, b| a % b),
        _ => Ok(Value::Bool(compare(op, &l, &r, doc))),
    }
}

/// Comparison with node-set semantics: true when any member satisfies it.
fn compare(op: BinaryOp, left: &Value, right: &Value, doc: &Document) -> bool {
    let atoms = |nodes: &[NodeRef]| -> Vec<Value> {
        nodes.iter().map(|n| Value::Str(string_value(doc, *n))).collect()
    };
    match (left, right) {
        (Value::Nodes(a), Value::Nodes(b)) => {
            let right_atoms = atoms(b);
            atoms(a)
                .iter()
                .any(|x| right_atoms.iter().any(|y| compare_atoms(op, x, y, doc)))
        }
        (Value::Nodes(a), Value::Bool(_)) => compare_atoms(op, &Value::Bool(!a.is_empty()), right, doc),
        (Value::Bool(_), Value::Nodes(b)) => compare_atoms(op, left, &Value::Bool(!b.is_empty()), doc),
        (Value::Nodes(a), atom) => atoms(a).iter().any(|x| compare_atoms(op, x, atom, doc)),
        (atom, Value::Nodes(b)) => atoms(b).iter().any(|y| compare_atoms(op, atom, y, doc)),
        _ => compare_atoms(op, left, right, doc),
    }
}

fn compare_atoms(op: BinaryOp, a: &Value, b: &Value, doc: &Document) -> bool {
    match op {
        BinaryOp::Eq | BinaryOp::NotEq => {
            let equal = if matches!(a, Value::Bool(_)) || matches!(b, Value::Bool(_)) {
                a.to_bool() == b.to_bool()
            } else if matches!(a, Value::Num(_)) || matches!(b, Value::Num(_)) {
                a.to_number(doc) == b.to_number(doc)
            } else {
                a.to_text(doc) == b.to_text(doc)
            };
            (op == BinaryOp::Eq) == equal
        }
        BinaryOp::Lt => a.to_number(doc) < b.to_number(doc),
        BinaryOp::Le => a.to_number(doc) <= b.to_number(doc),
        BinaryOp::Gt => a.to_number(doc) > b.to_number(doc),
        BinaryOp::Ge => a.to_number(doc) >= b.to_number(doc),
        _ => false,
    }
}

fn call(name: &str, args: &[Expr], ctx: &Context) -> Result<Value, TransformError> {
    let doc = ctx.doc;
    let values = args
        .iter()
        .map(|arg| evaluate(arg, ctx))
        .collect::<Result<Vec<_>, _>>()?;
    let focus_or_arg = |index: usize| -> String {
        values
            .get(index)
            .map(|v| v.to_text(doc))
            .unwrap_or_else(|| string_value(doc, ctx.node))
    };
    let nodes_arg = |index: usize| -> Result<Vec<NodeRef>, TransformError> {
        values
            .get(index)
            .cloned()
            .ok_or_else(|| TransformError::expression(name, "missing argument"))?
            .into_nodes()
            .map_err(|message| TransformError::expression(name, message))
    };

    let value = match (name, values.len()) {
        ("true", 0) => Value::Bool(true),
        ("false", 0) => Value::Bool(false),
        ("not", 1) => Value::Bool(!values[0].to_bool()),
        ("boolean", 1) => Value::Bool(values[0].to_bool()),
        ("position", 0) => Value::Num(ctx.position as f64),
        ("last", 0) => Value::Num(ctx.size as f64),
        ("count", 1) => Value::Num(nodes_arg(0)?.len() as f64),
        ("sum", 1) => Value::Num(
            nodes_arg(0)?
                .into_iter()
                .map(|node| parse_number(&string_value(doc, node)))
                .sum(),
        ),
        ("string", 0 | 1) => Value::Str(focus_or_arg(0)),
        ("number", 0) => Value::Num(parse_number(&string_value(doc, ctx.node))),
        ("number", 1) => Value::Num(values[0].to_number(doc)),
        ("string-length", 0 | 1) => Value::Num(focus_or_arg(0).chars().count() as f64),
        ("normalize-space", 0 | 1) => Value::Str(
            focus_or_arg(0)
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" "),
        ),
        ("concat", n) if n >= 2 => Value::Str(values.iter().map(|v| v.to_text(doc)).collect()),
        ("contains", 2) => Value::Bool(values[0].to_text(doc).contains(&values[1].to_text(doc))),
        ("starts-with", 2) => Value::Bool(values[0].to_text(doc).starts_with(&values[1].to_text(doc))),
        ("substring-before", 2) => {
            let haystack = values[0].to_text(doc);
            let needle = values[1].to_text(doc);
            Value::Str(haystack.split_once(&needle).map(|(before, _)| before.to_string()).unwrap_or_default())
        }
        ("substring-after", 2) => {
            let haystack = values[0].to_text(doc);
            let needle = values[1].to_text(doc);
            Value::Str(haystack.split_once(&needle).map(|(_, after)| after.to_string()).unwrap_or_default())
        }
        ("round", 1) => Value::Num((values[0].to_number(doc) + 0.5).floor()),
        ("floor", 1) => Value::Num(values[0].to_number(doc).floor()),
        ("ceiling", 1) => Value::Num(values[0].to_number(doc).ceil()),
        ("format-number", 2) => Value::Str(format_with_pattern(values[0].to_number(doc), &values[1].to_text(doc))),
        ("name" | "local-name", 0 | 1) => {
            let node = match values.first() {
                Some(value) => value
                    .clone()
                    .into_nodes()
                    .map_err(|message| TransformError::expression(name, message))?
                    .first()
                    .copied(),
                None => Some(ctx.node),
            };
            let full = node.map(|n| node_name(doc, n)).unwrap_or_default();
            if name == "local-name" {
                Value::Str(crate::domain::document::local_part(&full).to_string())
            } else {
                Value::Str(full)
            }
        }
        (other, arity) => {
            return Err(TransformError::expression(
                other,
                format!("unknown function or wrong arity ({arity} arguments)"),
            ));
        }
    };
    Ok(value)
}

/// `format-number` for plain patterns: digits after the decimal point set the
/// precision (`0.00` -> two places).
fn format_with_pattern(n: f64, pattern: &str) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    let decimals = pattern
        .split_once('.')
        .map(|(_, fraction)| fraction.chars().filter(|c| *c == '0' || *c == '#').count())
        .unwrap_or(0);
    format!("{n:.decimals$}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::xml_parser::parse_xml;

    const PAYLOAD: &str = r#"<Payload>
  <DeviceConfig>
    <DeviceId>IOT-7</DeviceId>
    <Sensors>
      <SensorConfig type="Temperature"><Unit>F</Unit><Threshold>80</Threshold></SensorConfig>
      <SensorConfig type="Humidity"><Unit>%</Unit><Threshold>60</Threshold></SensorConfig>
    </Sensors>
  </DeviceConfig>
  <SensorData>
    <Reading type="Temperature"><Value>95</Value></Reading>
    <Reading type="Humidity"><Value>40.5</Value></Reading>
    <Reading type="Pressure"><Value>1013</Value></Reading>
  </SensorData>
</Payload>"#;

    fn eval(doc: &Document, src: &str) -> Value {
        let vars = Variables::new();
        let ctx = Context::new(doc, NodeRef::Node(Document::ROOT), &vars);
        evaluate(&compile(src).unwrap(), &ctx).unwrap()
    }

    #[test]
    fn test_paths_and_predicates() {
        let doc = parse_xml(PAYLOAD).unwrap();
        assert_eq!(eval(&doc, "count(//Reading)"), Value::Num(3.0));
        assert_eq!(eval(&doc, "string(/Payload/DeviceConfig/DeviceId)").to_text(&doc), "IOT-7");
        assert_eq!(eval(&doc, "//Reading[2]/@type").to_text(&doc), "Humidity");
        assert_eq!(eval(&doc, "//Reading[@type='Pressure']/Value").to_text(&doc), "1013");
        assert_eq!(eval(&doc, "count(//Reading[Value > 50])"), Value::Num(2.0));
        assert_eq!(eval(&doc, "count(//*)"), Value::Num(17.0));
        assert_eq!(eval(&doc, "count(//Sensors/child::*)"), Value::Num(2.0));
        assert_eq!(eval(&doc, "count(//Reading[last()])"), Value::Num(1.0));
    }

    #[test]
    fn test_relative_navigation() {
        let doc = parse_xml(PAYLOAD).unwrap();
        let vars = Variables::new();
        let reading = doc.descendants_named(Document::ROOT, "Reading")[0];
        let ctx = Context::new(&doc, NodeRef::Node(reading), &vars);
        let threshold = compile("//SensorConfig[@type = current-type]/Threshold").unwrap();
        // no such child, so the comparison never holds
        assert_eq!(evaluate(&threshold, &ctx).unwrap(), Value::Nodes(Vec::new()));

        let parent = compile("name(..)").unwrap();
        assert_eq!(evaluate(&parent, &ctx).unwrap(), Value::Str("SensorData".to_string()));
        let sibling = compile("following-sibling::Reading[1]/@type").unwrap();
        assert_eq!(evaluate(&sibling, &ctx).unwrap().to_text(&doc), "Humidity");
    }

    #[test]
    fn test_operators_and_functions() {
        let doc = parse_xml(PAYLOAD).unwrap();
        assert_eq!(eval(&doc, "1 + 2 * 3"), Value::Num(7.0));
        assert_eq!(eval(&doc, "7 mod 4"), Value::Num(3.0));
        assert_eq!(eval(&doc, "10 div 4"), Value::Num(2.5));
        assert_eq!(eval(&doc, "-(2 - 5)"), Value::Num(3.0));
        assert_eq!(eval(&doc, "sum(//Reading/Value)"), Value::Num(1148.5));
        assert_eq!(eval(&doc, "concat('a', 1, 'b')"), Value::Str("a1b".to_string()));
        assert_eq!(eval(&doc, "contains('Temperature', 'per')"), Value::Bool(true));
        assert_eq!(eval(&doc, "not(//Missing)"), Value::Bool(true));
        assert_eq!(eval(&doc, "1 < 2 and 3 >= 3"), Value::Bool(true));
        assert_eq!(eval(&doc, "round(2.5)"), Value::Num(3.0));
        assert_eq!(eval(&doc, "format-number(2.345, '0.00')").to_text(&doc), "2.35");
        assert_eq!(eval(&doc, "normalize-space('  a   b ')"), Value::Str("a b".to_string()));
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(95.0), "95");
        assert_eq!(format_number(40.5), "40.5");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(f64::NAN), "NaN");
    }

    #[test]
    fn test_compile_errors() {
        assert!(compile("//Reading[").is_err());
        assert!(compile("'open").is_err());
        assert!(compile("a b").is_err());
        let doc = parse_xml("<A/>").unwrap();
        let vars = Variables::new();
        let ctx = Context::new(&doc, NodeRef::Node(Document::ROOT), &vars);
        assert!(evaluate(&compile("bogus(1)").unwrap(), &ctx).is_err());
        assert!(evaluate(&compile("$nope").unwrap(), &ctx).is_err());
    }
}
