// template.rs — Code templates: parsing, rewrite metadata, rendering
//
// A template is verbatim text with `${expr}` segments. The segment structure is
// parsed with chumsky; each expression body is lexed with logos into bound
// identifiers, keyed accesses into the binding set (`args['name']`), and
// verbatim text. Identifier rewrites (index subscripts, dereferences) are kept
// as metadata on the template and applied while rendering; the parsed form only
// depends on the source text, so it can be cached by source hash.
//
// Preconditions: none.
// Postconditions: `render` substitutes every bound identifier exactly once per
//                 occurrence; text outside `${}` is copied unchanged.
// Failure modes: unterminated `${`, unbound identifiers, and prefix keys used
//                at render time produce `TemplateError`.
// Side effects: none.

use std::collections::BTreeMap;

use chumsky::prelude::*;
use logos::Logos;
use serde::{Deserialize, Serialize};

/// Names of the dynamic-key binding bags (`args['x']`, `kwargs['x']`).
pub const KEYED_BAGS: [&str; 2] = ["args", "kwargs"];

// ── Bindings ────────────────────────────────────────────────────────────────

/// Value bound to a template identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// A symbol, usually a buffer name.
    Name(String),
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    /// Literal code that never resolves to a buffer.
    Code(String),
}

impl Binding {
    /// Buffer-name candidate carried by this binding.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Binding::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Binding::Name(s) | Binding::Code(s) => s.clone(),
            Binding::Int(i) => i.to_string(),
            Binding::Float(x) => format!("{:?}", x),
            Binding::Ints(v) => {
                let parts: Vec<String> = v.iter().map(|i| i.to_string()).collect();
                format!("{{{}}}", parts.join(", "))
            }
        }
    }
}

pub type Bindings = BTreeMap<String, Binding>;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("template syntax error: {0}")]
    Syntax(String),
    #[error("identifier '{name}' is not bound")]
    Unbound { name: String },
    #[error("key prefix '{prefix}' cannot be rendered without evaluation")]
    DynamicKey { prefix: String },
}

// ── Template ────────────────────────────────────────────────────────────────

/// Rewrite applied to every occurrence of an identifier when rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rewrite {
    /// `x` → `(*x)`
    Deref,
    /// `x` → `x[i]`, where `i` is rendered from the bindings when bound.
    Index(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    source: String,
    #[serde(default)]
    rewrites: BTreeMap<String, Vec<Rewrite>>,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            rewrites: BTreeMap::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn rewrites(&self) -> &BTreeMap<String, Vec<Rewrite>> {
        &self.rewrites
    }

    /// Prefix every non-empty source line with `indent`. Rewrites are kept.
    pub fn indent(&mut self, indent: &str) {
        self.source = self
            .source
            .split('\n')
            .map(|line| {
                if line.is_empty() {
                    String::new()
                } else {
                    format!("{}{}", indent, line)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
    }

    /// Subscript every use of `names` with `index`.
    pub fn index_vars<S: AsRef<str>>(&mut self, names: &[S], index: &str) {
        for name in names {
            self.rewrites
                .entry(name.as_ref().to_string())
                .or_default()
                .push(Rewrite::Index(index.to_string()));
        }
    }

    /// Dereference every use of `names`.
    pub fn dereference_vars<S: AsRef<str>>(&mut self, names: &[S]) {
        for name in names {
            self.rewrites
                .entry(name.as_ref().to_string())
                .or_default()
                .push(Rewrite::Deref);
        }
    }
}

// ── Parsed form ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum ExprItem {
    Verbatim(String),
    /// Identifier that may be bound.
    Name(String),
    /// `bag['key']`; `prefix` when the literal is concatenated with more text.
    Key { key: String, prefix: bool },
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr(Vec<ExprItem>),
}

/// A template source split into text and analysed expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTemplate {
    segments: Vec<Segment>,
}

#[derive(Logos, Debug, Clone, Copy, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum ExprToken {
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,
    #[regex(r"[0-9]+(\.[0-9]+)?")]
    Number,
    #[regex(r#""[^"]*""#)]
    #[regex(r"'[^']*'")]
    Str,
    #[token(".")]
    Dot,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("+")]
    Plus,
}

enum RawSegment<'src> {
    Text(&'src str),
    Expr(&'src str),
}

fn segment_parser<'src>(
) -> impl Parser<'src, &'src str, Vec<RawSegment<'src>>, extra::Err<Rich<'src, char>>> {
    let expr = just("${")
        .ignore_then(none_of("}").repeated().to_slice())
        .then_ignore(just("}"))
        .map(RawSegment::Expr);
    let text = any()
        .and_is(just("${").not())
        .repeated()
        .at_least(1)
        .to_slice()
        .map(RawSegment::Text);
    expr.or(text)
        .repeated()
        .collect::<Vec<_>>()
        .then_ignore(end())
}

/// Parse template source text.
pub fn parse_template(source: &str) -> Result<ParsedTemplate, TemplateError> {
    let (raw, errors) = segment_parser().parse(source).into_output_errors();
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(TemplateError::Syntax(messages.join("; ")));
    }
    let segments = raw
        .unwrap_or_default()
        .into_iter()
        .map(|seg| match seg {
            RawSegment::Text(t) => Segment::Text(t.to_string()),
            RawSegment::Expr(body) => Segment::Expr(lex_expr(body)),
        })
        .collect();
    Ok(ParsedTemplate { segments })
}

fn lex_expr(body: &str) -> Vec<ExprItem> {
    let tokens: Vec<_> = ExprToken::lexer(body).spanned().collect();
    let tok_at = |i: usize| tokens.get(i).and_then(|(t, _)| t.ok());

    let mut items = Vec::new();
    let mut cursor = 0;
    let mut i = 0;
    while i < tokens.len() {
        let (tok, span) = &tokens[i];
        if span.start > cursor {
            items.push(ExprItem::Verbatim(body[cursor..span.start].to_string()));
        }
        let text = &body[span.clone()];
        let after_dot = i > 0 && tok_at(i - 1) == Some(ExprToken::Dot);

        if *tok == Ok(ExprToken::Ident) && !after_dot {
            let keyed = KEYED_BAGS.contains(&text)
                && tok_at(i + 1) == Some(ExprToken::LBracket)
                && tok_at(i + 2) == Some(ExprToken::Str);
            if keyed {
                let lit_span = tokens[i + 2].1.clone();
                let key = body[lit_span.start + 1..lit_span.end - 1].to_string();
                match tok_at(i + 3) {
                    Some(ExprToken::RBracket) => {
                        items.push(ExprItem::Key { key, prefix: false });
                        cursor = tokens[i + 3].1.end;
                        i += 4;
                        continue;
                    }
                    Some(ExprToken::Plus) => {
                        items.push(ExprItem::Key { key, prefix: true });
                        cursor = lit_span.end;
                        i += 3;
                        continue;
                    }
                    _ => {}
                }
            }
            items.push(ExprItem::Name(text.to_string()));
        } else {
            items.push(ExprItem::Verbatim(text.to_string()));
        }
        cursor = span.end;
        i += 1;
    }
    if cursor < body.len() {
        items.push(ExprItem::Verbatim(body[cursor..].to_string()));
    }
    items
}

impl ParsedTemplate {
    /// Binding keys referenced by the template, in order of first appearance.
    /// Prefix keys match every binding key starting with the literal.
    pub fn identifiers(&self, bindings: &Bindings) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if bindings.contains_key(name) && !out.iter().any(|n| n == name) {
                out.push(name.to_string());
            }
        };
        for segment in &self.segments {
            let Segment::Expr(items) = segment else {
                continue;
            };
            for item in items {
                match item {
                    ExprItem::Name(name) => push(name),
                    ExprItem::Key { key, prefix: false } => push(key),
                    ExprItem::Key { key, prefix: true } => {
                        for candidate in bindings.keys().filter(|k| k.starts_with(key.as_str())) {
                            push(candidate);
                        }
                    }
                    ExprItem::Verbatim(_) => {}
                }
            }
        }
        out
    }

    pub fn render(
        &self,
        rewrites: &BTreeMap<String, Vec<Rewrite>>,
        bindings: &Bindings,
    ) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Expr(items) => {
                    for item in items {
                        match item {
                            ExprItem::Verbatim(v) => out.push_str(v),
                            ExprItem::Name(name) | ExprItem::Key { key: name, prefix: false } => {
                                out.push_str(&render_bound(name, rewrites, bindings)?)
                            }
                            ExprItem::Key { key, prefix: true } => {
                                return Err(TemplateError::DynamicKey {
                                    prefix: key.clone(),
                                })
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn render_bound(
    name: &str,
    rewrites: &BTreeMap<String, Vec<Rewrite>>,
    bindings: &Bindings,
) -> Result<String, TemplateError> {
    let binding = bindings.get(name).ok_or_else(|| TemplateError::Unbound {
        name: name.to_string(),
    })?;
    let mut text = binding.render();
    for rewrite in rewrites.get(name).into_iter().flatten() {
        text = match rewrite {
            Rewrite::Deref => format!("(*{})", text),
            Rewrite::Index(index) => {
                let idx = bindings
                    .get(index)
                    .map(Binding::render)
                    .unwrap_or_else(|| index.clone());
                format!("{}[{}]", text, idx)
            }
        };
    }
    Ok(text)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, Binding)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn renders_bound_identifiers() {
        let parsed = parse_template("add(${a}, ${b}, ${out}, ${size});").unwrap();
        let b = bindings(&[
            ("a", Binding::Name("x0".into())),
            ("b", Binding::Name("x1".into())),
            ("out", Binding::Name("y".into())),
            ("size", Binding::Int(64)),
        ]);
        assert_eq!(
            parsed.render(&BTreeMap::new(), &b).unwrap(),
            "add(x0, x1, y, 64);"
        );
        assert_eq!(parsed.identifiers(&b), vec!["a", "b", "out", "size"]);
    }

    #[test]
    fn field_access_is_not_substituted() {
        let parsed = parse_template("${args_ptr.size} ${size}").unwrap();
        let b = bindings(&[
            ("args_ptr", Binding::Name("st".into())),
            ("size", Binding::Int(4)),
        ]);
        assert_eq!(parsed.render(&BTreeMap::new(), &b).unwrap(), "st.size 4");
    }

    #[test]
    fn rewrites_apply_in_order() {
        let mut template = Template::new("f(${x}, ${y});");
        template.dereference_vars(&["x"]);
        template.index_vars(&["y"], "i");
        let parsed = parse_template(template.source()).unwrap();
        let b = bindings(&[
            ("x", Binding::Name("rx".into())),
            ("y", Binding::Name("ty".into())),
            ("i", Binding::Name("tile_idx".into())),
        ]);
        assert_eq!(
            parsed.render(template.rewrites(), &b).unwrap(),
            "f((*rx), ty[tile_idx]);"
        );
    }

    #[test]
    fn unbound_index_is_emitted_verbatim_after_deref() {
        let mut template = Template::new("${x}");
        template.dereference_vars(&["x"]);
        template.index_vars(&["x"], "k");
        let parsed = parse_template(template.source()).unwrap();
        let b = bindings(&[("x", Binding::Name("buf".into()))]);
        assert_eq!(parsed.render(template.rewrites(), &b).unwrap(), "(*buf)[k]");
    }

    #[test]
    fn indent_prefixes_lines_and_keeps_rewrites() {
        let mut template = Template::new("a(${x});\n\nb();");
        template.dereference_vars(&["x"]);
        template.indent("    ");
        assert_eq!(template.source(), "    a(${x});\n\n    b();");
        assert_eq!(template.rewrites()["x"], vec![Rewrite::Deref]);
    }

    #[test]
    fn empty_rewrite_list_leaves_template_untouched() {
        let mut template = Template::new("${x}");
        let before = template.clone();
        template.dereference_vars::<&str>(&[]);
        template.index_vars::<&str>(&[], "i");
        assert_eq!(template, before);
    }

    #[test]
    fn keyed_bag_access() {
        let parsed = parse_template("${kwargs['in_0']} + ${args[\"in_1\"]}").unwrap();
        let b = bindings(&[
            ("in_0", Binding::Name("a".into())),
            ("in_1", Binding::Name("b".into())),
        ]);
        assert_eq!(parsed.render(&BTreeMap::new(), &b).unwrap(), "a + b");
    }

    #[test]
    fn prefix_keys_match_binding_keys() {
        let parsed = parse_template("${kwargs['in_' + str(i)]}").unwrap();
        let b = bindings(&[
            ("in_0", Binding::Name("a".into())),
            ("in_1", Binding::Name("b".into())),
            ("out", Binding::Name("c".into())),
        ]);
        assert_eq!(parsed.identifiers(&b), vec!["in_0", "in_1"]);
        assert_eq!(
            parsed.render(&BTreeMap::new(), &b),
            Err(TemplateError::DynamicKey {
                prefix: "in_".into()
            })
        );
    }

    #[test]
    fn unbound_identifier_fails() {
        let parsed = parse_template("${missing}").unwrap();
        assert_eq!(
            parsed.render(&BTreeMap::new(), &Bindings::new()),
            Err(TemplateError::Unbound {
                name: "missing".into()
            })
        );
    }

    #[test]
    fn unterminated_expression_is_syntax_error() {
        assert!(matches!(
            parse_template("call(${a);"),
            Err(TemplateError::Syntax(_))
        ));
    }

    #[test]
    fn text_without_expressions() {
        let parsed = parse_template("return;").unwrap();
        assert_eq!(parsed.render(&BTreeMap::new(), &Bindings::new()).unwrap(), "return;");
        assert!(parse_template("").unwrap().identifiers(&Bindings::new()).is_empty());
    }
}
