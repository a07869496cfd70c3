//! Recursive-descent parser: tokens to AST.
//!
//! Parsing a declaration is "loop until the closing paren, dispatch on the
//! next keyword marker (or the `body`/`field`/`rule` sub-form)". Attribute
//! order inside a declaration is free; duplicate attributes last-win (no
//! rejection) per the spec's explicit "implementer's choice, don't assume
//! either" — this implementation picks last-wins and documents it here
//! rather than leaving it ambiguous.

use crate::ast::*;
use crate::diagnostics::Span;
use crate::lexer::{tokenize_lossy, LexError, Position, Token, TokenKind};
use crate::version::{parse_version, Version, VersionError};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (line {}, column {})",
            self.message, self.span.start.line, self.span.start.column
        )
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        let pos = Position::default();
        ParseError {
            message: err.to_string(),
            span: Span::new(pos, pos),
        }
    }
}

impl From<VersionError> for ParseError {
    fn from(err: VersionError) -> Self {
        ParseError {
            message: err.to_string(),
            span: Span::default(),
        }
    }
}

/// Parse a complete module from source text.
pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    let tokens = tokenize_lossy(source)?;
    let mut parser = Parser::new(tokens);
    let module = parser.parse_module()?;
    parser.expect_eof()?;
    Ok(module)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_span(&self) -> Span {
        let t = self.peek();
        Span::new(t.start, t.end)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            span: self.peek_span(),
        }
    }

    fn expect_eof(&mut self) -> Result<(), ParseError> {
        match &self.peek().kind {
            TokenKind::Eof => Ok(()),
            other => Err(self.error(format!("expected end of input, got {:?}", other))),
        }
    }

    fn expect_lparen(&mut self) -> Result<Token, ParseError> {
        match self.peek().kind {
            TokenKind::LParen => Ok(self.advance()),
            ref other => Err(self.error(format!("expected '(', got {:?}", other))),
        }
    }

    fn expect_rparen(&mut self) -> Result<Token, ParseError> {
        match self.peek().kind {
            TokenKind::RParen => Ok(self.advance()),
            ref other => Err(self.error(format!("expected ')', got {:?}", other))),
        }
    }

    fn expect_lbracket(&mut self) -> Result<Token, ParseError> {
        match self.peek().kind {
            TokenKind::LBracket => Ok(self.advance()),
            ref other => Err(self.error(format!("expected '[', got {:?}", other))),
        }
    }

    fn at_rbracket(&self) -> bool {
        matches!(self.peek().kind, TokenKind::RBracket)
    }

    fn expect_rbracket(&mut self) -> Result<Token, ParseError> {
        match self.peek().kind {
            TokenKind::RBracket => Ok(self.advance()),
            ref other => Err(self.error(format!("expected ']', got {:?}", other))),
        }
    }

    fn at_rparen(&self) -> bool {
        matches!(self.peek().kind, TokenKind::RParen)
    }

    fn skip_comma(&mut self) {
        if matches!(self.peek().kind, TokenKind::Comma) {
            self.advance();
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier, got {:?}", other))),
        }
    }

    fn expect_keyword_marker(&mut self) -> Result<String, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::KeywordMarker(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected attribute key, got {:?}", other))),
        }
    }

    fn expect_version_marker(&mut self) -> Result<Version, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::VersionMarker(text) => {
                self.advance();
                Ok(parse_version(&text)?)
            }
            other => Err(self.error(format!("expected version marker, got {:?}", other))),
        }
    }

    fn expect_bool(&mut self) -> Result<bool, ParseError> {
        match self.peek().kind {
            TokenKind::Boolean(b) => {
                self.advance();
                Ok(b)
            }
            ref other => Err(self.error(format!("expected boolean, got {:?}", other))),
        }
    }

    fn expect_string(&mut self) -> Result<String, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::String(text) => {
                self.advance();
                Ok(unescape_string_token(&text))
            }
            other => Err(self.error(format!("expected string literal, got {:?}", other))),
        }
    }

    fn parse_dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.expect_identifier()?;
        while matches!(self.peek().kind, TokenKind::Dot) {
            self.advance();
            name.push('.');
            name.push_str(&self.expect_identifier()?);
        }
        Ok(name)
    }

    fn parse_dotted_list(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect_lbracket()?;
        let mut items = Vec::new();
        while !self.at_rbracket() {
            items.push(self.parse_dotted_name()?);
            self.skip_comma();
        }
        self.expect_rbracket()?;
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Module / declarations
    // ------------------------------------------------------------------

    fn parse_module(&mut self) -> Result<Module, ParseError> {
        self.expect_lparen()?;
        let head = self.expect_identifier()?;
        if head != "mod" {
            return Err(self.error(format!("expected 'mod', got '{}'", head)));
        }
        let name = self.expect_identifier()?;
        let mut elements = Vec::new();
        while !self.at_rparen() {
            elements.push(self.parse_element()?);
        }
        self.expect_rparen()?;
        Ok(Module { name, elements })
    }

    fn parse_element(&mut self) -> Result<ModuleElement, ParseError> {
        let start = self.peek().start;
        self.expect_lparen()?;
        let head = self.expect_identifier()?;
        let element = match head.as_str() {
            "fn" => ModuleElement::Function(self.parse_function(start)?),
            "type" => ModuleElement::TypeDef(self.parse_type(start)?),
            "role" => ModuleElement::Role(self.parse_role(start)?),
            "permission" => ModuleElement::Permission(self.parse_permission(start)?),
            "policy" => ModuleElement::Policy(self.parse_policy(start)?),
            "channel" => {
                self.skip_balanced()?;
                ModuleElement::Channel
            }
            "contract" => {
                self.skip_balanced()?;
                ModuleElement::Contract
            }
            "import" => {
                self.skip_balanced()?;
                ModuleElement::Import
            }
            "export" => {
                self.skip_balanced()?;
                ModuleElement::Export
            }
            other => return Err(self.error(format!("expected element, got '{}'", other))),
        };
        Ok(element)
    }

    /// Skip tokens up to and including the matching ')' for a form whose
    /// opening '(' and head identifier have already been consumed. Used
    /// for the reserved, not-yet-specified element kinds.
    fn skip_balanced(&mut self) -> Result<(), ParseError> {
        let mut depth = 1usize;
        loop {
            match self.peek().kind {
                TokenKind::LParen => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RParen => {
                    depth -= 1;
                    self.advance();
                    if depth == 0 {
                        return Ok(());
                    }
                }
                TokenKind::Eof => return Err(self.error("unexpected end of input")),
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn span_since(&self, start: Position) -> Span {
        let end = self.tokens[self.pos.saturating_sub(1).min(self.tokens.len() - 1)].end;
        Span::new(start, end)
    }

    fn parse_function(&mut self, start: Position) -> Result<FunctionDef, ParseError> {
        let name = self.expect_identifier()?;
        let mut version = VersionInfo::new(Version::new(0, 0, 0));
        let mut pure = false;
        let mut idempotent = false;
        let mut required_roles = Vec::new();
        let mut required_permissions = Vec::new();
        let mut effects = Vec::new();
        let mut handles_secrets = false;
        let mut audit_required = false;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut body: Option<Vec<Expr>> = None;

        while !self.at_rparen() {
            match self.peek().kind.clone() {
                TokenKind::VersionMarker(text) => {
                    self.advance();
                    version.version = parse_version(&text)?;
                }
                TokenKind::KeywordMarker(key) => {
                    self.advance();
                    match key.as_str() {
                        "pure" => pure = self.expect_bool()?,
                        "idempotent" => idempotent = self.expect_bool()?,
                        "requires" => required_roles = self.parse_dotted_list()?,
                        "permissions" => required_permissions = self.parse_dotted_list()?,
                        "handles_secrets" => handles_secrets = self.expect_bool()?,
                        "audit_required" => audit_required = self.expect_bool()?,
                        "stability" => {
                            let word = self.expect_identifier()?;
                            version.stability = Stability::from_keyword(&word)
                                .ok_or_else(|| self.error(format!("unknown stability '{}'", word)))?;
                        }
                        "replaces" => version.replaces = Some(self.expect_version_marker()?),
                        "rollback_safe" => version.rollback_safe = Some(self.expect_bool()?),
                        "deprecated" => version.deprecated = Some(self.expect_bool()?),
                        "effects" => effects = self.parse_effects_list()?,
                        "inputs" => inputs = self.parse_param_list()?,
                        "outputs" => outputs = self.parse_param_list()?,
                        other => return Err(self.error(format!("unknown function attribute ':{}'", other))),
                    }
                }
                TokenKind::LParen => {
                    body = Some(self.parse_body_form()?);
                    if !self.at_rparen() {
                        return Err(self.error("'body' must be the last attribute in a function form"));
                    }
                }
                ref other => return Err(self.error(format!("unexpected token in function form: {:?}", other))),
            }
        }
        self.expect_rparen()?;

        let body = body.ok_or_else(|| ParseError {
            message: format!("function '{}' has no body", name),
            span: self.span_since(start),
        })?;

        Ok(FunctionDef {
            name,
            version,
            pure,
            idempotent,
            required_roles,
            required_permissions,
            effects,
            handles_secrets,
            audit_required,
            inputs,
            outputs,
            body,
            span: self.span_since(start),
        })
    }

    fn parse_body_form(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect_lparen()?;
        let head = self.expect_identifier()?;
        if head != "body" {
            return Err(self.error(format!("expected 'body', got '{}'", head)));
        }
        let mut exprs = Vec::new();
        while !self.at_rparen() {
            exprs.push(self.parse_expr()?);
        }
        self.expect_rparen()?;
        Ok(exprs)
    }

    fn parse_effects_list(&mut self) -> Result<Vec<EffectDecl>, ParseError> {
        self.expect_lbracket()?;
        let mut effects = Vec::new();
        while !self.at_rbracket() {
            self.expect_lparen()?;
            let effect_type = self.parse_dotted_name()?;
            let target = self.parse_dotted_name()?;
            self.expect_rparen()?;
            effects.push(EffectDecl { effect_type, target });
            self.skip_comma();
        }
        self.expect_rbracket()?;
        Ok(effects)
    }

    fn parse_param_list(&mut self) -> Result<Vec<Param>, ParseError> {
        self.expect_lbracket()?;
        let mut params = Vec::new();
        while !self.at_rbracket() {
            self.expect_lparen()?;
            let name = self.expect_identifier()?;
            let type_expr = self.parse_type_expr()?;
            let optional = if matches!(self.peek().kind, TokenKind::Question) {
                self.advance();
                true
            } else {
                false
            };
            self.expect_rparen()?;
            params.push(Param {
                name,
                type_expr,
                optional,
            });
            self.skip_comma();
        }
        self.expect_rbracket()?;
        Ok(params)
    }

    fn parse_type_expr(&mut self) -> Result<TypeExpr, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::LParen => {
                self.advance();
                let name = self.expect_identifier()?;
                let kind = generic_kind(&name)
                    .ok_or_else(|| self.error(format!("unknown generic type '{}'", name)))?;
                let mut args = Vec::new();
                while !self.at_rparen() {
                    args.push(self.parse_type_expr()?);
                }
                self.expect_rparen()?;
                Ok(TypeExpr::Generic { kind, args })
            }
            TokenKind::KeywordMarker(name) => {
                self.advance();
                Ok(primitive_or_named(&name))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(primitive_or_named(&name))
            }
            other => Err(self.error(format!("expected type expression, got {:?}", other))),
        }
    }

    fn parse_role(&mut self, start: Position) -> Result<RoleDef, ParseError> {
        let name = self.expect_identifier()?;
        let mut permissions = Vec::new();
        let mut parents = Vec::new();
        while !self.at_rparen() {
            let key = self.expect_keyword_marker()?;
            match key.as_str() {
                "permissions" => permissions = self.parse_dotted_list()?,
                "parents" => parents = self.parse_dotted_list()?,
                other => return Err(self.error(format!("unknown role attribute ':{}'", other))),
            }
        }
        self.expect_rparen()?;
        Ok(RoleDef {
            name,
            permissions,
            parents,
            span: self.span_since(start),
        })
    }

    fn parse_permission(&mut self, start: Position) -> Result<PermissionDef, ParseError> {
        let name = self.expect_identifier()?;
        let mut doc = None;
        let mut scope = Vec::new();
        let mut classification = None;
        let mut audit_required = false;
        while !self.at_rparen() {
            let key = self.expect_keyword_marker()?;
            match key.as_str() {
                "doc" => doc = Some(self.expect_string()?),
                "scope" => scope = self.parse_scope_list()?,
                "classification" => classification = Some(self.parse_classification()?),
                "audit_required" => audit_required = self.expect_bool()?,
                other => return Err(self.error(format!("unknown permission attribute ':{}'", other))),
            }
        }
        self.expect_rparen()?;
        Ok(PermissionDef {
            name,
            doc,
            scope,
            classification,
            audit_required,
            span: self.span_since(start),
        })
    }

    fn parse_scope_list(&mut self) -> Result<Vec<ScopeEntry>, ParseError> {
        self.expect_lbracket()?;
        let mut scope = Vec::new();
        while !self.at_rbracket() {
            self.expect_lparen()?;
            let kind_word = self.expect_identifier()?;
            let is_action = match kind_word.as_str() {
                "resource" => false,
                "action" => true,
                other => return Err(self.error(format!("expected 'resource' or 'action', got '{}'", other))),
            };
            let value = self.parse_dotted_name()?;
            self.expect_rparen()?;
            scope.push(ScopeEntry { is_action, value });
            self.skip_comma();
        }
        self.expect_rbracket()?;
        Ok(scope)
    }

    fn parse_classification(&mut self) -> Result<Classification, ParseError> {
        let word = self.expect_identifier()?;
        Classification::from_keyword(&word)
            .ok_or_else(|| self.error(format!("unknown classification '{}'", word)))
    }

    fn parse_policy(&mut self, start: Position) -> Result<PolicyDef, ParseError> {
        let name = self.expect_identifier()?;
        let mut rules = Vec::new();
        while !self.at_rparen() {
            self.expect_lparen()?;
            let head = self.expect_identifier()?;
            if head != "rule" {
                return Err(self.error(format!("expected 'rule', got '{}'", head)));
            }
            rules.push(self.parse_rule_attrs()?);
            self.expect_rparen()?;
        }
        self.expect_rparen()?;
        Ok(PolicyDef {
            name,
            rules,
            span: self.span_since(start),
        })
    }

    fn parse_rule_attrs(&mut self) -> Result<PolicyRule, ParseError> {
        let mut effect = None;
        let mut roles = Vec::new();
        let mut permissions = Vec::new();
        let mut version_constraint = RuleVersionConstraint::AllVersions;
        let mut reason = None;
        while !self.at_rparen() {
            let key = self.expect_keyword_marker()?;
            match key.as_str() {
                "effect" => {
                    let word = self.expect_identifier()?;
                    effect = Some(match word.as_str() {
                        "allow" => RuleEffect::Allow,
                        "deny" => RuleEffect::Deny,
                        other => return Err(self.error(format!("unknown rule effect '{}'", other))),
                    });
                }
                "roles" => roles = self.parse_dotted_list()?,
                "permissions" => permissions = self.parse_dotted_list()?,
                "versions" => version_constraint = self.parse_rule_version_constraint()?,
                "reason" => reason = Some(self.expect_string()?),
                other => return Err(self.error(format!("unknown rule attribute ':{}'", other))),
            }
        }
        Ok(PolicyRule {
            effect: effect.ok_or_else(|| self.error("rule missing ':effect'"))?,
            roles,
            permissions,
            version_constraint,
            reason,
        })
    }

    fn parse_rule_version_constraint(&mut self) -> Result<RuleVersionConstraint, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::Identifier(word) => {
                self.advance();
                match word.as_str() {
                    "all_versions" => Ok(RuleVersionConstraint::AllVersions),
                    "stable_only" => Ok(RuleVersionConstraint::StableOnly),
                    other => Err(self.error(format!("unknown version constraint '{}'", other))),
                }
            }
            TokenKind::LParen => {
                self.advance();
                let head = self.expect_identifier()?;
                match head.as_str() {
                    "specific" => {
                        self.expect_lbracket()?;
                        let mut versions = Vec::new();
                        while !self.at_rbracket() {
                            versions.push(self.expect_version_marker()?);
                            self.skip_comma();
                        }
                        self.expect_rbracket()?;
                        self.expect_rparen()?;
                        Ok(RuleVersionConstraint::Specific(versions))
                    }
                    "range" => {
                        let expr = self.expect_string()?;
                        self.expect_rparen()?;
                        Ok(RuleVersionConstraint::Range(expr))
                    }
                    other => Err(self.error(format!("unknown version constraint form '{}'", other))),
                }
            }
            other => Err(self.error(format!("expected version constraint, got {:?}", other))),
        }
    }

    fn parse_type(&mut self, start: Position) -> Result<TypeDef, ParseError> {
        let name = self.expect_identifier()?;
        let mut version = VersionInfo::new(Version::new(0, 0, 0));
        let mut fields = Vec::new();
        while !self.at_rparen() {
            match self.peek().kind.clone() {
                TokenKind::VersionMarker(text) => {
                    self.advance();
                    version.version = parse_version(&text)?;
                }
                TokenKind::KeywordMarker(key) => {
                    self.advance();
                    match key.as_str() {
                        "stability" => {
                            let word = self.expect_identifier()?;
                            version.stability = Stability::from_keyword(&word)
                                .ok_or_else(|| self.error(format!("unknown stability '{}'", word)))?;
                        }
                        "replaces" => version.replaces = Some(self.expect_version_marker()?),
                        "rollback_safe" => version.rollback_safe = Some(self.expect_bool()?),
                        "deprecated" => version.deprecated = Some(self.expect_bool()?),
                        other => return Err(self.error(format!("unknown type attribute ':{}'", other))),
                    }
                }
                TokenKind::LParen => {
                    self.advance();
                    let head = self.expect_identifier()?;
                    if head != "field" {
                        return Err(self.error(format!("expected 'field', got '{}'", head)));
                    }
                    let fname = self.expect_identifier()?;
                    let ftype = self.parse_type_expr()?;
                    let fclass = if matches!(self.peek().kind, TokenKind::KeywordMarker(ref k) if k == "classification")
                    {
                        self.advance();
                        Some(self.parse_classification()?)
                    } else {
                        None
                    };
                    self.expect_rparen()?;
                    fields.push(FieldDef {
                        name: fname,
                        type_expr: ftype,
                        classification: fclass,
                    });
                }
                ref other => return Err(self.error(format!("unexpected token in type form: {:?}", other))),
            }
        }
        self.expect_rparen()?;
        Ok(TypeDef {
            name,
            version,
            fields,
            span: self.span_since(start),
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::LParen => self.parse_paren_expr(),
            TokenKind::Number(text) => {
                self.advance();
                Ok(Expr::Literal(literal_from_number(&text)))
            }
            TokenKind::String(text) => {
                self.advance();
                Ok(Expr::Literal(Literal::Str(unescape_string_token(&text))))
            }
            TokenKind::Boolean(b) => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(b)))
            }
            TokenKind::Identifier(_) => self.parse_identifier_expr(),
            other => Err(self.error(format!("expected expression, got {:?}", other))),
        }
    }

    fn parse_identifier_expr(&mut self) -> Result<Expr, ParseError> {
        let mut parts = vec![self.expect_identifier()?];
        while matches!(self.peek().kind, TokenKind::Dot) {
            self.advance();
            parts.push(self.expect_identifier()?);
        }
        let version = if let TokenKind::VersionMarker(text) = self.peek().kind.clone() {
            self.advance();
            Some(parse_version(&text)?)
        } else {
            None
        };
        if parts.len() == 1 && version.is_none() {
            Ok(Expr::Identifier(parts.remove(0)))
        } else {
            Ok(Expr::QualifiedName { parts, version })
        }
    }

    fn parse_paren_expr(&mut self) -> Result<Expr, ParseError> {
        self.expect_lparen()?;
        let head_word = match self.peek().kind.clone() {
            TokenKind::Identifier(name) => name,
            ref other => return Err(self.error(format!("expected expression head, got {:?}", other))),
        };

        match head_word.as_str() {
            "if" => {
                self.advance();
                let cond = self.parse_expr()?;
                let then_branch = self.parse_expr()?;
                let else_branch = self.parse_expr()?;
                self.expect_rparen()?;
                Ok(Expr::If {
                    cond: Box::new(cond),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                })
            }
            "cond" => {
                self.advance();
                let mut clauses = Vec::new();
                let mut default = None;
                while !self.at_rparen() {
                    self.expect_lparen()?;
                    if matches!(self.peek().kind, TokenKind::Identifier(ref w) if w == "else") {
                        self.advance();
                        default = Some(Box::new(self.parse_expr()?));
                    } else {
                        let c = self.parse_expr()?;
                        let e = self.parse_expr()?;
                        clauses.push((c, e));
                    }
                    self.expect_rparen()?;
                }
                self.expect_rparen()?;
                Ok(Expr::Cond { clauses, default })
            }
            "match" => {
                self.advance();
                let scrutinee = Box::new(self.parse_expr()?);
                let mut cases = Vec::new();
                while !self.at_rparen() {
                    self.expect_lparen()?;
                    let pattern = self.parse_pattern()?;
                    let body = Box::new(self.parse_expr()?);
                    self.expect_rparen()?;
                    cases.push(MatchCase { pattern, body });
                }
                self.expect_rparen()?;
                Ok(Expr::Match { scrutinee, cases })
            }
            "let" => {
                self.advance();
                self.expect_lparen()?;
                let mut bindings = Vec::new();
                while !self.at_rparen() {
                    self.expect_lparen()?;
                    let name = self.expect_identifier()?;
                    let value = self.parse_expr()?;
                    self.expect_rparen()?;
                    bindings.push((name, value));
                }
                self.expect_rparen()?;
                let mut body = Vec::new();
                while !self.at_rparen() {
                    body.push(self.parse_expr()?);
                }
                self.expect_rparen()?;
                Ok(Expr::Let { bindings, body })
            }
            "do" => {
                self.advance();
                let mut body = Vec::new();
                while !self.at_rparen() {
                    body.push(self.parse_expr()?);
                }
                self.expect_rparen()?;
                Ok(Expr::Do(body))
            }
            "lambda" => {
                self.advance();
                while !self.at_rparen() {
                    if matches!(self.peek().kind, TokenKind::LParen) {
                        self.skip_balanced_inner()?;
                    } else {
                        self.advance();
                    }
                }
                self.expect_rparen()?;
                Ok(Expr::Lambda)
            }
            _ => {
                let target = self.parse_call_target()?;
                let version = if let TokenKind::VersionMarker(text) = self.peek().kind.clone() {
                    self.advance();
                    Some(parse_version(&text)?)
                } else {
                    None
                };
                let mut args = Vec::new();
                while !self.at_rparen() {
                    args.push(self.parse_expr()?);
                }
                self.expect_rparen()?;
                Ok(classify_call(target, version, args))
            }
        }
    }

    /// Consume one balanced `( ... )` group, used while skipping a reserved
    /// lambda body's internals.
    fn skip_balanced_inner(&mut self) -> Result<(), ParseError> {
        self.expect_lparen()?;
        let mut depth = 1usize;
        loop {
            match self.peek().kind {
                TokenKind::LParen => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RParen => {
                    depth -= 1;
                    self.advance();
                    if depth == 0 {
                        return Ok(());
                    }
                }
                TokenKind::Eof => return Err(self.error("unexpected end of input")),
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn parse_call_target(&mut self) -> Result<CallTarget, ParseError> {
        let mut parts = vec![self.expect_identifier()?];
        while matches!(self.peek().kind, TokenKind::Dot) {
            self.advance();
            parts.push(self.expect_identifier()?);
        }
        if parts.len() == 1 {
            Ok(CallTarget::Name(parts.remove(0)))
        } else {
            Ok(CallTarget::Qualified(parts))
        }
    }

    fn parse_pattern(&mut self) -> Result<Pattern, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                if name == "_" {
                    Ok(Pattern::Wildcard)
                } else if matches!(self.peek().kind, TokenKind::Dot) {
                    self.advance();
                    let case = self.expect_identifier()?;
                    Ok(Pattern::Constructor {
                        type_name: name,
                        case,
                    })
                } else {
                    Ok(Pattern::Binding(name))
                }
            }
            TokenKind::Number(text) => {
                self.advance();
                Ok(Pattern::Literal(literal_from_number(&text)))
            }
            TokenKind::String(text) => {
                self.advance();
                Ok(Pattern::Literal(Literal::Str(unescape_string_token(&text))))
            }
            TokenKind::Boolean(b) => {
                self.advance();
                Ok(Pattern::Literal(Literal::Bool(b)))
            }
            other => Err(self.error(format!("expected pattern, got {:?}", other))),
        }
    }
}

fn generic_kind(name: &str) -> Option<GenericKind> {
    match name {
        "List" | "list" => Some(GenericKind::List),
        "Map" | "map" => Some(GenericKind::Map),
        "Option" | "option" => Some(GenericKind::Option),
        "Result" | "result" => Some(GenericKind::Result),
        _ => None,
    }
}

fn primitive_or_named(name: &str) -> TypeExpr {
    match name {
        "int" => TypeExpr::Primitive(PrimitiveType::Int),
        "float" => TypeExpr::Primitive(PrimitiveType::Float),
        "string" => TypeExpr::Primitive(PrimitiveType::String),
        "bool" => TypeExpr::Primitive(PrimitiveType::Bool),
        "uuid" => TypeExpr::Primitive(PrimitiveType::Uuid),
        "timestamp" => TypeExpr::Primitive(PrimitiveType::Timestamp),
        "bytes" => TypeExpr::Primitive(PrimitiveType::Bytes),
        "json" => TypeExpr::Primitive(PrimitiveType::Json),
        "unit" => TypeExpr::Primitive(PrimitiveType::Unit),
        other => TypeExpr::Named(other.to_string()),
    }
}

fn literal_from_number(text: &str) -> Literal {
    if text.contains('.') {
        Literal::Float(text.parse::<f64>().unwrap_or(0.0))
    } else {
        Literal::Int(text.parse::<i64>().unwrap_or(0))
    }
}

/// Unescape a token's raw text (quotes included): strip the surrounding
/// quotes, then for every `\` take the following character literally. This
/// mirrors the lexer's "consume two characters, no interpretation" rule —
/// unescaping just drops the backslash rather than mapping `\n` to a
/// newline or similar.
fn unescape_string_token(raw: &str) -> String {
    let inner = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn classify_call(target: CallTarget, version: Option<Version>, args: Vec<Expr>) -> Expr {
    if version.is_none() && !target.is_qualified() {
        let name = target.joined();
        if let (Some(op), 2) = (binary_op(&name), args.len()) {
            let mut it = args.into_iter();
            let lhs = Box::new(it.next().unwrap());
            let rhs = Box::new(it.next().unwrap());
            return Expr::BinaryOp { op, lhs, rhs };
        }
        if let (Some(op), 1) = (unary_op(&name), args.len()) {
            let mut it = args.into_iter();
            let expr = Box::new(it.next().unwrap());
            return Expr::UnaryOp { op, expr };
        }
    }
    Expr::Call {
        target,
        version,
        args,
    }
}

fn binary_op(name: &str) -> Option<BinaryOperator> {
    use BinaryOperator::*;
    Some(match name {
        "+" => Add,
        "-" => Sub,
        "*" => Mul,
        "/" => Div,
        "%" => Mod,
        "=" => Eq,
        "!=" => Ne,
        "<" => Lt,
        "<=" => Le,
        ">" => Gt,
        ">=" => Ge,
        "and" => And,
        "or" => Or,
        _ => return None,
    })
}

fn unary_op(name: &str) -> Option<UnaryOperator> {
    match name {
        "-" => Some(UnaryOperator::Neg),
        "not" => Some(UnaryOperator::Not),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_function_round_trip_source() {
        let module = parse_module(
            "(mod test (fn get_answer :v1 :pure true :inputs [] :outputs [(result :int)] (body 42)))",
        )
        .unwrap();
        let f = module.functions().next().unwrap();
        assert_eq!(f.name, "get_answer");
        assert!(f.pure);
        assert_eq!(f.body, vec![Expr::Literal(Literal::Int(42))]);
    }

    #[test]
    fn parses_argument_arithmetic() {
        let module = parse_module(
            "(mod m (fn add :v1 :pure true :inputs [(a :int) (b :int)] :outputs [(r :int)] (body (+ a b))))",
        )
        .unwrap();
        let f = module.functions().next().unwrap();
        assert_eq!(f.inputs.len(), 2);
        match &f.body[0] {
            Expr::BinaryOp { op, .. } => assert_eq!(*op, BinaryOperator::Add),
            other => panic!("expected BinaryOp, got {:?}", other),
        }
    }

    #[test]
    fn parses_if_expression() {
        let module = parse_module(
            "(mod m (fn check :v1 :inputs [(x :int)] :outputs [(s :string)] (body (if (> x 10) \"big\" \"small\"))))",
        )
        .unwrap();
        let f = module.functions().next().unwrap();
        match &f.body[0] {
            Expr::If { .. } => {}
            other => panic!("expected If, got {:?}", other),
        }
    }

    #[test]
    fn requires_attribute_parses_role_list() {
        let module = parse_module(
            "(mod m (fn admin_only :v1 :requires [admin] :inputs [] :outputs [(s :string)] (body \"success\")))",
        )
        .unwrap();
        let f = module.functions().next().unwrap();
        assert_eq!(f.required_roles, vec!["admin".to_string()]);
    }

    #[test]
    fn function_without_body_is_hard_error() {
        let err = parse_module("(mod m (fn broken :v1 :inputs [] :outputs []))").unwrap_err();
        assert!(err.message.contains("no body"));
    }

    #[test]
    fn duplicate_attribute_last_wins() {
        let module = parse_module(
            "(mod m (fn f :v1 :pure true :pure false :inputs [] :outputs [] (body 1)))",
        )
        .unwrap();
        let f = module.functions().next().unwrap();
        assert!(!f.pure);
    }

    #[test]
    fn parses_role_with_parents_and_permissions() {
        let module = parse_module(
            "(mod m (role admin :permissions [data.access user.manage] :parents [user]))",
        )
        .unwrap();
        let r = module.roles().next().unwrap();
        assert_eq!(r.permissions, vec!["data.access", "user.manage"]);
        assert_eq!(r.parents, vec!["user"]);
    }

    #[test]
    fn parses_policy_with_allow_then_deny_rule() {
        let module = parse_module(
            "(mod m (policy p \
               (rule :effect allow :roles [user] :permissions [data.access] :versions all_versions) \
               (rule :effect deny :roles [user] :permissions [data.access] :versions all_versions)))",
        )
        .unwrap();
        let p = module.policies().next().unwrap();
        assert_eq!(p.rules.len(), 2);
        assert_eq!(p.rules[0].effect, RuleEffect::Allow);
        assert_eq!(p.rules[1].effect, RuleEffect::Deny);
    }

    #[test]
    fn parses_type_with_classified_field() {
        let module = parse_module(
            "(mod m (type account :v1 (field ssn :string :classification restricted) (field name :string)))",
        )
        .unwrap();
        let t = module.types().next().unwrap();
        assert_eq!(t.fields[0].classification, Some(Classification::Restricted));
        assert_eq!(t.max_classification(), Some(Classification::Restricted));
    }

    #[test]
    fn parses_match_expression_with_constructor_pattern() {
        let module = parse_module(
            "(mod m (fn f :v1 :inputs [(x :int)] :outputs [(s :string)] \
               (body (match x (Status.Ok \"ok\") (_ \"other\")))))",
        )
        .unwrap();
        let f = module.functions().next().unwrap();
        match &f.body[0] {
            Expr::Match { cases, .. } => {
                assert_eq!(cases.len(), 2);
                match &cases[0].pattern {
                    Pattern::Constructor { type_name, case } => {
                        assert_eq!(type_name, "Status");
                        assert_eq!(case, "Ok");
                    }
                    other => panic!("expected Constructor pattern, got {:?}", other),
                }
            }
            other => panic!("expected Match, got {:?}", other),
        }
    }

    #[test]
    fn lambda_is_parsed_but_reserved() {
        let module = parse_module(
            "(mod m (fn f :v1 :inputs [] :outputs [] (body (lambda (x) (+ x 1)))))",
        )
        .unwrap();
        let f = module.functions().next().unwrap();
        assert_eq!(f.body[0], Expr::Lambda);
    }
}
