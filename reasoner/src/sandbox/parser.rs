//! Recursive-descent parser for the script dialect.
//!
//! Anything outside the dialect (function or class definitions, lambdas,
//! exception handling, `return`) is rejected here with a syntax error, before
//! a single statement runs.

use crate::sandbox::ast::{BinOp, BoolOp, CmpOp, Expr, FPart, Stmt, StmtKind, Target, UnaryOp};
use crate::sandbox::error::ScriptError;
use crate::sandbox::lexer::{Token, TokenKind, tokenize};

const MAX_NESTING: usize = 64;

const KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const UNSUPPORTED_STATEMENTS: [&str; 13] = [
    "def", "class", "return", "try", "with", "raise", "global", "nonlocal", "del", "assert",
    "async", "yield", "lambda",
];

const AUG_OPS: [(&str, BinOp); 7] = [
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
];

/// Parse a whole script.
pub fn parse(source: &str, max_string_len: usize) -> Result<Vec<Stmt>, ScriptError> {
    let tokens = tokenize(source, max_string_len)?;
    let mut parser = Parser::new(tokens, max_string_len, 0);
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_string_len: usize,
    /// Added to token lines; used for expressions embedded in f-strings.
    line_offset: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, max_string_len: usize, line_offset: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            max_string_len,
            line_offset,
        }
    }

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let index = (self.pos + offset).min(self.tokens.len().saturating_sub(1));
        self.tokens
            .get(index)
            .map_or(&TokenKind::Eof, |token| &token.kind)
    }

    fn line(&self) -> usize {
        let index = self.pos.min(self.tokens.len().saturating_sub(1));
        self.tokens.get(index).map_or(1, |t| t.line) + self.line_offset
    }

    fn at_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), TokenKind::Punct(p) if *p == punct)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.at_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), ScriptError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{punct}'")))
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Name(n) if n == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ScriptError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{keyword}'")))
        }
    }

    fn expect_name(&mut self) -> Result<String, ScriptError> {
        match self.peek().clone() {
            TokenKind::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("expected a name")),
        }
    }

    fn error(&self, message: &str) -> ScriptError {
        ScriptError::Syntax {
            line: self.line(),
            message: message.to_string(),
        }
    }

    fn unexpected(&self, context: &str) -> ScriptError {
        let found = match self.peek() {
            TokenKind::Name(n) => format!("'{n}'"),
            TokenKind::Int(v) => v.to_string(),
            TokenKind::Float(v) => v.to_string(),
            TokenKind::Str(_) | TokenKind::FStr(_) => "string".to_string(),
            TokenKind::Punct(p) => format!("'{p}'"),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Indent => "indent".to_string(),
            TokenKind::Dedent => "dedent".to_string(),
            TokenKind::Eof => "end of input".to_string(),
        };
        self.error(&format!("{context}, found {found}"))
    }

    fn enter(&mut self) -> Result<(), ScriptError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("expression nesting is too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    // Statements

    fn program(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.pos += 1;
                }
                TokenKind::Indent => return Err(self.error("unexpected indent")),
                TokenKind::Dedent => {
                    self.pos += 1;
                }
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let line = self.line();
        if let TokenKind::Name(name) = self.peek() {
            let name = name.clone();
            if UNSUPPORTED_STATEMENTS.contains(&name.as_str()) {
                return Err(self.error(&format!("'{name}' is not supported in scripts")));
            }
            match name.as_str() {
                "if" => return Ok(vec![self.if_statement(line)?]),
                "for" => return Ok(vec![self.for_statement(line)?]),
                "while" => {
                    self.pos += 1;
                    let test = self.expr()?;
                    let body = self.block()?;
                    return Ok(vec![Stmt {
                        line,
                        kind: StmtKind::While { test, body },
                    }]);
                }
                "elif" | "else" | "except" | "finally" => {
                    return Err(self.error(&format!("'{name}' without a matching block")));
                }
                _ => {}
            }
        }
        self.simple_line()
    }

    fn if_statement(&mut self, line: usize) -> Result<Stmt, ScriptError> {
        self.expect_keyword("if")?;
        let mut branches = Vec::new();
        let test = self.expr()?;
        let body = self.block()?;
        branches.push((test, body));
        let mut orelse = Vec::new();
        loop {
            if self.eat_keyword("elif") {
                let test = self.expr()?;
                let body = self.block()?;
                branches.push((test, body));
            } else if self.eat_keyword("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            line,
            kind: StmtKind::If { branches, orelse },
        })
    }

    fn for_statement(&mut self, line: usize) -> Result<Stmt, ScriptError> {
        self.expect_keyword("for")?;
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.expr_list()?;
        let body = self.block()?;
        Ok(Stmt {
            line,
            kind: StmtKind::For { target, iter, body },
        })
    }

    /// `:` followed by either an indented block or simple statements on the
    /// same line.
    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect_punct(":")?;
        self.enter()?;
        let body = if matches!(self.peek(), TokenKind::Newline) {
            self.pos += 1;
            if !matches!(self.peek(), TokenKind::Indent) {
                return Err(self.error("expected an indented block"));
            }
            self.pos += 1;
            let mut body = Vec::new();
            loop {
                match self.peek() {
                    TokenKind::Dedent => {
                        self.pos += 1;
                        break;
                    }
                    TokenKind::Eof => break,
                    TokenKind::Newline => {
                        self.pos += 1;
                    }
                    TokenKind::Indent => return Err(self.error("unexpected indent")),
                    _ => body.extend(self.statement()?),
                }
            }
            body
        } else {
            self.simple_line()?
        };
        self.leave();
        Ok(body)
    }

    fn simple_line(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            stmts.extend(self.simple_statement()?);
            if self.eat_punct(";") {
                if matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
                    break;
                }
                continue;
            }
            break;
        }
        match self.peek() {
            TokenKind::Newline => {
                self.pos += 1;
                Ok(stmts)
            }
            TokenKind::Eof | TokenKind::Dedent => Ok(stmts),
            _ => Err(self.unexpected("expected end of statement")),
        }
    }

    fn simple_statement(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let line = self.line();
        let single = |kind| Ok(vec![Stmt { line, kind }]);
        if self.eat_keyword("pass") {
            return single(StmtKind::Pass);
        }
        if self.eat_keyword("break") {
            return single(StmtKind::Break);
        }
        if self.eat_keyword("continue") {
            return single(StmtKind::Continue);
        }
        if self.at_keyword("import") || self.at_keyword("from") {
            return self.import_statement(line);
        }
        if let TokenKind::Name(name) = self.peek()
            && UNSUPPORTED_STATEMENTS.contains(&name.as_str())
        {
            let name = name.clone();
            return Err(self.error(&format!("'{name}' is not supported in scripts")));
        }

        let first = self.expr_list()?;

        for (punct, op) in AUG_OPS {
            if self.eat_punct(punct) {
                let target = self.to_target(first)?;
                if matches!(target, Target::Unpack(_)) {
                    return Err(self.error("illegal target for augmented assignment"));
                }
                let value = self.expr_list()?;
                return single(StmtKind::AugAssign(target, op, value));
            }
        }

        // Annotated assignment: the annotation is parsed and dropped.
        if matches!(first, Expr::Name(_)) && self.eat_punct(":") {
            self.expr()?;
            if self.eat_punct("=") {
                let target = self.to_target(first)?;
                let value = self.expr_list()?;
                return single(StmtKind::Assign(vec![target], value));
            }
            return single(StmtKind::Pass);
        }

        if self.at_punct("=") {
            let mut chain = vec![first];
            while self.eat_punct("=") {
                chain.push(self.expr_list()?);
            }
            let value = chain.pop().ok_or_else(|| self.error("missing value"))?;
            let targets = chain
                .into_iter()
                .map(|expr| self.to_target(expr))
                .collect::<Result<Vec<_>, _>>()?;
            return single(StmtKind::Assign(targets, value));
        }

        single(StmtKind::Expr(first))
    }

    fn import_statement(&mut self, line: usize) -> Result<Vec<Stmt>, ScriptError> {
        if self.eat_keyword("import") {
            let mut stmts = Vec::new();
            loop {
                let module = self.dotted_name()?;
                let local = if self.eat_keyword("as") {
                    self.expect_name()?
                } else {
                    module.split('.').next().unwrap_or_default().to_string()
                };
                stmts.push(Stmt {
                    line,
                    kind: StmtKind::Import {
                        module,
                        bindings: vec![(local, None)],
                    },
                });
                if !self.eat_punct(",") {
                    break;
                }
            }
            return Ok(stmts);
        }

        self.expect_keyword("from")?;
        let module = self.dotted_name()?;
        self.expect_keyword("import")?;
        if self.at_punct("*") {
            return Err(self.error("wildcard imports are not supported"));
        }
        let parenthesized = self.eat_punct("(");
        let mut bindings = Vec::new();
        loop {
            let member = self.expect_name()?;
            let local = if self.eat_keyword("as") {
                self.expect_name()?
            } else {
                member.clone()
            };
            bindings.push((local, Some(member)));
            if !self.eat_punct(",") {
                break;
            }
            if parenthesized && self.at_punct(")") {
                break;
            }
        }
        if parenthesized {
            self.expect_punct(")")?;
        }
        Ok(vec![Stmt {
            line,
            kind: StmtKind::Import { module, bindings },
        }])
    }

    fn dotted_name(&mut self) -> Result<String, ScriptError> {
        let mut name = self.expect_name()?;
        while self.eat_punct(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn to_target(&self, expr: Expr) -> Result<Target, ScriptError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Unpack(
                items
                    .into_iter()
                    .map(|item| self.to_target(item))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Index(container, key) => {
                let mut keys = vec![*key];
                let mut current = *container;
                loop {
                    match current {
                        Expr::Name(name) => {
                            keys.reverse();
                            return Ok(Target::Item(name, keys));
                        }
                        Expr::Index(inner, key) => {
                            keys.push(*key);
                            current = *inner;
                        }
                        _ => return Err(self.error("only items of a named value can be assigned")),
                    }
                }
            }
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    /// Loop targets stop at `in`, so they are parsed below comparison level.
    fn target_list(&mut self) -> Result<Target, ScriptError> {
        let first = self.arith()?;
        if !self.at_punct(",") {
            return self.to_target(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            if self.at_keyword("in") {
                break;
            }
            items.push(self.arith()?);
        }
        self.to_target(Expr::Tuple(items))
    }

    // Expressions

    fn starts_expr(&self) -> bool {
        match self.peek() {
            TokenKind::Name(n) => !matches!(
                n.as_str(),
                "in" | "for" | "if" | "else" | "and" | "or" | "is" | "as"
            ),
            TokenKind::Int(_) | TokenKind::Float(_) | TokenKind::Str(_) | TokenKind::FStr(_) => {
                true
            }
            TokenKind::Punct(p) => matches!(*p, "(" | "[" | "{" | "-" | "+"),
            _ => false,
        }
    }

    /// Comma-separated expressions; more than one (or a trailing comma) forms
    /// a tuple.
    fn expr_list(&mut self) -> Result<Expr, ScriptError> {
        let first = self.expr()?;
        if !self.at_punct(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            if !self.starts_expr() {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        self.enter()?;
        let result = self.conditional();
        self.leave();
        result
    }

    fn conditional(&mut self) -> Result<Expr, ScriptError> {
        if self.at_keyword("lambda") {
            return Err(self.error("'lambda' is not supported in scripts"));
        }
        let body = self.or_test()?;
        if self.at_keyword("if") {
            // `x for x in xs if cond` belongs to the comprehension.
            let save = self.pos;
            self.pos += 1;
            let test = self.or_test()?;
            if !self.eat_keyword("else") {
                self.pos = save;
                return Ok(body);
            }
            let orelse = self.expr()?;
            return Ok(Expr::Conditional {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn or_test(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and_test()?;
        while self.eat_keyword("or") {
            let right = self.and_test()?;
            left = Expr::Logical(BoolOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_test(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.not_test()?;
        while self.eat_keyword("and") {
            let right = self.not_test()?;
            left = Expr::Logical(BoolOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_test(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_keyword("not") {
            self.enter()?;
            let operand = self.not_test();
            self.leave();
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), rest))
        }
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            TokenKind::Punct("==") => CmpOp::Eq,
            TokenKind::Punct("!=") => CmpOp::NotEq,
            TokenKind::Punct("<") => CmpOp::Lt,
            TokenKind::Punct("<=") => CmpOp::LtE,
            TokenKind::Punct(">") => CmpOp::Gt,
            TokenKind::Punct(">=") => CmpOp::GtE,
            TokenKind::Name(n) if n == "in" => CmpOp::In,
            TokenKind::Name(n) if n == "not" => {
                if !matches!(self.peek_at(1), TokenKind::Name(next) if next == "in") {
                    return None;
                }
                self.pos += 2;
                return Some(CmpOp::NotIn);
            }
            TokenKind::Name(n) if n == "is" => {
                self.pos += 1;
                if self.eat_keyword("not") {
                    return Some(CmpOp::IsNot);
                }
                return Some(CmpOp::Is);
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn arith(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat_punct("+") {
                BinOp::Add
            } else if self.eat_punct("-") {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.factor()?;
        loop {
            let op = if self.eat_punct("*") {
                BinOp::Mul
            } else if self.eat_punct("/") {
                BinOp::Div
            } else if self.eat_punct("//") {
                BinOp::FloorDiv
            } else if self.eat_punct("%") {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, ScriptError> {
        let op = if self.eat_punct("-") {
            Some(UnaryOp::Neg)
        } else if self.eat_punct("+") {
            Some(UnaryOp::Pos)
        } else {
            None
        };
        match op {
            Some(op) => {
                self.enter()?;
                let operand = self.factor();
                self.leave();
                Ok(Expr::Unary(op, Box::new(operand?)))
            }
            None => self.power(),
        }
    }

    /// `**` binds tighter than a unary minus on its left and is
    /// right-associative.
    fn power(&mut self) -> Result<Expr, ScriptError> {
        let base = self.postfix()?;
        if self.eat_punct("**") {
            self.enter()?;
            let exponent = self.factor();
            self.leave();
            return Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent?)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_punct("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_punct("[") {
                expr = self.subscript(expr)?;
            } else if self.eat_punct(".") {
                let name = self.expect_name()?;
                expr = Expr::Attribute(Box::new(expr), name);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.eat_punct(")") {
            if self.at_punct("*") || self.at_punct("**") {
                return Err(self.error("argument unpacking is not supported"));
            }
            let is_keyword = matches!(self.peek(), TokenKind::Name(_))
                && matches!(self.peek_at(1), TokenKind::Punct("="));
            if is_keyword {
                let name = self.expect_name()?;
                self.expect_punct("=")?;
                kwargs.push((name, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                let value = self.expr()?;
                if self.at_keyword("for") {
                    args.push(self.comprehension(value)?);
                } else {
                    args.push(value);
                }
            }
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn subscript(&mut self, target: Expr) -> Result<Expr, ScriptError> {
        let lower = if self.at_punct(":") {
            None
        } else {
            let index = self.expr()?;
            if self.eat_punct("]") {
                return Ok(Expr::Index(Box::new(target), Box::new(index)));
            }
            Some(Box::new(index))
        };
        self.expect_punct(":")?;
        let upper = if self.at_punct(":") || self.at_punct("]") {
            None
        } else {
            Some(Box::new(self.expr()?))
        };
        let step = if self.eat_punct(":") && !self.at_punct("]") {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        self.expect_punct("]")?;
        Ok(Expr::Slice {
            target: Box::new(target),
            lower,
            upper,
            step,
        })
    }

    fn comprehension(&mut self, element: Expr) -> Result<Expr, ScriptError> {
        self.expect_keyword("for")?;
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.or_test()?;
        let mut conditions = Vec::new();
        while self.eat_keyword("if") {
            conditions.push(self.or_test()?);
        }
        if self.at_keyword("for") {
            return Err(self.error("nested comprehension loops are not supported"));
        }
        Ok(Expr::Comprehension {
            element: Box::new(element),
            target,
            iter: Box::new(iter),
            conditions,
        })
    }

    fn atom(&mut self) -> Result<Expr, ScriptError> {
        match self.peek().clone() {
            TokenKind::Int(v) => {
                self.pos += 1;
                Ok(Expr::Int(v))
            }
            TokenKind::Float(v) => {
                self.pos += 1;
                Ok(Expr::Float(v))
            }
            TokenKind::Str(_) | TokenKind::FStr(_) => self.string_atom(),
            TokenKind::Name(name) => {
                self.pos += 1;
                match name.as_str() {
                    "True" => Ok(Expr::Bool(true)),
                    "False" => Ok(Expr::Bool(false)),
                    "None" => Ok(Expr::None),
                    "lambda" => Err(self.error("'lambda' is not supported in scripts")),
                    kw if KEYWORDS.contains(&kw) => {
                        self.pos -= 1;
                        Err(self.unexpected("invalid syntax"))
                    }
                    _ => Ok(Expr::Name(name)),
                }
            }
            TokenKind::Punct("(") => {
                self.pos += 1;
                if self.eat_punct(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expr()?;
                if self.at_keyword("for") {
                    let comp = self.comprehension(first)?;
                    self.expect_punct(")")?;
                    return Ok(comp);
                }
                if self.eat_punct(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_punct(",") {
                    if self.at_punct(")") {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect_punct(")")?;
                Ok(Expr::Tuple(items))
            }
            TokenKind::Punct("[") => {
                self.pos += 1;
                if self.eat_punct("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expr()?;
                if self.at_keyword("for") {
                    let comp = self.comprehension(first)?;
                    self.expect_punct("]")?;
                    return Ok(comp);
                }
                let mut items = vec![first];
                while self.eat_punct(",") {
                    if self.at_punct("]") {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect_punct("]")?;
                Ok(Expr::List(items))
            }
            TokenKind::Punct("{") => {
                self.pos += 1;
                let mut entries = Vec::new();
                while !self.eat_punct("}") {
                    let key = self.expr()?;
                    if !self.eat_punct(":") {
                        return Err(self.error("set literals are not supported"));
                    }
                    let value = self.expr()?;
                    if self.at_keyword("for") {
                        return Err(self.error("dict comprehensions are not supported"));
                    }
                    entries.push((key, value));
                    if !self.eat_punct(",") {
                        self.expect_punct("}")?;
                        break;
                    }
                }
                Ok(Expr::Dict(entries))
            }
            _ => Err(self.unexpected("invalid syntax")),
        }
    }

    /// Adjacent string literals concatenate; any f-string among them makes the
    /// whole atom an f-string.
    fn string_atom(&mut self) -> Result<Expr, ScriptError> {
        let mut parts = Vec::new();
        let mut formatted = false;
        loop {
            match self.peek().clone() {
                TokenKind::Str(s) => {
                    self.pos += 1;
                    parts.push(FPart::Literal(s));
                }
                TokenKind::FStr(body) => {
                    let line = self.line();
                    self.pos += 1;
                    formatted = true;
                    parts.extend(self.fstring_parts(&body, line)?);
                }
                _ => break,
            }
        }
        if formatted {
            return Ok(Expr::FString(parts));
        }
        let text = parts
            .into_iter()
            .map(|part| match part {
                FPart::Literal(s) => s,
                FPart::Field { .. } => String::new(),
            })
            .collect();
        Ok(Expr::Str(text))
    }

    fn fstring_parts(&self, body: &str, line: usize) -> Result<Vec<FPart>, ScriptError> {
        let syntax = |message: &str| ScriptError::Syntax {
            line,
            message: message.to_string(),
        };
        let chars: Vec<char> = body.chars().collect();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '{' && chars.get(i + 1) == Some(&'{') {
                literal.push('{');
                i += 2;
                continue;
            }
            if c == '}' && chars.get(i + 1) == Some(&'}') {
                literal.push('}');
                i += 2;
                continue;
            }
            if c == '}' {
                return Err(syntax("single '}' is not allowed in f-string"));
            }
            if c != '{' {
                literal.push(c);
                i += 1;
                continue;
            }

            let start = i + 1;
            let mut depth = 0usize;
            let mut quote: Option<char> = None;
            let mut split = None;
            let mut end = None;
            let mut j = start;
            while j < chars.len() {
                let ch = chars[j];
                match quote {
                    Some(q) if ch == q => quote = None,
                    Some(_) => {}
                    None => match ch {
                        '\'' | '"' => quote = Some(ch),
                        '(' | '[' | '{' => depth += 1,
                        ')' | ']' => depth = depth.saturating_sub(1),
                        '}' if depth > 0 => depth -= 1,
                        '}' => {
                            end = Some(j);
                            break;
                        }
                        ':' if depth == 0 && split.is_none() => split = Some(j),
                        _ => {}
                    },
                }
                j += 1;
            }
            let end = end.ok_or_else(|| syntax("f-string field is missing a closing '}'"))?;
            let expr_end = split.unwrap_or(end);
            let mut expr_text: String = chars[start..expr_end].iter().collect();
            for conversion in ["!r", "!s", "!a"] {
                if let Some(stripped) = expr_text.trim_end().strip_suffix(conversion) {
                    expr_text = stripped.to_string();
                }
            }
            let spec = split.map(|s| chars[s + 1..end].iter().collect::<String>());
            if expr_text.trim().is_empty() {
                return Err(syntax("f-string field is empty"));
            }

            if !literal.is_empty() {
                parts.push(FPart::Literal(unescape(&std::mem::take(&mut literal))));
            }
            let expr = self.embedded_expr(expr_text.trim(), line)?;
            parts.push(FPart::Field { expr, spec });
            i = end + 1;
        }
        if !literal.is_empty() {
            parts.push(FPart::Literal(unescape(&literal)));
        }
        Ok(parts)
    }

    fn embedded_expr(&self, text: &str, line: usize) -> Result<Expr, ScriptError> {
        let mut tokens = tokenize(text, self.max_string_len)?;
        for token in &mut tokens {
            token.line = 0;
        }
        let mut inner = Parser::new(tokens, self.max_string_len, line);
        inner.depth = self.depth;
        let expr = inner.expr()?;
        if !matches!(inner.peek(), TokenKind::Newline | TokenKind::Eof) {
            return Err(inner.unexpected("invalid f-string expression"));
        }
        Ok(expr)
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
