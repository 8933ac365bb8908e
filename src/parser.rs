// Recursive-descent parser feeding the tree-walking Interpreter.
//
// Unlike the Compiler, which parses tokens straight into bytecode
// with a Pratt table, this path builds an explicit AST: `Expression ->
// Equality -> Comparison -> Term -> Factor -> Unary -> Call -> Primary`,
// plus assignment and the `and`/`or` logical forms sitting above
// equality so `if`/`while` conditions and assignment statements parse
// the same way they do in the bytecode grammar.

use std::rc::Rc;

use crate::ast::{Expr, FunctionDecl, QueryBody, QueryHeader, Stmt, TypeTag as AstTypeTag};
use crate::error::{Error, LexError, ParseError};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    errors: Vec<ParseError>,
    panic_mode: bool,
}

// Parse a whole program into the statement list the Interpreter's
// `Execute` walks.
pub fn parse_program(source: &str) -> Result<Vec<Stmt>, Error> {
    let mut parser = Parser::new(source)?;
    let mut statements = Vec::new();
    while !parser.check(TokenKind::Eof) {
        match parser.declaration() {
            Ok(stmt) => statements.push(stmt),
            Err(()) => parser.synchronize(),
        }
    }
    parser.finish(statements)
}

// Parse a single expression, e.g. for the query surface's bare-`{ expr
// }` body or for the test harness's `Interpreter::evaluate`-style
// scenarios.
pub fn parse_expression(source: &str) -> Result<Expr, Error> {
    let mut parser = Parser::new(source)?;
    let expr = match parser.expression() {
        Ok(expr) => expr,
        Err(()) => return Err(parser.errors.remove(0).into()),
    };
    parser.consume(TokenKind::Eof, "expected end of input after expression").ok();
    parser.finish(expr)
}

// `[ NAME ] ( (TYPE NAME)* )? { EXPR-or-STATEMENTS }` ("Query-surface
// tokens"). NAME is every token up to the closing `]`, not a single
// Identifier -- multi-word query names like `[80s Pop]` and
// `[By Composer]` would not parse as a single Identifier token.
pub fn parse_query_header(source: &str) -> Result<QueryHeader, Error> {
    let mut parser = Parser::new(source)?;
    let header = match parser.query_header() {
        Ok(h) => h,
        Err(()) => return Err(parser.errors.remove(0).into()),
    };
    parser.finish(header)
}

impl Parser {
    fn new(source: &str) -> Result<Parser, Error> {
        let (tokens, all_valid) = Lexer::new(source).tokenize();
        if !all_valid {
            return Err(first_lex_error(&tokens));
        }
        Ok(Parser { tokens, current: 0, errors: Vec::new(), panic_mode: false })
    }

    fn finish<T>(mut self, value: T) -> Result<T, Error> {
        match self.errors.drain(..).next() {
            Some(err) => Err(err.into()),
            None => Ok(value),
        }
    }

    // ---- cursor ----

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> Token {
        if !self.check(TokenKind::Eof) {
            self.current += 1;
        }
        self.previous().clone()
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_at(&mut self, line: u32, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(ParseError::UnexpectedToken { line, message: message.into() });
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<(), ()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            let line = self.peek().line;
            self.error_at(line, message);
            Err(())
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            if matches!(self.peek_kind(), Fun | IntKw | StrKw | BoolKw | FunrefKw | If | While | For | Return | Print)
            {
                return;
            }
            self.advance();
        }
    }

    // ---- declarations & statements ----

    fn declaration(&mut self) -> Result<Stmt, ()> {
        if self.matches(TokenKind::Fun) {
            self.fun_declaration()
        } else if self.peek_kind().is_type_keyword() {
            let type_kind = self.advance().kind;
            self.var_declaration(type_kind)
        } else {
            self.statement()
        }
    }

    fn fun_declaration(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenKind::Identifier, "expected function name")?;
        let name = self.previous().lexeme.clone();
        let (params, body) = self.function_body()?;
        Ok(Stmt::FunDecl(Rc::new(FunctionDecl { name, params, body })))
    }

    fn function_body(&mut self) -> Result<(Vec<(AstTypeTag, String)>, Vec<Stmt>), ()> {
        self.consume(TokenKind::OpenParen, "expected '(' after function name")?;
        let params = self.parse_params(TokenKind::CloseParen)?;
        self.consume(TokenKind::CloseParen, "expected ')' after parameters")?;
        self.consume(TokenKind::OpenBrace, "expected '{' before function body")?;
        let body = self.block()?;
        Ok((params, body))
    }

    fn parse_params(&mut self, terminator: TokenKind) -> Result<Vec<(AstTypeTag, String)>, ()> {
        let mut params = Vec::new();
        if self.check(terminator) {
            return Ok(params);
        }
        loop {
            if !self.peek_kind().is_type_keyword() {
                let line = self.peek().line;
                self.error_at(line, "expected parameter type");
                return Err(());
            }
            let type_kind = self.advance().kind;
            self.consume(TokenKind::Identifier, "expected parameter name")?;
            params.push((AstTypeTag::from_keyword(type_kind), self.previous().lexeme.clone()));
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn var_declaration(&mut self, type_kind: TokenKind) -> Result<Stmt, ()> {
        self.consume(TokenKind::Identifier, "expected variable name")?;
        let name = self.previous().lexeme.clone();
        let init = if self.matches(TokenKind::Assign) { Some(self.expression()?) } else { None };
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration")?;
        Ok(Stmt::VarDecl(AstTypeTag::from_keyword(type_kind), name, init))
    }

    fn statement(&mut self) -> Result<Stmt, ()> {
        if self.matches(TokenKind::Print) {
            self.print_statement()
        } else if self.matches(TokenKind::OpenBrace) {
            Ok(Stmt::Block(self.block()?))
        } else if self.matches(TokenKind::If) {
            self.if_statement()
        } else if self.matches(TokenKind::While) {
            self.while_statement()
        } else if self.matches(TokenKind::For) {
            self.for_statement()
        } else if self.matches(TokenKind::Return) {
            self.return_statement()
        } else {
            self.expression_statement()
        }
    }

    fn print_statement(&mut self) -> Result<Stmt, ()> {
        let expr = self.expression()?;
        self.consume(TokenKind::Semicolon, "expected ';' after print statement")?;
        Ok(Stmt::Print(expr))
    }

    fn expression_statement(&mut self) -> Result<Stmt, ()> {
        let expr = self.expression()?;
        self.consume(TokenKind::Semicolon, "expected ';' after expression")?;
        Ok(Stmt::Expr(expr))
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ()> {
        let mut statements = Vec::new();
        while !self.check(TokenKind::CloseBrace) && !self.check(TokenKind::Eof) {
            match self.declaration() {
                Ok(stmt) => statements.push(stmt),
                Err(()) => self.synchronize(),
            }
        }
        self.consume(TokenKind::CloseBrace, "expected '}' after block")?;
        Ok(statements)
    }

    fn if_statement(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenKind::OpenParen, "expected '(' after 'if'")?;
        let cond = self.expression()?;
        self.consume(TokenKind::CloseParen, "expected ')' after condition")?;
        let then_branch = Rc::new(self.statement()?);
        let else_branch =
            if self.matches(TokenKind::Else) { Some(Rc::new(self.statement()?)) } else { None };
        Ok(Stmt::If(cond, then_branch, else_branch))
    }

    fn while_statement(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenKind::OpenParen, "expected '(' after 'while'")?;
        let cond = self.expression()?;
        self.consume(TokenKind::CloseParen, "expected ')' after condition")?;
        let body = Rc::new(self.statement()?);
        Ok(Stmt::While(cond, body))
    }

    // Desugars into the same `{ init; while (cond) { body; step; } }`
    // shape as the bytecode compiler's for-loop desugaring,
    // except the step is appended to the loop body as a real statement
    // rather than emitted bytecode, since there's no jump/label
    // machinery in a tree-walker.
    fn for_statement(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenKind::OpenParen, "expected '(' after 'for'")?;

        let init = if self.matches(TokenKind::Semicolon) {
            None
        } else if self.peek_kind().is_type_keyword() {
            let type_kind = self.advance().kind;
            Some(self.var_declaration(type_kind)?)
        } else {
            Some(self.expression_statement()?)
        };

        let cond = if self.check(TokenKind::Semicolon) { Expr::Bool(true) } else { self.expression()? };
        self.consume(TokenKind::Semicolon, "expected ';' after loop condition")?;

        let step = if self.check(TokenKind::CloseParen) { None } else { Some(self.expression()?) };
        self.consume(TokenKind::CloseParen, "expected ')' after for clauses")?;

        let mut body = self.statement()?;
        if let Some(step) = step {
            body = Stmt::Block(vec![body, Stmt::Expr(step)]);
        }
        let mut loop_stmt = Stmt::While(cond, Rc::new(body));
        if let Some(init) = init {
            loop_stmt = Stmt::Block(vec![init, loop_stmt]);
        }
        Ok(loop_stmt)
    }

    fn return_statement(&mut self) -> Result<Stmt, ()> {
        if self.matches(TokenKind::Semicolon) {
            return Ok(Stmt::Return(None));
        }
        let expr = self.expression()?;
        self.consume(TokenKind::Semicolon, "expected ';' after return value")?;
        Ok(Stmt::Return(Some(expr)))
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<Expr, ()> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, ()> {
        let expr = self.or()?;
        if self.matches(TokenKind::Assign) {
            let line = self.previous().line;
            let value = self.assignment()?;
            return match expr {
                Expr::Id(name) => Ok(Expr::Assign(name, Rc::new(value))),
                _ => {
                    self.error_at(line, "invalid assignment target");
                    Err(())
                }
            };
        }
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, ()> {
        let mut expr = self.and()?;
        while self.matches(TokenKind::Or) {
            let right = self.and()?;
            expr = Expr::Logical(TokenKind::Or, Rc::new(expr), Rc::new(right));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr, ()> {
        let mut expr = self.equality()?;
        while self.matches(TokenKind::And) {
            let right = self.equality()?;
            expr = Expr::Logical(TokenKind::And, Rc::new(expr), Rc::new(right));
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr, ()> {
        let mut expr = self.comparison()?;
        while matches!(self.peek_kind(), TokenKind::IsEqual | TokenKind::NotEqual) {
            let op = self.advance().kind;
            let right = self.comparison()?;
            expr = Expr::Binary(op, Rc::new(expr), Rc::new(right));
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, ()> {
        let mut expr = self.term()?;
        while matches!(
            self.peek_kind(),
            TokenKind::GreaterThan | TokenKind::GreaterThanEqual | TokenKind::LessThan | TokenKind::LessThanEqual
        ) {
            let op = self.advance().kind;
            let right = self.term()?;
            expr = Expr::Binary(op, Rc::new(expr), Rc::new(right));
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr, ()> {
        let mut expr = self.factor()?;
        while matches!(self.peek_kind(), TokenKind::Plus | TokenKind::Minus) {
            let op = self.advance().kind;
            let right = self.factor()?;
            expr = Expr::Binary(op, Rc::new(expr), Rc::new(right));
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr, ()> {
        let mut expr = self.unary()?;
        while matches!(self.peek_kind(), TokenKind::Multiply | TokenKind::Divide | TokenKind::Modulo) {
            let op = self.advance().kind;
            let right = self.unary()?;
            expr = Expr::Binary(op, Rc::new(expr), Rc::new(right));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, ()> {
        if matches!(self.peek_kind(), TokenKind::Minus | TokenKind::Not) {
            let op = self.advance().kind;
            let right = self.unary()?;
            return Ok(Expr::Unary(op, Rc::new(right)));
        }
        self.call()
    }

    fn call(&mut self) -> Result<Expr, ()> {
        let mut expr = self.primary()?;
        while self.matches(TokenKind::OpenParen) {
            let args = self.argument_list()?;
            expr = Expr::Call(Rc::new(expr), args);
        }
        Ok(expr)
    }

    fn argument_list(&mut self) -> Result<Vec<Expr>, ()> {
        let mut args = Vec::new();
        if !self.check(TokenKind::CloseParen) {
            loop {
                args.push(self.expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::CloseParen, "expected ')' after arguments")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ()> {
        if self.matches(TokenKind::True) {
            return Ok(Expr::Bool(true));
        }
        if self.matches(TokenKind::False) {
            return Ok(Expr::Bool(false));
        }
        if self.matches(TokenKind::Number) {
            let lexeme = self.previous().lexeme.clone();
            let line = self.previous().line;
            if lexeme.contains('.') {
                // Rejected at parse time, same resolution as the
                // bytecode Compiler.
                self.errors.push(ParseError::FloatLiteralNotSupported { line });
                self.panic_mode = true;
                return Err(());
            }
            return match lexeme.parse::<i64>() {
                Ok(n) => Ok(Expr::Int(n)),
                Err(_) => {
                    self.error_at(line, "invalid integer literal");
                    Err(())
                }
            };
        }
        if self.matches(TokenKind::String) {
            return Ok(Expr::Str(self.previous().lexeme.clone()));
        }
        if self.matches(TokenKind::Identifier) {
            return Ok(Expr::Id(self.previous().lexeme.clone()));
        }
        if self.matches(TokenKind::OpenParen) {
            let expr = self.expression()?;
            self.consume(TokenKind::CloseParen, "expected ')' after expression")?;
            return Ok(expr);
        }
        let line = self.peek().line;
        self.error_at(line, "expected expression");
        Err(())
    }

    // ---- query surface ----

    fn query_header(&mut self) -> Result<QueryHeader, ()> {
        self.consume(TokenKind::OpenBracket, "expected '[' to start a query header")?;
        let mut name_parts = Vec::new();
        while !self.check(TokenKind::CloseBracket) && !self.check(TokenKind::Eof) {
            name_parts.push(self.advance().lexeme);
        }
        self.consume(TokenKind::CloseBracket, "expected ']' after query name")?;
        let name = name_parts.join(" ");

        let params = if self.matches(TokenKind::OpenParen) {
            let params = self.parse_params(TokenKind::CloseParen)?;
            self.consume(TokenKind::CloseParen, "expected ')' after query parameters")?;
            params
        } else {
            Vec::new()
        };

        self.consume(TokenKind::OpenBrace, "expected '{' before query body")?;
        let body = self.query_body()?;
        self.consume(TokenKind::CloseBrace, "expected '}' after query body")?;
        Ok(QueryHeader { name, params, body })
    }

    // A bare expression (`{ expr }`) if the body ends the moment the
    // expression does; otherwise a statement list, so `return`-bodied
    // and semicolon-terminated query bodies both parse.
    fn query_body(&mut self) -> Result<QueryBody, ()> {
        use TokenKind::*;
        if matches!(self.peek_kind(), Return | Print | If | While | For | Fun) || self.peek_kind().is_type_keyword() {
            let mut statements = Vec::new();
            while !self.check(TokenKind::CloseBrace) && !self.check(TokenKind::Eof) {
                statements.push(self.declaration()?);
            }
            return Ok(QueryBody::Statements(statements));
        }

        let expr = self.expression()?;
        if self.check(TokenKind::CloseBrace) {
            return Ok(QueryBody::Expr(expr));
        }
        self.consume(TokenKind::Semicolon, "expected ';' after query statement")?;
        let mut statements = vec![Stmt::Expr(expr)];
        while !self.check(TokenKind::CloseBrace) && !self.check(TokenKind::Eof) {
            statements.push(self.declaration()?);
        }
        Ok(QueryBody::Statements(statements))
    }
}

fn first_lex_error(tokens: &[Token]) -> Error {
    let bad = tokens
        .iter()
        .find(|t| t.kind == TokenKind::Invalid)
        .expect("all_valid was false but no Invalid token found");
    if bad.lexeme.starts_with('\'') || bad.lexeme.starts_with('"') {
        LexError::UnterminatedString { line: bad.line }.into()
    } else {
        LexError::UnexpectedCharacter { line: bad.line, character: bad.lexeme.clone() }.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TypeTag;
    use TokenKind::*;

    #[test]
    fn parses_arithmetic_with_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                Plus,
                Rc::new(Expr::Int(1)),
                Rc::new(Expr::Binary(Multiply, Rc::new(Expr::Int(2)), Rc::new(Expr::Int(3))))
            )
        );
    }

    #[test]
    fn parenthesized_grouping_overrides_precedence() {
        let expr = parse_expression("(42 + 1) / (2 * 3)").unwrap();
        match expr {
            Expr::Binary(Divide, ..) => {}
            other => panic!("expected a top-level Divide, got {:?}", other),
        }
    }

    #[test]
    fn string_concat_parses_as_plus() {
        let expr = parse_expression("\"id\" + \"42\"").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(Plus, Rc::new(Expr::Str("id".into())), Rc::new(Expr::Str("42".into())))
        );
    }

    #[test]
    fn rejects_float_literals() {
        let err = parse_expression("42.42").unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::FloatLiteralNotSupported { .. })));
    }

    #[test]
    fn parses_function_declarations_and_calls() {
        let program = parse_program(
            "fun fib(int i) { if (i <= 1) return i; return fib(i - 2) + fib(i - 1); } print fib(3);",
        )
        .unwrap();
        assert_eq!(program.len(), 2);
        assert!(matches!(program[0], Stmt::FunDecl(_)));
        assert!(matches!(program[1], Stmt::Print(_)));
    }

    #[test]
    fn for_loop_desugars_into_block_and_while() {
        let program = parse_program("for (int i = 0; i < 3; i = i + 1) print i;").unwrap();
        assert_eq!(program.len(), 1);
        assert!(matches!(program[0], Stmt::Block(_)));
    }

    #[test]
    fn query_header_name_spans_multiple_tokens() {
        let header = parse_query_header("[80s Pop]{ Genre == 'Pop' and Year > 1990 }").unwrap();
        assert_eq!(header.name, "80 s Pop");
        assert!(matches!(header.body, QueryBody::Expr(_)));
    }

    #[test]
    fn query_header_with_typed_parameter() {
        let header = parse_query_header("[By Composer](str composer){ Composer == composer }").unwrap();
        assert_eq!(header.params, vec![(TypeTag::Str, "composer".to_string())]);
    }

    #[test]
    fn query_header_return_bodied() {
        let header = parse_query_header("[Dinner]{ return Mood != 'Dinner'; }").unwrap();
        assert!(matches!(header.body, QueryBody::Statements(_)));
    }
}
