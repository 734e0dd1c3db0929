// File: src/compiler.rs
//
// Single-pass Pratt parser and bytecode emitter. No separate AST: each
// grammar production both parses its tokens and emits bytecode directly
// into the chunk of the function currently being compiled (spec §4.4).

use std::rc::Rc;

use once_cell::sync::Lazy;

use crate::chunk::{Chunk, OpCode};
use crate::errors::{CompileError, SourceLocation};
use crate::object::{LoxFunction, LoxString, Obj};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::table::Table;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Which parse routine a rule dispatches to. A tagged dispatch enum
/// stands in for the book's raw function pointers, which don't play
/// well with the compiler's borrowed-token lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseFn {
    None,
    Grouping,
    Unary,
    Binary,
    Number,
    StringLit,
    Literal,
    Variable,
    And,
    Or,
    Call,
}

#[derive(Debug, Clone, Copy)]
struct ParseRule {
    prefix: ParseFn,
    infix: ParseFn,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: ParseFn, infix: ParseFn, precedence: Precedence) -> Self {
        Self { prefix, infix, precedence }
    }
    const fn none() -> Self {
        Self::new(ParseFn::None, ParseFn::None, Precedence::None)
    }
}

const TOKEN_KIND_COUNT: usize = TokenKind::Eof as usize + 1;

static PARSE_RULES: Lazy<[ParseRule; TOKEN_KIND_COUNT]> = Lazy::new(|| {
    let mut rules = [ParseRule::none(); TOKEN_KIND_COUNT];
    rules[TokenKind::LeftParen as usize] = ParseRule::new(ParseFn::Grouping, ParseFn::Call, Precedence::Call);
    rules[TokenKind::Minus as usize] = ParseRule::new(ParseFn::Unary, ParseFn::Binary, Precedence::Term);
    rules[TokenKind::Plus as usize] = ParseRule::new(ParseFn::None, ParseFn::Binary, Precedence::Term);
    rules[TokenKind::Slash as usize] = ParseRule::new(ParseFn::None, ParseFn::Binary, Precedence::Factor);
    rules[TokenKind::Star as usize] = ParseRule::new(ParseFn::None, ParseFn::Binary, Precedence::Factor);
    rules[TokenKind::Bang as usize] = ParseRule::new(ParseFn::Unary, ParseFn::None, Precedence::None);
    rules[TokenKind::BangEqual as usize] = ParseRule::new(ParseFn::None, ParseFn::Binary, Precedence::Equality);
    rules[TokenKind::EqualEqual as usize] = ParseRule::new(ParseFn::None, ParseFn::Binary, Precedence::Equality);
    rules[TokenKind::Greater as usize] = ParseRule::new(ParseFn::None, ParseFn::Binary, Precedence::Comparison);
    rules[TokenKind::GreaterEqual as usize] = ParseRule::new(ParseFn::None, ParseFn::Binary, Precedence::Comparison);
    rules[TokenKind::Less as usize] = ParseRule::new(ParseFn::None, ParseFn::Binary, Precedence::Comparison);
    rules[TokenKind::LessEqual as usize] = ParseRule::new(ParseFn::None, ParseFn::Binary, Precedence::Comparison);
    rules[TokenKind::Identifier as usize] = ParseRule::new(ParseFn::Variable, ParseFn::None, Precedence::None);
    rules[TokenKind::String as usize] = ParseRule::new(ParseFn::StringLit, ParseFn::None, Precedence::None);
    rules[TokenKind::Number as usize] = ParseRule::new(ParseFn::Number, ParseFn::None, Precedence::None);
    rules[TokenKind::And as usize] = ParseRule::new(ParseFn::None, ParseFn::And, Precedence::And);
    rules[TokenKind::Or as usize] = ParseRule::new(ParseFn::None, ParseFn::Or, Precedence::Or);
    rules[TokenKind::False as usize] = ParseRule::new(ParseFn::Literal, ParseFn::None, Precedence::None);
    rules[TokenKind::True as usize] = ParseRule::new(ParseFn::Literal, ParseFn::None, Precedence::None);
    rules[TokenKind::Nil as usize] = ParseRule::new(ParseFn::Literal, ParseFn::None, Precedence::None);
    rules
});

fn get_rule(kind: TokenKind) -> ParseRule {
    PARSE_RULES[kind as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
}

#[derive(Debug, Clone, Copy)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

struct FunctionBuilder {
    arity: u8,
    name: Option<Rc<LoxString>>,
    chunk: Chunk,
    upvalue_count: usize,
}

struct CompilerFrame<'src> {
    kind: FunctionKind,
    function: FunctionBuilder,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
}

impl<'src> CompilerFrame<'src> {
    fn new(kind: FunctionKind, name: Option<Rc<LoxString>>) -> Self {
        // Slot 0 is reserved for the callee itself.
        let locals = vec![Local { name: "", depth: 0 }];
        Self {
            kind,
            function: FunctionBuilder { arity: 0, name, chunk: Chunk::new(), upvalue_count: 0 },
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

pub struct Compiler<'src, 'tbl> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    frames: Vec<CompilerFrame<'src>>,
    strings: &'tbl mut Table,
}

/// Result of a completed function: the finished object plus the upvalue
/// capture metadata the enclosing compiler needs to emit after `OP_CLOSURE`.
struct FinishedFunction {
    function: Rc<LoxFunction>,
    upvalues: Vec<UpvalueRef>,
}

impl<'src, 'tbl> Compiler<'src, 'tbl> {
    fn new(source: &'src str, strings: &'tbl mut Table) -> Self {
        let dummy = Token { kind: TokenKind::Error, lexeme: "", line: 0 };
        Self {
            scanner: Scanner::new(source),
            current: dummy,
            previous: dummy,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            frames: vec![CompilerFrame::new(FunctionKind::Script, None)],
            strings,
        }
    }

    // --- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // --- error reporting ----------------------------------------------

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(CompileError {
            location: SourceLocation::new(token.line),
            at,
            message: message.to_string(),
        });
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    // --- emission -------------------------------------------------------

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.frames.last_mut().unwrap().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) -> usize {
        let line = self.previous.line as u32;
        self.current_chunk().write(byte, line)
    }

    fn emit_op(&mut self, op: OpCode) -> usize {
        self.emit_byte(op as u8)
    }

    fn emit_bytes(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.current_chunk().add_constant(value);
        if idx > 255 {
            self.error("Too many constants in one chunk.");
            return;
        }
        self.emit_bytes(OpCode::Constant, idx as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.current_chunk().patch_u16(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    // --- scope & variable resolution -------------------------------------

    fn begin_scope(&mut self) {
        self.frames.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        frame.scope_depth -= 1;
        let depth = frame.scope_depth;
        while matches!(frame.locals.last(), Some(local) if local.depth > depth) {
            frame.locals.pop();
            self.emit_op(OpCode::Pop);
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.strings.intern(name.to_string());
        let idx = self.current_chunk().add_constant(Value::Obj(Rc::new(Obj::String(handle))));
        if idx > 255 {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn add_local(&mut self, name: &'src str) {
        let frame = self.frames.last_mut().unwrap();
        if frame.locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        frame.locals.push(Local { name, depth: -1 });
    }

    fn declare_variable(&mut self) {
        let frame = self.frames.last().unwrap();
        if frame.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let scope_depth = frame.scope_depth;
        for local in frame.locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.frames.last().unwrap().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_string();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        frame.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.frames.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        let frame = &self.frames[frame_idx];
        for (i, local) in frame.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let frame = &mut self.frames[frame_idx];
        for (i, up) in frame.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if frame.upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        frame.upvalues.push(UpvalueRef { index, is_local });
        frame.function.upvalue_count += 1;
        (frame.upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, local_idx, true));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, up_idx, false));
        }
        None
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let frame_idx = self.frames.len() - 1;
        let (get_op, set_op, slot) = if let Some(slot) = self.resolve_local(frame_idx, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(frame_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let slot = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, slot)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op, slot);
        } else {
            self.emit_bytes(get_op, slot);
        }
    }

    // --- expressions ------------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule(self.previous.kind).prefix;
        if prefix == ParseFn::None {
            self.error("Expect expression.");
            return;
        }
        let can_assign = precedence <= Precedence::Assignment;
        self.dispatch(prefix, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.previous.kind).infix;
            self.dispatch(infix, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn dispatch(&mut self, parse_fn: ParseFn, can_assign: bool) {
        match parse_fn {
            ParseFn::None => unreachable!("dispatch called with ParseFn::None"),
            ParseFn::Grouping => self.grouping(),
            ParseFn::Unary => self.unary(),
            ParseFn::Binary => self.binary(),
            ParseFn::Number => self.number(),
            ParseFn::StringLit => self.string_literal(),
            ParseFn::Literal => self.literal(),
            ParseFn::Variable => self.variable(can_assign),
            ParseFn::And => self.and(),
            ParseFn::Or => self.or(),
            ParseFn::Call => self.call(),
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string_literal(&mut self) {
        let lexeme = self.previous.lexeme;
        let inner = &lexeme[1..lexeme.len() - 1];
        let handle = self.strings.intern(inner.to_string());
        self.emit_constant(Value::Obj(Rc::new(Obj::String(handle))));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        };
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        };
    }

    fn binary(&mut self) {
        let op_kind = self.previous.kind;
        let rule = get_rule(op_kind);
        self.parse_precedence(rule.precedence.next());
        match op_kind {
            TokenKind::Plus => {
                self.emit_op(OpCode::Add);
            }
            TokenKind::Minus => {
                self.emit_op(OpCode::Subtract);
            }
            TokenKind::Star => {
                self.emit_op(OpCode::Multiply);
            }
            TokenKind::Slash => {
                self.emit_op(OpCode::Divide);
            }
            TokenKind::EqualEqual => {
                self.emit_op(OpCode::Equal);
            }
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => {
                self.emit_op(OpCode::Greater);
            }
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => {
                self.emit_op(OpCode::Less);
            }
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    // --- statements & declarations ------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name = self.strings.intern(self.previous.lexeme.to_string());
        self.function(FunctionKind::Function, Some(name));
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: Option<Rc<LoxString>>) {
        self.frames.push(CompilerFrame::new(kind, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let frame = self.frames.last_mut().unwrap();
                frame.function.arity += 1;
                if frame.function.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let finished = self.end_compiler();
        let idx = self.current_chunk().add_constant(Value::Obj(Rc::new(Obj::Function(finished.function))));
        if idx > 255 {
            self.error("Too many constants in one chunk.");
            return;
        }
        self.emit_bytes(OpCode::Closure, idx as u8);
        for upvalue in &finished.upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        if self.match_token(TokenKind::Else) {
            let else_jump = self.emit_jump(OpCode::Jump);
            self.patch_jump(then_jump);
            self.emit_op(OpCode::Pop);
            self.statement();
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(then_jump);
            self.emit_op(OpCode::Pop);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.frames.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn end_compiler(&mut self) -> FinishedFunction {
        self.emit_return();
        let frame = self.frames.pop().expect("compiler frame stack underflow");
        let function = Rc::new(LoxFunction {
            arity: frame.function.arity,
            upvalue_count: frame.function.upvalue_count,
            name: frame.function.name,
            chunk: std::cell::RefCell::new(frame.function.chunk),
        });
        FinishedFunction { function, upvalues: frame.upvalues }
    }
}

/// Compiles `source` into a top-level `Function`, interning any string
/// constants/identifier names through `strings`. Returns the accumulated
/// compile errors if any were reported (spec §8 property 5).
pub fn compile(source: &str, strings: &mut Table) -> Result<Rc<LoxFunction>, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, strings);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let finished = compiler.end_compiler();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(finished.function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> Rc<LoxFunction> {
        let mut strings = Table::new();
        compile(source, &mut strings).expect("expected successful compile")
    }

    #[test]
    fn compiles_a_trivial_program() {
        let function = compile_ok("print 1 + 2;");
        assert_eq!(function.arity, 0);
        assert!(!function.chunk.borrow().is_empty());
    }

    #[test]
    fn reports_expect_expression_error() {
        let mut strings = Table::new();
        let result = compile("print ;", &mut strings);
        let errors = result.expect_err("expected a compile error");
        assert!(errors.iter().any(|e| e.message == "Expect expression."));
    }

    #[test]
    fn reports_cant_return_from_top_level() {
        let mut strings = Table::new();
        let result = compile("return 1;", &mut strings);
        let errors = result.expect_err("expected a compile error");
        assert!(errors.iter().any(|e| e.message == "Can't return from top-level code."));
    }

    #[test]
    fn rejects_reading_local_in_its_own_initializer() {
        let mut strings = Table::new();
        let result = compile("{ var a = a; }", &mut strings);
        let errors = result.expect_err("expected a compile error");
        assert!(errors.iter().any(|e| e.message.contains("own initializer")));
    }

    #[test]
    fn closure_upvalue_count_matches_emitted_metadata() {
        let function = compile_ok(
            "fun makeCounter() { var i = 0; fun count() { i = i + 1; return i; } return count; }",
        );
        // The inner `count` function is compiled as a constant of the outer chunk.
        let chunk = function.chunk.borrow();
        let inner = chunk.constants.iter().find_map(|c| match c {
            Value::Obj(obj) => obj.as_function().cloned(),
            _ => None,
        });
        let inner = inner.expect("expected a nested function constant");
        assert_eq!(inner.upvalue_count, 1);
    }
}
