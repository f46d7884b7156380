// File: src/compiler.rs
//
// Single-pass bytecode compiler for the Canidae programming language.
// Parses the token stream and emits instructions as it goes: a Pratt
// parser drives expressions, and a stack of function states carries the
// lexical information (locals, upvalues, loop and class context) needed
// to resolve names without an AST.

use crate::bytecode::{Chunk, OpCode, UpvalueIndex};
use crate::errors::{CompileError, ErrorAt};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::value::{Function, Value};
use std::path::PathBuf;
use std::rc::Rc;

const MAX_LOCALS: usize = 256;
const MAX_ARITY: usize = 255;

/// Expression precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // = += -= *= /= %= ^=
    Or,
    And,
    Equality,   // == !=
    Comparison, // < <= > >=
    Term,       // + -
    Factor,     // * / %
    Power,      // ^ (right-associative)
    Unary,      // - not
    Call,       // () . []
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
            Precedence::Factor => Precedence::Power,
            Precedence::Power => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

/// Prefix/infix handlers and precedence for one token kind.
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        LeftBracket => (Some(Compiler::array_literal), Some(Compiler::index), Precedence::Call),
        Dot => (None, Some(Compiler::dot), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Star | Slash | Percent => (None, Some(Compiler::binary), Precedence::Factor),
        Caret => (None, Some(Compiler::binary), Precedence::Power),
        Not => (Some(Compiler::unary), None, Precedence::None),
        EqualEqual | BangEqual => (None, Some(Compiler::binary), Precedence::Equality),
        Less | LessEqual | Greater | GreaterEqual => {
            (None, Some(Compiler::binary), Precedence::Comparison)
        }
        And => (None, Some(Compiler::and_op), Precedence::And),
        Or => (None, Some(Compiler::or_op), Precedence::Or),
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        String => (Some(Compiler::string), None, Precedence::None),
        Number => (Some(Compiler::number), None, Precedence::None),
        True | False | Null => (Some(Compiler::literal), None, Precedence::None),
        This => (Some(Compiler::this_expr), None, Precedence::None),
        Super => (Some(Compiler::super_expr), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule { prefix, infix, precedence }
}

/// One declared local: `depth == -1` marks declared-but-uninitialized,
/// which is what forbids reading a local inside its own initializer.
struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// Loop context for `break`/`continue` patching.
struct LoopState {
    /// Backward continue target when already emitted (while/for); `None`
    /// while compiling a do-while body, where the condition comes later.
    continue_target: Option<usize>,
    continue_jumps: Vec<usize>,
    break_jumps: Vec<usize>,
    /// Scope depth at loop entry: early exits pop locals down to here.
    scope_depth: i32,
    /// Armed handlers at loop entry: early exits pop the difference.
    handler_depth: usize,
}

/// Per-function compile state. The compiler keeps a stack of these,
/// innermost last, mirroring the nesting of function declarations.
struct FunctionState {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueIndex>,
    scope_depth: i32,
    loops: Vec<LoopState>,
    handler_depth: usize,
}

impl FunctionState {
    fn new(name: Option<String>, kind: FunctionKind, source_dir: Option<Rc<PathBuf>>) -> Self {
        // Slot 0 belongs to the callee; in methods it is the receiver.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            function: Function {
                name,
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::new(),
                source_dir,
            },
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            handler_depth: 0,
        }
    }
}

/// Class context: tracks whether `super` is legal.
struct ClassState {
    has_superclass: bool,
}

pub struct Compiler {
    tokens: Vec<Token>,
    cur: usize,
    prev: usize,
    states: Vec<FunctionState>,
    classes: Vec<ClassState>,
    errors: Vec<CompileError>,
    panic_mode: bool,
    source_dir: Option<Rc<PathBuf>>,
}

/// Compile a whole source file into its top-level function.
///
/// `source_dir` is the directory of the file being compiled; it is stamped
/// onto every function so `import` resolves relative to the issuing file.
pub fn compile(
    source: &str,
    source_dir: Option<Rc<PathBuf>>,
) -> Result<Function, Vec<CompileError>> {
    let mut compiler = Compiler::new(tokenize(source), source_dir);
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.emit_implicit_return();
    let state = compiler.states.pop().unwrap_or_else(|| unreachable!());
    if compiler.errors.is_empty() {
        Ok(state.function)
    } else {
        Err(compiler.errors)
    }
}

impl Compiler {
    fn new(tokens: Vec<Token>, source_dir: Option<Rc<PathBuf>>) -> Self {
        let mut compiler = Self {
            tokens,
            cur: 0,
            prev: 0,
            states: vec![FunctionState::new(None, FunctionKind::Script, source_dir.clone())],
            classes: Vec::new(),
            errors: Vec::new(),
            panic_mode: false,
            source_dir,
        };
        compiler.skip_error_tokens();
        compiler
    }

    // === Token plumbing ===

    fn current(&self) -> &Token {
        &self.tokens[self.cur]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.prev]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn advance(&mut self) {
        self.prev = self.cur;
        if self.current().kind != TokenKind::Eof {
            self.cur += 1;
            self.skip_error_tokens();
        }
    }

    /// Scanner errors arrive as `Error` tokens; report and step over them.
    fn skip_error_tokens(&mut self) {
        while self.current().kind == TokenKind::Error {
            let line = self.current().line;
            let message = self.current().lexeme.clone();
            self.report(CompileError::new(line, ErrorAt::Bare, message));
            self.cur += 1;
        }
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // === Error reporting ===

    fn report(&mut self, error: CompileError) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(error);
    }

    fn error_at(&mut self, index: usize, message: &str) {
        let token = &self.tokens[index];
        let at = match token.kind {
            TokenKind::Eof => ErrorAt::End,
            _ => ErrorAt::Token(token.lexeme.clone()),
        };
        let error = CompileError::new(token.line, at, message);
        self.report(error);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.prev, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.cur, message);
    }

    /// Skip to a likely statement boundary after a parse error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            match self.current().kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Do
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Try
                | TokenKind::Raise
                | TokenKind::Import
                | TokenKind::Break
                | TokenKind::Continue => return,
                _ => self.advance(),
            }
        }
    }

    // === Emit helpers ===

    fn state(&mut self) -> &mut FunctionState {
        self.states.last_mut().unwrap_or_else(|| unreachable!())
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.state().function.chunk
    }

    fn emit(&mut self, op: OpCode) -> usize {
        let line = self.previous().line;
        self.chunk().emit(op, line)
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.chunk().add_constant(value);
        self.emit(OpCode::Constant(index));
    }

    fn make_constant(&mut self, value: Value) -> usize {
        self.chunk().add_constant(value)
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        self.make_constant(Value::string(name))
    }

    fn emit_implicit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit(OpCode::GetLocal(0));
        } else {
            self.emit(OpCode::Null);
        }
        self.emit(OpCode::Return);
    }

    // === Scopes and locals ===

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state().scope_depth -= 1;
        loop {
            let state = self.state();
            match state.locals.last() {
                Some(local) if local.depth > state.scope_depth => {
                    let captured = local.is_captured;
                    state.locals.pop();
                    if captured {
                        self.emit(OpCode::CloseUpvalue);
                    } else {
                        self.emit(OpCode::Pop);
                    }
                }
                _ => break,
            }
        }
    }

    /// Emit pops for locals deeper than `target_depth` without discarding
    /// compile-time state. Used by `break`/`continue`, which jump out of
    /// scopes that the surrounding code still finishes normally.
    fn emit_scope_exit(&mut self, target_depth: i32) {
        let ops: Vec<OpCode> = self
            .state()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > target_depth)
            .map(|local| {
                if local.is_captured {
                    OpCode::CloseUpvalue
                } else {
                    OpCode::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit(op);
        }
    }

    fn add_local(&mut self, name: String) {
        if self.state().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous().lexeme.clone();
        let state = self.states.last().unwrap_or_else(|| unreachable!());
        let shadowed = state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == -1 || local.depth >= state.scope_depth)
            .any(|local| local.name == name);
        if shadowed {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let state = self.state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Parse a variable name; returns the name constant for globals, 0 for
    /// locals (which need no constant).
    fn parse_variable(&mut self, message: &str) -> usize {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        let name = self.previous().lexeme.clone();
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, name_constant: usize) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(OpCode::DefineGlobal(name_constant));
    }

    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<usize> {
        let mut uninitialized = false;
        let mut found = None;
        for (slot, local) in self.states[state_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(slot);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, state_index: usize, upvalue: UpvalueIndex) -> usize {
        let state = &mut self.states[state_index];
        if let Some(index) = state.upvalues.iter().position(|u| *u == upvalue) {
            return index;
        }
        state.upvalues.push(upvalue);
        state.function.upvalue_count = state.upvalues.len();
        state.upvalues.len() - 1
    }

    /// Walk outward through the enclosing functions, recording an upvalue at
    /// every level on the path and marking the source local as captured.
    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<usize> {
        if state_index == 0 {
            return None;
        }
        if let Some(slot) = self.resolve_local(state_index - 1, name) {
            self.states[state_index - 1].locals[slot].is_captured = true;
            return Some(self.add_upvalue(state_index, UpvalueIndex::Local(slot)));
        }
        if let Some(upvalue) = self.resolve_upvalue(state_index - 1, name) {
            return Some(self.add_upvalue(state_index, UpvalueIndex::Enclosing(upvalue)));
        }
        None
    }

    // === Declarations and statements ===

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let name_constant = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(OpCode::Null);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(name_constant);
    }

    fn fun_declaration(&mut self) {
        let name_constant = self.parse_variable("Expect function name.");
        // Initialized before the body compiles so the function can recurse.
        self.mark_initialized();
        let name = self.previous().lexeme.clone();
        self.function_body(FunctionKind::Function, name);
        self.define_variable(name_constant);
    }

    /// Compile a function body into its own chunk and emit the closure.
    fn function_body(&mut self, kind: FunctionKind, name: String) {
        self.states.push(FunctionState::new(Some(name), kind, self.source_dir.clone()));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.state().function.arity as usize >= MAX_ARITY {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.state().function.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        self.emit_implicit_return();

        let state = self.states.pop().unwrap_or_else(|| unreachable!());
        let fn_constant = self.make_constant(Value::Function(Rc::new(state.function)));
        self.emit(OpCode::Closure { fn_constant, upvalues: state.upvalues });
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous().lexeme.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit(OpCode::Class(name_constant));
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.matches(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous().lexeme.clone();
            self.variable(false);
            if superclass_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            // The superclass value becomes a scoped local named "super" so
            // method closures can capture it for super dispatch.
            self.begin_scope();
            self.add_local("super".to_string());
            self.mark_initialized();
            self.named_variable(&class_name, false);
            self.emit(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit(OpCode::Pop);

        if self.classes.last().map(|c| c.has_superclass).unwrap_or(false) {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous().lexeme.clone();
        let constant = self.identifier_constant(&name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function_body(kind, name);
        self.emit(OpCode::Method(constant));
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::Do) {
            self.do_while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Import) {
            self.import_statement();
        } else if self.matches(TokenKind::Try) {
            self.try_statement();
        } else if self.matches(TokenKind::Raise) {
            self.raise_statement();
        } else if self.matches(TokenKind::LeftBrace) {
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
        self.emit(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let else_jump = self.emit(OpCode::JumpIfFalse(0));
        self.emit(OpCode::Pop);
        self.statement();
        let end_jump = self.emit(OpCode::Jump(0));

        self.chunk().patch_jump(else_jump);
        self.emit(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.chunk().patch_jump(end_jump);
    }

    /// `while cond do … end`
    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.expression();
        self.consume(TokenKind::Do, "Expect 'do' after condition.");

        let exit_jump = self.emit(OpCode::JumpIfFalse(0));
        self.emit(OpCode::Pop);

        self.push_loop(Some(loop_start));
        self.begin_scope();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::End, "Expect 'end' after loop body.");
        self.end_scope();
        self.emit(OpCode::Loop(loop_start));

        self.chunk().patch_jump(exit_jump);
        self.emit(OpCode::Pop);
        self.pop_loop(None);
    }

    /// `do … while cond end`
    fn do_while_statement(&mut self) {
        let body_start = self.chunk().code.len();

        self.push_loop(None);
        self.begin_scope();
        while !self.check(TokenKind::While) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::While, "Expect 'while' after loop body.");
        self.end_scope();

        // Pending continues land on the condition check.
        let condition_start = self.chunk().code.len();
        self.expression();
        self.consume(TokenKind::End, "Expect 'end' after condition.");
        let exit_jump = self.emit(OpCode::JumpIfFalse(0));
        self.emit(OpCode::Pop);
        self.emit(OpCode::Loop(body_start));
        self.chunk().patch_jump(exit_jump);
        self.emit(OpCode::Pop);
        self.pop_loop(Some(condition_start));
    }

    /// `for (init; cond; step) body`
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit(OpCode::JumpIfFalse(0)));
            self.emit(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit(OpCode::Jump(0));
            let step_start = self.chunk().code.len();
            self.expression();
            self.emit(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit(OpCode::Loop(loop_start));
            loop_start = step_start;
            self.chunk().patch_jump(body_jump);
        }

        self.push_loop(Some(loop_start));
        self.statement();
        self.emit(OpCode::Loop(loop_start));

        if let Some(exit) = exit_jump {
            self.chunk().patch_jump(exit);
            self.emit(OpCode::Pop);
        }
        self.pop_loop(None);
        self.end_scope();
    }

    fn push_loop(&mut self, continue_target: Option<usize>) {
        let scope_depth = self.state().scope_depth;
        let handler_depth = self.state().handler_depth;
        self.state().loops.push(LoopState {
            continue_target,
            continue_jumps: Vec::new(),
            break_jumps: Vec::new(),
            scope_depth,
            handler_depth,
        });
    }

    /// Close the innermost loop: patch breaks to fall here and pending
    /// continues to `late_continue_target` (do-while condition).
    fn pop_loop(&mut self, late_continue_target: Option<usize>) {
        let state = self.state();
        let loop_state = match state.loops.pop() {
            Some(l) => l,
            None => return,
        };
        for jump in loop_state.break_jumps {
            self.chunk().patch_jump(jump);
        }
        if let Some(target) = late_continue_target {
            for jump in loop_state.continue_jumps {
                self.chunk().set_jump_target(jump, target);
            }
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let (scope_depth, handler_depth) = match self.state().loops.last() {
            Some(l) => (l.scope_depth, l.handler_depth),
            None => {
                self.error("Can't use 'break' outside of a loop.");
                return;
            }
        };
        let handlers_to_pop = self.state().handler_depth - handler_depth;
        for _ in 0..handlers_to_pop {
            self.emit(OpCode::PopHandler);
        }
        self.emit_scope_exit(scope_depth);
        let jump = self.emit(OpCode::Jump(0));
        if let Some(l) = self.state().loops.last_mut() {
            l.break_jumps.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let (scope_depth, handler_depth, target) = match self.state().loops.last() {
            Some(l) => (l.scope_depth, l.handler_depth, l.continue_target),
            None => {
                self.error("Can't use 'continue' outside of a loop.");
                return;
            }
        };
        let handlers_to_pop = self.state().handler_depth - handler_depth;
        for _ in 0..handlers_to_pop {
            self.emit(OpCode::PopHandler);
        }
        self.emit_scope_exit(scope_depth);
        match target {
            Some(target) => {
                self.emit(OpCode::Loop(target));
            }
            None => {
                let jump = self.emit(OpCode::Jump(0));
                if let Some(l) = self.state().loops.last_mut() {
                    l.continue_jumps.push(jump);
                }
            }
        }
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_implicit_return();
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(OpCode::Return);
        }
    }

    fn import_statement(&mut self) {
        self.consume(TokenKind::Identifier, "Expect module name after 'import'.");
        let name = self.previous().lexeme.clone();
        let constant = self.identifier_constant(&name);
        self.consume(TokenKind::Semicolon, "Expect ';' after import.");
        self.emit(OpCode::Import(constant));
    }

    fn raise_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after raise value.");
        self.emit(OpCode::Raise);
    }

    /// `try { … } catch [(Type[, Type…] [as name])] { … } end`
    fn try_statement(&mut self) {
        let handler_index =
            self.emit(OpCode::PushHandler { target: 0, types: Vec::new(), binds: false });
        self.state().handler_depth += 1;

        self.consume(TokenKind::LeftBrace, "Expect '{' after 'try'.");
        self.begin_scope();
        self.block();
        self.end_scope();

        self.state().handler_depth -= 1;
        self.emit(OpCode::PopHandler);
        let end_jump = self.emit(OpCode::Jump(0));

        // The handler target is the catch clause entry.
        self.chunk().patch_jump(handler_index);

        self.consume(TokenKind::Catch, "Expect 'catch' after try block.");
        let mut types = Vec::new();
        let mut bind_name = None;
        if self.matches(TokenKind::LeftParen) {
            loop {
                self.consume(TokenKind::Identifier, "Expect exception type name.");
                let name = self.previous().lexeme.clone();
                types.push(self.identifier_constant(&name));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            if self.matches(TokenKind::As) {
                self.consume(TokenKind::Identifier, "Expect binding name after 'as'.");
                bind_name = Some(self.previous().lexeme.clone());
            }
            self.consume(TokenKind::RightParen, "Expect ')' after catch clause.");
        }

        let binds = bind_name.is_some();
        if let OpCode::PushHandler { types: slot, binds: bind_slot, .. } =
            &mut self.chunk().code[handler_index]
        {
            *slot = types;
            *bind_slot = binds;
        }

        self.begin_scope();
        if let Some(name) = bind_name {
            // The unwinder leaves the exception exactly where this local's
            // slot sits: the stack depth recorded at try entry.
            self.add_local(name);
            self.mark_initialized();
        }
        self.consume(TokenKind::LeftBrace, "Expect '{' after catch clause.");
        self.block();
        self.end_scope();
        self.consume(TokenKind::End, "Expect 'end' after catch block.");

        self.chunk().patch_jump(end_jump);
    }

    // === Expressions ===

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match rule(self.previous().kind).prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current().kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous().kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.check_assignment_operator().is_some() {
            self.advance();
            self.error("Invalid assignment target.");
        }
    }

    /// The compound operator on `current`, if any; `Equal` maps to `None`
    /// in the pair since plain assignment has no binary op.
    fn check_assignment_operator(&self) -> Option<Option<OpCode>> {
        match self.current().kind {
            TokenKind::Equal => Some(None),
            TokenKind::PlusEqual => Some(Some(OpCode::Add)),
            TokenKind::MinusEqual => Some(Some(OpCode::Subtract)),
            TokenKind::StarEqual => Some(Some(OpCode::Multiply)),
            TokenKind::SlashEqual => Some(Some(OpCode::Divide)),
            TokenKind::PercentEqual => Some(Some(OpCode::Modulo)),
            TokenKind::CaretEqual => Some(Some(OpCode::Power)),
            _ => None,
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous().lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let value = Value::string(self.previous().lexeme.clone());
        self.emit_constant(value);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous().kind {
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::False => self.emit(OpCode::False),
            TokenKind::Null => self.emit(OpCode::Null),
            _ => unreachable!(),
        };
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous().kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit(OpCode::Negate),
            TokenKind::Not => self.emit(OpCode::Not),
            _ => unreachable!(),
        };
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous().kind;
        let precedence = rule(operator).precedence;
        // `^` is right-associative: recurse at the same level.
        if operator == TokenKind::Caret {
            self.parse_precedence(Precedence::Power);
        } else {
            self.parse_precedence(precedence.next());
        }
        match operator {
            TokenKind::Plus => self.emit(OpCode::Add),
            TokenKind::Minus => self.emit(OpCode::Subtract),
            TokenKind::Star => self.emit(OpCode::Multiply),
            TokenKind::Slash => self.emit(OpCode::Divide),
            TokenKind::Percent => self.emit(OpCode::Modulo),
            TokenKind::Caret => self.emit(OpCode::Power),
            TokenKind::EqualEqual => self.emit(OpCode::Equal),
            TokenKind::BangEqual => self.emit(OpCode::NotEqual),
            TokenKind::Less => self.emit(OpCode::Less),
            TokenKind::LessEqual => self.emit(OpCode::LessEqual),
            TokenKind::Greater => self.emit(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit(OpCode::GreaterEqual),
            _ => unreachable!(),
        };
    }

    fn and_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit(OpCode::JumpIfFalse(0));
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.chunk().patch_jump(end_jump);
    }

    fn or_op(&mut self, _can_assign: bool) {
        let else_jump = self.emit(OpCode::JumpIfFalse(0));
        let end_jump = self.emit(OpCode::Jump(0));
        self.chunk().patch_jump(else_jump);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.chunk().patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit(OpCode::Call(arg_count));
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARITY {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(MAX_ARITY) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous().lexeme.clone();
        let constant = self.identifier_constant(&name);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(OpCode::SetProperty(constant));
        } else if can_assign && self.check_assignment_operator().map_or(false, |op| op.is_some()) {
            let op = self
                .check_assignment_operator()
                .and_then(|op| op)
                .unwrap_or(OpCode::Add);
            self.advance();
            self.emit(OpCode::Dup);
            self.emit(OpCode::GetProperty(constant));
            self.expression();
            self.emit(op);
            self.emit(OpCode::SetProperty(constant));
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit(OpCode::Invoke(constant, arg_count));
        } else {
            self.emit(OpCode::GetProperty(constant));
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(OpCode::IndexSet);
        } else if can_assign && self.check_assignment_operator().map_or(false, |op| op.is_some()) {
            let op = self
                .check_assignment_operator()
                .and_then(|op| op)
                .unwrap_or(OpCode::Add);
            self.advance();
            self.emit(OpCode::Dup2);
            self.emit(OpCode::IndexGet);
            self.expression();
            self.emit(op);
            self.emit(OpCode::IndexSet);
        } else {
            self.emit(OpCode::IndexGet);
        }
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        self.emit(OpCode::BuildArray(count));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous().lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let state_index = self.states.len() - 1;
        let (get_op, set_op, strict_get) = if let Some(slot) = self.resolve_local(state_index, name)
        {
            (OpCode::GetLocal(slot), OpCode::SetLocal(slot), OpCode::GetLocal(slot))
        } else if let Some(upvalue) = self.resolve_upvalue(state_index, name) {
            (
                OpCode::GetUpvalue(upvalue),
                OpCode::SetUpvalue(upvalue),
                OpCode::GetUpvalue(upvalue),
            )
        } else {
            let constant = self.identifier_constant(name);
            (
                OpCode::GetGlobal(constant),
                OpCode::SetGlobal(constant),
                OpCode::GetGlobalStrict(constant),
            )
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(set_op);
        } else if can_assign && self.check_assignment_operator().map_or(false, |op| op.is_some()) {
            let op = self
                .check_assignment_operator()
                .and_then(|op| op)
                .unwrap_or(OpCode::Add);
            self.advance();
            self.emit(strict_get);
            self.expression();
            self.emit(op);
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().map(|c| c.has_superclass).unwrap_or(false) {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous().lexeme.clone();
        let constant = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit(OpCode::SuperInvoke(constant, arg_count));
        } else {
            self.named_variable("super", false);
            self.emit(OpCode::GetSuper(constant));
        }
    }
}
