use crate::backend::vm::heap::Heap;
use crate::common::chunk::Chunk;
use crate::common::object::{ObjFunction, ObjHeader};
use crate::common::opcode::OpCode;
use crate::common::token::{Token, TokenKind};
use crate::common::value::Value;
use crate::frontend::lexer::Lexer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct FnScope {
    function: *mut ObjFunction,
    kind: FnKind,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<UpvalueDesc>,
}

impl FnScope {
    fn new(function: *mut ObjFunction, kind: FnKind) -> Self {
        let receiver_name = if matches!(kind, FnKind::Method | FnKind::Initializer) { "this" } else { "" };
        FnScope {
            function,
            kind,
            locals: vec![Local { name: receiver_name.to_string(), depth: 0, is_captured: false }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

struct LoopCtx {
    loop_top: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

struct EndedFn {
    function: *mut ObjFunction,
    upvalues: Vec<UpvalueDesc>,
}

/// Single-pass Pratt compiler: parses and emits bytecode in the same walk,
/// with no intermediate AST. One `FnScope` per function currently being
/// compiled (innermost on top); resolving a name walks that stack outward
/// to decide local / upvalue / global.
struct Compiler<'a> {
    lexer: Lexer<'a>,
    heap: &'a mut Heap,
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    fn_stack: Vec<FnScope>,
    class_stack: Vec<ClassCtx>,
    loop_stack: Vec<LoopCtx>,
}

pub fn compile(source: &str, heap: &mut Heap) -> Option<*mut ObjFunction> {
    let lexer = Lexer::new(source);
    let dummy = Token::new(TokenKind::Eof, "", 0);
    let script = heap.new_function(&[]);
    let mut compiler = Compiler {
        lexer,
        heap,
        current: dummy.clone(),
        previous: dummy,
        had_error: false,
        panic_mode: false,
        fn_stack: vec![FnScope::new(script, FnKind::Script)],
        class_stack: Vec::new(),
        loop_stack: Vec::new(),
    };
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let ended = compiler.end_compiler();
    if compiler.had_error { None } else { Some(ended.function) }
}

impl<'a> Compiler<'a> {
    // --- token stream plumbing ---

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.clone();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        match token.kind {
            TokenKind::Eof => eprintln!("[line {}] error at end: {}", token.line, message),
            TokenKind::Error => eprintln!("[line {}] error: {}", token.line, message),
            _ => eprintln!("[line {}] error at '{}': {}", token.line, token.lexeme, message),
        }
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
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

    // --- chunk / root plumbing ---

    fn current_function(&self) -> *mut ObjFunction {
        self.fn_stack.last().unwrap().function
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        unsafe { &mut (*self.current_function()).chunk }
    }

    fn current_chunk_len(&self) -> usize {
        unsafe { (*self.current_function()).chunk.code.len() }
    }

    fn current_scope_depth(&self) -> i32 {
        self.fn_stack.last().unwrap().scope_depth
    }

    /// Every function still being compiled is a GC root: its constant pool
    /// is growing and nothing else points at it yet.
    fn roots(&self) -> Vec<*mut ObjHeader> {
        self.fn_stack.iter().map(|f| f.function as *mut ObjHeader).collect()
    }

    // --- emission ---

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_byte(op as u8);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump_len = self.current_chunk_len() - offset - 2;
        if jump_len > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let hi = (jump_len >> 8) as u8;
        let lo = jump_len as u8;
        let chunk = self.current_chunk();
        chunk.code[offset] = hi;
        chunk.code[offset + 1] = lo;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop as u8);
        let offset = self.current_chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Too much code for jump.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    fn emit_return(&mut self) {
        let kind = self.fn_stack.last().unwrap().kind;
        if kind == FnKind::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_byte(OpCode::Nil as u8);
        }
        self.emit_byte(OpCode::Return as u8);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let result = self.current_chunk().add_constant(value);
        match result {
            Some(idx) => idx,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_bytes(OpCode::Constant as u8, idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let roots = self.roots();
        let ptr = self.heap.intern(name, &roots);
        self.make_constant(Value::Obj(ptr as *mut ObjHeader))
    }

    fn end_compiler(&mut self) -> EndedFn {
        self.emit_return();
        let scope = self.fn_stack.pop().unwrap();
        unsafe {
            (*scope.function).upvalue_count = scope.upvalues.len();
        }
        EndedFn { function: scope.function, upvalues: scope.upvalues }
    }

    // --- scopes / locals / upvalues ---

    fn begin_scope(&mut self) {
        self.fn_stack.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let popped: Vec<bool> = {
            let scope = self.fn_stack.last_mut().unwrap();
            scope.scope_depth -= 1;
            let depth = scope.scope_depth;
            let mut popped = Vec::new();
            while let Some(local) = scope.locals.last() {
                if local.depth > depth {
                    popped.push(local.is_captured);
                    scope.locals.pop();
                } else {
                    break;
                }
            }
            popped
        };
        for captured in popped {
            self.emit_byte(if captured { OpCode::CloseUpvalue as u8 } else { OpCode::Pop as u8 });
        }
    }

    fn discard_locals_to_depth(&mut self, target_depth: i32) {
        let to_pop: Vec<bool> = {
            let scope = self.fn_stack.last().unwrap();
            let mut out = Vec::new();
            for local in scope.locals.iter().rev() {
                if local.depth <= target_depth {
                    break;
                }
                out.push(local.is_captured);
            }
            out
        };
        for captured in to_pop {
            self.emit_byte(if captured { OpCode::CloseUpvalue as u8 } else { OpCode::Pop as u8 });
        }
    }

    fn add_local(&mut self, name: String) {
        let scope = self.fn_stack.last_mut().unwrap();
        if scope.locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        scope.locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        let depth = self.current_scope_depth();
        if depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();
        let mut dup = false;
        {
            let scope = self.fn_stack.last().unwrap();
            for local in scope.locals.iter().rev() {
                if local.depth != -1 && local.depth < depth {
                    break;
                }
                if local.name == name {
                    dup = true;
                    break;
                }
            }
        }
        if dup {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let scope = self.fn_stack.last_mut().unwrap();
        if scope.scope_depth == 0 {
            return;
        }
        let depth = scope.scope_depth;
        scope.locals.last_mut().unwrap().depth = depth;
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme.clone();
        self.declare_variable();
        if self.current_scope_depth() > 0 {
            return 0;
        }
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global_idx: u8) {
        if self.current_scope_depth() > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global_idx);
    }

    fn resolve_local(&mut self, fn_idx: usize, name: &str) -> Option<u8> {
        let mut found: Option<(u8, bool)> = None;
        {
            let scope = &self.fn_stack[fn_idx];
            for (i, local) in scope.locals.iter().enumerate().rev() {
                if local.name == name {
                    found = Some((i as u8, local.depth == -1));
                    break;
                }
            }
        }
        match found {
            Some((_, true)) => {
                self.error("Can't read local variable in its own initializer.");
                None
            }
            Some((idx, false)) => Some(idx),
            None => None,
        }
    }

    fn add_upvalue(&mut self, fn_idx: usize, index: u8, is_local: bool) -> u8 {
        let scope = &mut self.fn_stack[fn_idx];
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if scope.upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let scope = &mut self.fn_stack[fn_idx];
        scope.upvalues.push(UpvalueDesc { index, is_local });
        (scope.upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, fn_idx: usize, name: &str) -> Option<u8> {
        if fn_idx == 0 {
            return None;
        }
        let enclosing = fn_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            self.fn_stack[enclosing].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(fn_idx, local_idx, true));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(fn_idx, up_idx, false));
        }
        None
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let cur = self.fn_stack.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(cur, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(up) = self.resolve_upvalue(cur, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, up)
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    // --- declarations / statements ---

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

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_idx = self.identifier_constant(&class_name);
        self.declare_variable();
        self.emit_bytes(OpCode::Class as u8, name_idx);
        self.define_variable(name_idx);

        self.class_stack.push(ClassCtx { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.clone();
            if super_name == class_name {
                self.error("A class cannot inherit from itself.");
            }
            self.named_variable(&super_name, false);
            self.begin_scope();
            self.add_local("super".to_string());
            self.mark_initialized();
            self.named_variable(&class_name, false);
            self.emit_byte(OpCode::Inherit as u8);
            self.class_stack.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop as u8);

        let ctx = self.class_stack.pop().unwrap();
        if ctx.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let idx = self.identifier_constant(&name);
        let kind = if name == "init" { FnKind::Initializer } else { FnKind::Method };
        self.function_body(kind, &name);
        self.emit_bytes(OpCode::Method as u8, idx);
    }

    fn function_body(&mut self, kind: FnKind, name: &str) {
        let roots = self.roots();
        let func_obj = self.heap.new_function(&roots);
        self.fn_stack.push(FnScope::new(func_obj, kind));
        let roots = self.roots();
        let interned = self.heap.intern(name, &roots);
        unsafe {
            (*func_obj).name = interned;
        }
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut arity: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                arity += 1;
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let pidx = self.parse_variable("Expect parameter name.");
                self.define_variable(pidx);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        unsafe {
            (*func_obj).arity = arity.min(255) as u8;
        }
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        let ended = self.end_compiler();
        let idx = self.make_constant(Value::Obj(ended.function as *mut ObjHeader));
        self.emit_bytes(OpCode::Closure as u8, idx);
        for up in &ended.upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name = self.previous.lexeme.clone();
        self.function_body(FnKind::Function, &name);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil as u8);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
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
        self.emit_byte(OpCode::Print as u8);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop as u8);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop as u8);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop as u8);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_top = self.current_chunk_len();
        self.loop_stack.push(LoopCtx { loop_top, scope_depth: self.current_scope_depth(), break_jumps: Vec::new() });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop as u8);
        self.statement();
        self.emit_loop(loop_top);

        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop as u8);

        let ctx = self.loop_stack.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_top = self.current_chunk_len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_byte(OpCode::Pop as u8);
        }

        if !self.check(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk_len();
            self.expression();
            self.emit_byte(OpCode::Pop as u8);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_top);
            loop_top = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
        }

        self.loop_stack.push(LoopCtx { loop_top, scope_depth: self.current_scope_depth(), break_jumps: Vec::new() });
        self.statement();
        self.emit_loop(loop_top);

        if let Some(ej) = exit_jump {
            self.patch_jump(ej);
            self.emit_byte(OpCode::Pop as u8);
        }

        let ctx = self.loop_stack.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j);
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.loop_stack.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        let depth = self.loop_stack.last().unwrap().scope_depth;
        self.discard_locals_to_depth(depth);
        let jump = self.emit_jump(OpCode::Jump);
        self.loop_stack.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        if self.loop_stack.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        let (depth, loop_top) = {
            let l = self.loop_stack.last().unwrap();
            (l.scope_depth, l.loop_top)
        };
        self.discard_locals_to_depth(depth);
        self.emit_loop(loop_top);
    }

    fn return_statement(&mut self) {
        let kind = self.fn_stack.last().unwrap().kind;
        if kind == FnKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if kind == FnKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return as u8);
        }
    }

    // --- expressions (Pratt core) ---

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, prec: Precedence) {
        self.advance();
        let can_assign = prec <= Precedence::Assignment;
        let prefix_kind = self.previous.kind;
        self.prefix(prefix_kind, can_assign);

        while prec <= Compiler::infix_precedence(self.current.kind) {
            self.advance();
            let infix_kind = self.previous.kind;
            self.infix(infix_kind, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn infix_precedence(kind: TokenKind) -> Precedence {
        use TokenKind::*;
        match kind {
            Plus | Minus => Precedence::Term,
            Star | Slash | Percent | LessLess | GreaterGreater => Precedence::Factor,
            EqualEqual | BangEqual => Precedence::Equality,
            Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
            And => Precedence::And,
            Or => Precedence::Or,
            Dot | LeftParen | LeftBracket => Precedence::Call,
            _ => Precedence::None,
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(can_assign),
            Minus | Bang => self.unary(can_assign),
            Number => self.number(can_assign),
            String => self.string_literal(can_assign),
            Nil | True | False => self.literal(can_assign),
            Identifier => self.variable(can_assign),
            This => self.this_expr(can_assign),
            Super => self.super_expr(can_assign),
            _ => self.error("Expect expression."),
        }
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | Percent | LessLess | GreaterGreater | EqualEqual | BangEqual | Less
            | LessEqual | Greater | GreaterEqual => self.binary(can_assign),
            And => self.and_expr(can_assign),
            Or => self.or_expr(can_assign),
            Dot => self.dot(can_assign),
            LeftParen => self.call_expr(can_assign),
            LeftBracket => self.index_expr(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_byte(OpCode::Negate as u8),
            TokenKind::Bang => self.emit_byte(OpCode::Not as u8),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        let prec = Compiler::infix_precedence(op);
        self.parse_precedence(prec.next());
        match op {
            TokenKind::Plus => self.emit_byte(OpCode::Add as u8),
            TokenKind::Minus => self.emit_byte(OpCode::Subtract as u8),
            TokenKind::Star => self.emit_byte(OpCode::Multiply as u8),
            TokenKind::Slash => self.emit_byte(OpCode::Divide as u8),
            TokenKind::Percent => self.emit_byte(OpCode::Mod as u8),
            TokenKind::LessLess => self.emit_byte(OpCode::Shl as u8),
            TokenKind::GreaterGreater => self.emit_byte(OpCode::Shr as u8),
            TokenKind::EqualEqual => self.emit_byte(OpCode::Equal as u8),
            TokenKind::BangEqual => self.emit_byte(OpCode::NotEqual as u8),
            TokenKind::Less => self.emit_byte(OpCode::Less as u8),
            TokenKind::LessEqual => self.emit_byte(OpCode::LessEqual as u8),
            TokenKind::Greater => self.emit_byte(OpCode::Greater as u8),
            TokenKind::GreaterEqual => self.emit_byte(OpCode::GreaterEqual as u8),
            _ => unreachable!(),
        }
    }

    fn and_expr(&mut self, _can_assign: bool) {
        let end = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop as u8);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end);
    }

    fn or_expr(&mut self, _can_assign: bool) {
        let end = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_byte(OpCode::Pop as u8);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_byte(OpCode::Nil as u8),
            TokenKind::True => self.emit_byte(OpCode::True as u8),
            TokenKind::False => self.emit_byte(OpCode::False as u8),
            _ => unreachable!(),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let lex = self.previous.lexeme.clone();
        let n = if lex.len() > 1 && (lex.starts_with("0x") || lex.starts_with("0X")) {
            i64::from_str_radix(&lex[2..], 16).unwrap_or(0) as f64
        } else if lex.len() > 1 && (lex.starts_with("0b") || lex.starts_with("0B")) {
            let bits = &lex[2..];
            if bits.len() > 32 {
                self.error("Binary literal out of range.");
            }
            i64::from_str_radix(bits, 2).unwrap_or(0) as f64
        } else {
            lex.parse::<f64>().unwrap_or(0.0)
        };
        self.emit_constant(Value::Number(n));
    }

    fn string_literal(&mut self, _can_assign: bool) {
        let raw = self.previous.lexeme.clone();
        let unescaped = unescape(&raw);
        let roots = self.roots();
        let ptr = self.heap.intern(&unescaped, &roots);
        self.emit_constant(Value::Obj(ptr as *mut ObjHeader));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self, _can_assign: bool) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.class_stack.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.clone();
        let idx = self.identifier_constant(&name);
        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_bytes(OpCode::SuperInvoke as u8, idx);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_bytes(OpCode::GetSuper as u8, idx);
        }
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let idx = self.identifier_constant(&name);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty as u8, idx);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_bytes(OpCode::Invoke as u8, idx);
            self.emit_byte(argc);
        } else {
            self.emit_bytes(OpCode::GetProperty as u8, idx);
        }
    }

    fn index_expr(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_byte(OpCode::TableSet as u8);
        } else {
            self.emit_byte(OpCode::TableGet as u8);
        }
    }

    fn call_expr(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_bytes(OpCode::Call as u8, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }
}

/// Resolves escape sequences in a string literal's raw text. Unknown
/// escapes are left as a literal backslash followed by the character.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('t') => {
                chars.next();
                out.push('\t');
            }
            Some('r') => {
                chars.next();
                out.push('\r');
            }
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            Some('"') => {
                chars.next();
                out.push('"');
            }
            Some('a') => {
                chars.next();
                out.push('\u{07}');
            }
            Some('b') => {
                chars.next();
                out.push('\u{08}');
            }
            Some('e') => {
                chars.next();
                out.push('\u{1B}');
            }
            Some('f') => {
                chars.next();
                out.push('\u{0C}');
            }
            Some('v') => {
                chars.next();
                out.push('\u{0B}');
            }
            Some('x') => {
                chars.next();
                let h1 = chars.next();
                let h2 = chars.next();
                if let (Some(h1), Some(h2)) = (h1, h2) {
                    let hex: String = [h1, h2].iter().collect();
                    if let Ok(v) = u8::from_str_radix(&hex, 16) {
                        out.push(v as char);
                        continue;
                    }
                }
                out.push('\\');
            }
            _ => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_handles_known_sequences() {
        assert_eq!(unescape(r"a\nb\tc"), "a\nb\tc");
        assert_eq!(unescape(r#"\""#), "\"");
        assert_eq!(unescape(r"\q"), "\\q");
    }

    #[test]
    fn compiles_simple_program() {
        let mut heap = Heap::new();
        let f = compile("print 1 + 2;", &mut heap);
        assert!(f.is_some());
    }

    #[test]
    fn reports_error_on_malformed_program() {
        let mut heap = Heap::new();
        let f = compile("var x = ;", &mut heap);
        assert!(f.is_none());
    }

    #[test]
    fn return_from_top_level_is_an_error() {
        let mut heap = Heap::new();
        let f = compile("return 1;", &mut heap);
        assert!(f.is_none());
    }

    #[test]
    fn self_inheriting_class_is_an_error() {
        let mut heap = Heap::new();
        let f = compile("class A < A {}", &mut heap);
        assert!(f.is_none());
    }
}
