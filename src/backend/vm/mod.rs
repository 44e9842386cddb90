pub mod error;
pub mod heap;
pub mod natives;

use crate::common::chunk::Chunk;
use crate::common::hash::Table;
use crate::common::object::{
    self, ObjBoundMethod, ObjClass, ObjClosure, ObjHeader, ObjKind, ObjNative,
    ObjString, ObjUpvalue, UpvalueLoc,
};
use crate::common::opcode::OpCode;
use crate::common::value::Value;
use crate::frontend::compiler;
use error::{ErrorKind, Frame, RuntimeError};
use heap::Heap;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

struct CallFrame {
    closure: *mut ObjClosure,
    ip: usize,
    slot_base: usize,
}

/// Stack-based bytecode interpreter. Owns the heap, the value stack, the
/// call-frame stack, the globals table, and the open-upvalue chain (threaded
/// through `ObjUpvalue::next_open`, newest first).
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: *mut ObjUpvalue,
    init_string: *mut ObjString,
    pub trace: bool,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init", &[]);
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: std::ptr::null_mut(),
            init_string,
            trace: false,
        };
        vm.define_natives();
        vm
    }

    fn define_natives(&mut self) {
        for (name, id) in natives::ALL {
            let arity = natives::arity(*id);
            let roots = self.collect_roots();
            let name_ptr = self.heap.intern(name, &roots);
            let roots = self.collect_roots();
            let native_ptr = self.heap.new_native(*id, arity, name_ptr, &roots);
            self.globals.set(Value::Obj(name_ptr as *mut ObjHeader), Value::Obj(native_ptr as *mut ObjHeader));
        }
    }

    /// Every root the collector needs to preserve: stack values, the closure
    /// of every active frame, every global binding, every still-open
    /// upvalue, and the pinned `init` string used by the call protocol.
    fn collect_roots(&self) -> Vec<*mut ObjHeader> {
        let mut roots = Vec::new();
        for v in &self.stack {
            if let Some(p) = v.as_obj() {
                roots.push(p);
            }
        }
        for f in &self.frames {
            roots.push(f.closure as *mut ObjHeader);
        }
        for (k, v) in self.globals.iter() {
            if let Some(p) = k.as_obj() {
                roots.push(p);
            }
            if let Some(p) = v.as_obj() {
                roots.push(p);
            }
        }
        let mut up = self.open_upvalues;
        while !up.is_null() {
            roots.push(up as *mut ObjHeader);
            up = unsafe { (*up).next_open };
        }
        if !self.init_string.is_null() {
            roots.push(self.init_string as *mut ObjHeader);
        }
        roots
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = std::ptr::null_mut();

        let function = match compiler::compile(source, &mut self.heap) {
            Some(f) => f,
            None => return InterpretResult::CompileError,
        };
        self.stack.push(Value::Obj(function as *mut ObjHeader));
        let roots = self.collect_roots();
        let closure = self.heap.new_closure(function, Vec::new(), &roots);
        self.stack.pop();
        self.stack.push(Value::Obj(closure as *mut ObjHeader));

        if let Err(e) = self.call_value(Value::Obj(closure as *mut ObjHeader), 0) {
            e.report();
            return InterpretResult::RuntimeError;
        }
        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(e) => {
                e.report();
                InterpretResult::RuntimeError
            }
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = match OpCode::from_u8(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error(ErrorKind::InternalError(format!("unknown opcode {byte}")))),
            };
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    let v = self.peek(0);
                    self.stack[base + slot] = v;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&Value::Obj(name as *mut ObjHeader)) {
                        Some(v) => self.push(v),
                        None => {
                            let msg = unsafe { (*name).chars.clone() };
                            return Err(self.runtime_error(ErrorKind::UndefinedVariable(msg)));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let v = self.peek(0);
                    self.globals.set(Value::Obj(name as *mut ObjHeader), v);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let v = self.peek(0);
                    let is_new = self.globals.set(Value::Obj(name as *mut ObjHeader), v);
                    if is_new {
                        self.globals.delete(&Value::Obj(name as *mut ObjHeader));
                        let msg = unsafe { (*name).chars.clone() };
                        return Err(self.runtime_error(ErrorKind::UndefinedVariable(msg)));
                    }
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let up = unsafe { (&(*closure).upvalues)[idx] };
                    self.push(self.read_upvalue(up));
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let up = unsafe { (&(*closure).upvalues)[idx] };
                    let v = self.peek(0);
                    self.write_upvalue(up, v);
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    self.get_property(name)?;
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    let inst = object::as_instance(&receiver)
                        .ok_or_else(|| self.runtime_error(ErrorKind::TypeError("Only instances have fields.".to_string())))?;
                    unsafe {
                        (*inst).fields.set(Value::Obj(name as *mut ObjHeader), value);
                    }
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass_v = self.pop();
                    let receiver = self.pop();
                    let class_ptr = object::as_class(&superclass_v)
                        .ok_or_else(|| self.runtime_error(ErrorKind::InternalError("super is not a class".to_string())))?;
                    let bound = self.bind_method(class_ptr, name, receiver)?;
                    self.push(bound);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Greater => self.number_compare(|a, b| a > b)?,
                OpCode::GreaterEqual => self.number_compare(|a, b| a >= b)?,
                OpCode::Less => self.number_compare(|a, b| a < b)?,
                OpCode::LessEqual => self.number_compare(|a, b| a <= b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.number_binary(|a, b| a - b)?,
                OpCode::Multiply => self.number_binary(|a, b| a * b)?,
                OpCode::Divide => self.divide()?,
                OpCode::Mod => self.modulo()?,
                OpCode::Shl => self.int_binary(|a, b| a.wrapping_shl(b as u32))?,
                OpCode::Shr => self.int_binary(|a, b| a.wrapping_shr(b as u32))?,
                OpCode::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.runtime_error(ErrorKind::TypeError("Operand must be a number.".to_string()))),
                    }
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Print => {
                    let v = self.pop();
                    println!("{}", object::format_value(&v));
                }
                OpCode::Jump => {
                    let off = self.read_u16();
                    self.current_frame_mut().ip += off as usize;
                }
                OpCode::JumpIfFalse => {
                    let off = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += off as usize;
                    }
                }
                OpCode::JumpIfTrue => {
                    let off = self.read_u16();
                    if !self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += off as usize;
                    }
                }
                OpCode::Loop => {
                    let off = self.read_u16();
                    self.current_frame_mut().ip -= off as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass_v = self.pop();
                    let class_ptr = object::as_class(&superclass_v)
                        .ok_or_else(|| self.runtime_error(ErrorKind::InternalError("super is not a class".to_string())))?;
                    self.invoke_from_class(class_ptr, name, argc)?;
                }
                OpCode::Closure => {
                    let func_const = self.read_constant();
                    let func_ptr = object::as_function(&func_const).unwrap();
                    let upvalue_count = unsafe { (*func_ptr).upvalue_count };
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.current_frame().slot_base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let closure = self.current_frame().closure;
                            upvalues.push(unsafe { (&(*closure).upvalues)[index] });
                        }
                    }
                    let roots = self.collect_roots();
                    let closure_ptr = self.heap.new_closure(func_ptr, upvalues, &roots);
                    self.push(Value::Obj(closure_ptr as *mut ObjHeader));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slot_base);
                    self.stack.truncate(frame.slot_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let roots = self.collect_roots();
                    let class_ptr = self.heap.new_class(name, &roots);
                    self.push(Value::Obj(class_ptr as *mut ObjHeader));
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
                OpCode::Inherit => {
                    let superclass_v = self.peek(1);
                    let subclass_v = self.peek(0);
                    let super_ptr = object::as_class(&superclass_v)
                        .ok_or_else(|| self.runtime_error(ErrorKind::TypeError("Superclass must be a class.".to_string())))?;
                    let sub_ptr = object::as_class(&subclass_v).unwrap();
                    unsafe {
                        (*super_ptr).methods.add_all(&mut (*sub_ptr).methods);
                    }
                    self.pop();
                }
                OpCode::TableGet => {
                    let key = self.pop();
                    let recv = self.pop();
                    let tbl = object::as_table(&recv)
                        .ok_or_else(|| self.runtime_error(ErrorKind::TypeError("Only tables support indexing.".to_string())))?;
                    let v = unsafe { (*tbl).table.get(&key).unwrap_or(Value::Nil) };
                    self.push(v);
                }
                OpCode::TableSet => {
                    let value = self.pop();
                    let key = self.pop();
                    let recv = self.pop();
                    let tbl = object::as_table(&recv)
                        .ok_or_else(|| self.runtime_error(ErrorKind::TypeError("Only tables support indexing.".to_string())))?;
                    unsafe {
                        (*tbl).table.set(key, value);
                    }
                    self.push(value);
                }
            }
        }
    }

    // --- call protocol ---

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let p = match callee.as_obj() {
            Some(p) => p,
            None => return Err(self.runtime_error(ErrorKind::InvalidCall("Can only call functions and classes.".to_string()))),
        };
        match unsafe { (*p).kind } {
            ObjKind::Closure => self.call_closure(p as *mut ObjClosure, argc),
            ObjKind::Native => self.call_native(p as *mut ObjNative, argc),
            ObjKind::Class => self.call_class(p as *mut ObjClass, argc),
            ObjKind::BoundMethod => {
                let bm = p as *mut ObjBoundMethod;
                let (receiver, method) = unsafe { ((*bm).receiver, (*bm).method) };
                let start = self.stack.len() - argc - 1;
                self.stack[start] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(self.runtime_error(ErrorKind::InvalidCall("Can only call functions and classes.".to_string()))),
        }
    }

    fn call_closure(&mut self, closure: *mut ObjClosure, argc: usize) -> Result<(), RuntimeError> {
        let func = unsafe { (*closure).function };
        let arity = unsafe { (*func).arity as usize };
        if argc != arity {
            return Err(self.runtime_error(ErrorKind::InvalidCall(format!("Expected {arity} arguments but got {argc}."))));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error(ErrorKind::StackOverflow));
        }
        let slot_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure, ip: 0, slot_base });
        Ok(())
    }

    fn call_native(&mut self, native: *mut ObjNative, argc: usize) -> Result<(), RuntimeError> {
        let (id, arity) = unsafe { ((*native).id, (*native).arity) };
        if arity >= 0 && arity as usize != argc {
            return Err(self.runtime_error(ErrorKind::InvalidCall(format!("Expected {arity} arguments but got {argc}."))));
        }
        let start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[start..].to_vec();
        let roots = self.collect_roots();
        let result =
            natives::call(id, &mut self.heap, &args, &roots).map_err(|m| self.runtime_error(ErrorKind::TypeError(m)))?;
        self.stack.truncate(start - 1);
        self.push(result);
        Ok(())
    }

    fn call_class(&mut self, class_ptr: *mut ObjClass, argc: usize) -> Result<(), RuntimeError> {
        let roots = self.collect_roots();
        let inst_ptr = self.heap.new_instance(class_ptr, &roots);
        let start = self.stack.len() - argc - 1;
        self.stack[start] = Value::Obj(inst_ptr as *mut ObjHeader);
        let init = unsafe { (*class_ptr).methods.get(&Value::Obj(self.init_string as *mut ObjHeader)) };
        match init {
            Some(init_v) => {
                let closure_ptr = object::as_closure(&init_v).unwrap();
                self.call_closure(closure_ptr, argc)
            }
            None if argc != 0 => Err(self.runtime_error(ErrorKind::InvalidCall(format!("Expected 0 arguments but got {argc}.")))),
            None => Ok(()),
        }
    }

    fn invoke(&mut self, name: *mut ObjString, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let inst_ptr = object::as_instance(&receiver)
            .ok_or_else(|| self.runtime_error(ErrorKind::TypeError("Only instances have methods.".to_string())))?;
        let field = unsafe { (*inst_ptr).fields.get(&Value::Obj(name as *mut ObjHeader)) };
        if let Some(v) = field {
            let start = self.stack.len() - argc - 1;
            self.stack[start] = v;
            return self.call_value(v, argc);
        }
        let class_ptr = unsafe { (*inst_ptr).class };
        self.invoke_from_class(class_ptr, name, argc)
    }

    fn invoke_from_class(&mut self, class: *mut ObjClass, name: *mut ObjString, argc: usize) -> Result<(), RuntimeError> {
        let method_v = unsafe { (*class).methods.get(&Value::Obj(name as *mut ObjHeader)) };
        match method_v {
            Some(m) => {
                let closure_ptr = object::as_closure(&m).unwrap();
                self.call_closure(closure_ptr, argc)
            }
            None => {
                let msg = unsafe { (*name).chars.clone() };
                Err(self.runtime_error(ErrorKind::UndefinedProperty(msg)))
            }
        }
    }

    fn get_property(&mut self, name: *mut ObjString) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        let inst_ptr = object::as_instance(&receiver)
            .ok_or_else(|| self.runtime_error(ErrorKind::TypeError("Only instances have properties.".to_string())))?;
        let field = unsafe { (*inst_ptr).fields.get(&Value::Obj(name as *mut ObjHeader)) };
        if let Some(v) = field {
            self.pop();
            self.push(v);
            return Ok(());
        }
        let class_ptr = unsafe { (*inst_ptr).class };
        let bound = self.bind_method(class_ptr, name, receiver)?;
        self.pop();
        self.push(bound);
        Ok(())
    }

    fn bind_method(&mut self, class: *mut ObjClass, name: *mut ObjString, receiver: Value) -> Result<Value, RuntimeError> {
        let method_v = unsafe { (*class).methods.get(&Value::Obj(name as *mut ObjHeader)) };
        match method_v {
            Some(m) => {
                let closure_ptr = object::as_closure(&m).unwrap();
                let roots = self.collect_roots();
                let bound = self.heap.new_bound_method(receiver, closure_ptr, &roots);
                Ok(Value::Obj(bound as *mut ObjHeader))
            }
            None => {
                let msg = unsafe { (*name).chars.clone() };
                Err(self.runtime_error(ErrorKind::UndefinedProperty(msg)))
            }
        }
    }

    fn define_method(&mut self, name: *mut ObjString) {
        let method = self.peek(0);
        let class_v = self.peek(1);
        let class_ptr = object::as_class(&class_v).unwrap();
        unsafe {
            (*class_ptr).methods.set(Value::Obj(name as *mut ObjHeader), method);
        }
        self.pop();
    }

    // --- upvalues ---

    fn capture_upvalue(&mut self, stack_index: usize) -> *mut ObjUpvalue {
        let mut up = self.open_upvalues;
        while !up.is_null() {
            if let UpvalueLoc::Open(idx) = unsafe { &(*up).location } {
                if *idx == stack_index {
                    return up;
                }
            }
            up = unsafe { (*up).next_open };
        }
        let roots = self.collect_roots();
        let created = self.heap.new_upvalue(stack_index, &roots);
        unsafe {
            (*created).next_open = self.open_upvalues;
        }
        self.open_upvalues = created;
        created
    }

    /// Closes every open upvalue pointing at `from_index` or higher (a
    /// frame/block exiting invalidates those stack slots).
    fn close_upvalues(&mut self, from_index: usize) {
        let mut prev: *mut ObjUpvalue = std::ptr::null_mut();
        let mut up = self.open_upvalues;
        while !up.is_null() {
            let next = unsafe { (*up).next_open };
            let idx = match unsafe { &(*up).location } {
                UpvalueLoc::Open(idx) => Some(*idx),
                UpvalueLoc::Closed(_) => None,
            };
            match idx {
                Some(idx) if idx >= from_index => {
                    let value = self.stack[idx];
                    unsafe {
                        (*up).location = UpvalueLoc::Closed(value);
                    }
                    if prev.is_null() {
                        self.open_upvalues = next;
                    } else {
                        unsafe {
                            (*prev).next_open = next;
                        }
                    }
                }
                _ => prev = up,
            }
            up = next;
        }
    }

    fn read_upvalue(&self, up: *mut ObjUpvalue) -> Value {
        match unsafe { &(*up).location } {
            UpvalueLoc::Open(idx) => self.stack[*idx],
            UpvalueLoc::Closed(v) => *v,
        }
    }

    fn write_upvalue(&mut self, up: *mut ObjUpvalue, value: Value) {
        match unsafe { &mut (*up).location } {
            UpvalueLoc::Open(idx) => self.stack[*idx] = value,
            UpvalueLoc::Closed(v) => *v = value,
        }
    }

    // --- arithmetic ---

    fn number_binary(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (a, b) = (self.peek(1).as_number(), self.peek(0).as_number());
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(f(a, b)));
                Ok(())
            }
            _ => Err(self.runtime_error(ErrorKind::TypeError("Operands must be numbers.".to_string()))),
        }
    }

    fn number_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = (self.peek(1).as_number(), self.peek(0).as_number());
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Bool(f(a, b)));
                Ok(())
            }
            _ => Err(self.runtime_error(ErrorKind::TypeError("Operands must be numbers.".to_string()))),
        }
    }

    fn int_binary(&mut self, f: impl Fn(i64, i64) -> i64) -> Result<(), RuntimeError> {
        let (a, b) = (self.peek(1).as_number(), self.peek(0).as_number());
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(f(a as i64, b as i64) as f64));
                Ok(())
            }
            _ => Err(self.runtime_error(ErrorKind::TypeError("Operands must be numbers.".to_string()))),
        }
    }

    fn divide(&mut self) -> Result<(), RuntimeError> {
        let (a, b) = (self.peek(1).as_number(), self.peek(0).as_number());
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a / b));
                Ok(())
            }
            _ => Err(self.runtime_error(ErrorKind::TypeError("Operands must be numbers.".to_string()))),
        }
    }

    fn modulo(&mut self) -> Result<(), RuntimeError> {
        let (a, b) = (self.peek(1).as_number(), self.peek(0).as_number());
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a % b));
                Ok(())
            }
            _ => Err(self.runtime_error(ErrorKind::TypeError("Operands must be numbers.".to_string()))),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let (a, b) = (self.peek(1), self.peek(0));
        if let (Some(an), Some(bn)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::Number(an + bn));
            return Ok(());
        }
        if a.is_obj_kind(ObjKind::Str) && b.is_obj_kind(ObjKind::Str) {
            let combined = format!("{}{}", a.as_str().unwrap(), b.as_str().unwrap());
            self.pop();
            self.pop();
            let roots = self.collect_roots();
            let ptr = self.heap.intern(&combined, &roots);
            self.push(Value::Obj(ptr as *mut ObjHeader));
            return Ok(());
        }
        Err(self.runtime_error(ErrorKind::TypeError("Operands must be two numbers or two strings.".to_string())))
    }

    // --- bytecode stream ---

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn current_chunk(&self) -> &Chunk {
        unsafe { &(*(*self.current_frame().closure).function).chunk }
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.current_frame().ip;
        let byte = self.current_chunk().code[ip];
        self.current_frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        self.current_chunk().constants[idx]
    }

    fn read_string(&mut self) -> *mut ObjString {
        self.read_constant().as_string_ptr().unwrap()
    }

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn trace_instruction(&self) {
        eprint!("          ");
        for v in &self.stack {
            eprint!("[ {} ]", object::format_value(v));
        }
        eprintln!();
        let ip = self.current_frame().ip;
        if let Some(b) = self.current_chunk().code.get(ip).copied() {
            if let Some(op) = OpCode::from_u8(b) {
                eprintln!("{ip:04} {op:?}");
            }
        }
    }

    /// Builds a trace outermost-frame-first; `RuntimeError::report` reverses
    /// it so the printed order is innermost-first, per the traceback format.
    fn runtime_error(&self, kind: ErrorKind) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in &self.frames {
            let func = unsafe { (*frame.closure).function };
            let name = object::function_name(func);
            let line = unsafe {
                let chunk = &(*func).chunk;
                let idx = frame.ip.saturating_sub(1).min(chunk.lines.len().saturating_sub(1));
                chunk.lines.get(idx).copied().unwrap_or(0)
            };
            trace.push(Frame { name, line });
        }
        RuntimeError { kind, trace }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_and_print_run_to_completion() {
        let mut vm = Vm::new();
        matches!(vm.interpret("print 1 + 2 * 3;"), InterpretResult::Ok);
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new();
        assert!(matches!(vm.interpret("print nope;"), InterpretResult::RuntimeError));
    }

    #[test]
    fn closures_capture_by_reference() {
        let mut vm = Vm::new();
        let src = r#"
            fun counter() {
                var i = 0;
                fun inc() { i = i + 1; return i; }
                return inc;
            }
            var c = counter();
            print c();
            print c();
        "#;
        assert!(matches!(vm.interpret(src), InterpretResult::Ok));
    }

    #[test]
    fn classes_with_inheritance_and_init_run() {
        let mut vm = Vm::new();
        let src = r#"
            class Animal {
                init(name) { this.name = name; }
                speak() { return this.name; }
            }
            class Dog < Animal {
                speak() { return super.speak() + " woof"; }
            }
            var d = Dog("Rex");
            print d.speak();
        "#;
        assert!(matches!(vm.interpret(src), InterpretResult::Ok));
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let mut vm = Vm::new();
        assert!(matches!(vm.interpret("var x = 1; x();"), InterpretResult::RuntimeError));
    }

    #[test]
    fn break_and_continue_affect_loop_flow() {
        let mut vm = Vm::new();
        let src = r#"
            var total = 0;
            for (var i = 0; i < 10; i = i + 1) {
                if (i == 5) break;
                if (i == 2) continue;
                total = total + i;
            }
            print total;
        "#;
        assert!(matches!(vm.interpret(src), InterpretResult::Ok));
    }
}
