// Stack-based bytecode interpreter and embedding API.
//
// One value stack shared by every call frame; each frame only knows its
// own base offset into that stack. Upvalues start "open" (pointing at a
// live stack slot) and are "closed" onto the heap when the frame that
// owns the slot returns.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::trace;

use crate::chunk::{CompiledFunction, OpCode};
use crate::error::{Error, RuntimeError};
use crate::native::{self, NativeFunction, NativeImpl};
use crate::value::{Closure, Upvalue, Value};

// Bounds guest call depth; exceeding it is a runtime stack-overflow error.
const MAX_FRAMES: usize = 64;

struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    stack_base: usize,
}

pub struct VirtualMachine {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    globals: HashMap<String, Value>,
    natives: HashMap<String, Rc<NativeFunction>>,
    output: String,
}

impl Default for VirtualMachine {
    fn default() -> VirtualMachine {
        VirtualMachine::new()
    }
}

impl VirtualMachine {
    pub fn new() -> VirtualMachine {
        let mut natives = HashMap::new();
        for native in native::builtins() {
            natives.insert(native.name.to_string(), native);
        }
        VirtualMachine {
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            globals: HashMap::new(),
            natives,
            output: String::new(),
        }
    }

    // Clears output and all user globals but retains registered natives
    // (embedding API).
    pub fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.globals.clear();
        self.output.clear();
    }

    pub fn add_native_function(&mut self, name: impl Into<String>, arity: u8, function: NativeImpl) {
        let name = name.into();
        self.natives
            .insert(name.clone(), Rc::new(NativeFunction { name: Rc::from(name.as_str()), arity, function }));
    }

    pub fn get_output(&self) -> String {
        match self.output.strip_suffix('\n') {
            Some(trimmed) => trimmed.to_string(),
            None => self.output.clone(),
        }
    }

    // Lower-level API: compile and run separately ("Compile" +
    // "Interpret(&Chunk)"). `CompiledFunction` plays the role of the
    // pre-compiled Chunk -- it already carries the Chunk plus the arity
    // and upvalue metadata a bare byte buffer wouldn't.
    pub fn compile(source: &str) -> Result<Rc<CompiledFunction>, Error> {
        crate::compiler::compile(source)
    }

    pub fn interpret_compiled(&mut self, function: Rc<CompiledFunction>) -> Result<(), Error> {
        let closure = Rc::new(Closure { function, upvalues: Vec::new() });
        self.stack.push(Value::Func(closure.clone()));
        self.call_closure(closure, 0)?;
        self.run()
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), Error> {
        let function = Self::compile(source)?;
        self.interpret_compiled(function)
    }

    // ---- stack primitives ----

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    // A well-formed chunk never pops more than it pushed; an underflow
    // here can only mean a compiler bug, not a guest error.
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler emitted unbalanced bytecode")
    }

    fn peek(&self, distance: usize) -> &Value {
        let index = self.stack.len() - 1 - distance;
        &self.stack[index]
    }

    // ---- bytecode cursor ----

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.closure.function.chunk.read_u8(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().unwrap();
        let value = frame.closure.function.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_op(&mut self) -> OpCode {
        OpCode::from_u8(self.read_u8())
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u8();
        self.frames.last().unwrap().closure.function.chunk.constant(index).clone()
    }

    fn read_constant_name(&mut self) -> Rc<String> {
        match self.read_constant() {
            Value::Str(s) => s,
            other => panic!("expected a Str constant for a global name, got {:?}", other),
        }
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        if let Some(existing) =
            self.open_upvalues.iter().find(|u| matches!(&*u.borrow(), Upvalue::Open(s) if *s == slot))
        {
            return existing.clone();
        }
        let upvalue = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.push(upvalue.clone());
        upvalue
    }

    fn read_upvalue_value(&self, upvalue: &RefCell<Upvalue>) -> Value {
        match &*upvalue.borrow() {
            Upvalue::Open(slot) => self.stack[*slot].clone(),
            Upvalue::Closed(value) => value.clone(),
        }
    }

    fn write_upvalue_value(&mut self, upvalue: &Rc<RefCell<Upvalue>>, value: Value) {
        let slot = match &*upvalue.borrow() {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        };
        match slot {
            Some(slot) => self.stack[slot] = value,
            None => *upvalue.borrow_mut() = Upvalue::Closed(value),
        }
    }

    // Closes every open upvalue pointing at `from` or a higher slot,
    // moving its value onto the heap. Called both when a lexical scope
    // ends (for just the one local being popped) and when a frame
    // returns (for every local at or above its base).
    fn close_upvalues_from(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|upvalue| {
            let slot = match &*upvalue.borrow() {
                Upvalue::Open(slot) => Some(*slot),
                Upvalue::Closed(_) => None,
            };
            match slot {
                Some(slot) if slot >= from => {
                    *upvalue.borrow_mut() = Upvalue::Closed(stack[slot].clone());
                    false
                }
                _ => true,
            }
        });
    }

    // ---- calls ----

    fn call_closure(&mut self, closure: Rc<Closure>, argc: u8) -> Result<(), Error> {
        if closure.function.arity != argc {
            return Err(RuntimeError::ArityMismatch { expected: closure.function.arity, got: argc }.into());
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(RuntimeError::StackOverflow.into());
        }
        let stack_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, stack_base });
        Ok(())
    }

    fn call_native(&mut self, native: Rc<NativeFunction>, argc: u8) -> Result<(), Error> {
        if native.arity != argc {
            return Err(RuntimeError::ArityMismatch { expected: native.arity, got: argc }.into());
        }
        let args_start = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        let result = (native.function)(&args)?;
        self.stack.truncate(args_start - 1); // drop args and the callee
        self.push(result);
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), Error> {
        match callee {
            Value::Func(closure) => self.call_closure(closure, argc),
            Value::NativeFn(native) => self.call_native(native, argc),
            other => Err(RuntimeError::NotCallable(other.type_tag()).into()),
        }
    }

    fn closure_upvalues(&mut self, function: &Rc<CompiledFunction>) -> Vec<Rc<RefCell<Upvalue>>> {
        let mut upvalues = Vec::with_capacity(function.upvalues.len());
        for _ in 0..function.upvalues.len() {
            let is_local = self.read_u8() != 0;
            let index = self.read_u8();
            if is_local {
                let base = self.frames.last().unwrap().stack_base;
                upvalues.push(self.capture_upvalue(base + index as usize));
            } else {
                let parent = self.frames.last().unwrap().closure.clone();
                upvalues.push(parent.upvalues[index as usize].clone());
            }
        }
        upvalues
    }

    // ---- the dispatch loop ----

    fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.frames.is_empty() {
                return Ok(());
            }
            let op = self.read_op();
            trace!("vm: {:?} (frame {}, stack {})", op, self.frames.len() - 1, self.stack.len());

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frames.last().unwrap().stack_base;
                    self.push(self.stack[base + slot].clone());
                }
                OpCode::SetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frames.last().unwrap().stack_base;
                    self.stack[base + slot] = self.peek(0).clone();
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant_name();
                    if let Some(value) = self.globals.get(&*name).cloned() {
                        self.push(value);
                    } else if let Some(native) = self.natives.get(&*name).cloned() {
                        self.push(Value::NativeFn(native));
                    } else {
                        return Err(RuntimeError::UndefinedGlobal((*name).clone()).into());
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant_name();
                    if !self.globals.contains_key(&*name) {
                        return Err(RuntimeError::UndefinedGlobal((*name).clone()).into());
                    }
                    let value = self.peek(0).clone();
                    self.globals.insert((*name).clone(), value);
                }
                OpCode::DefineGlobal => {
                    let name = self.read_constant_name();
                    let value = self.pop();
                    self.globals.insert((*name).clone(), value);
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_u8() as usize;
                    let upvalue = self.frames.last().unwrap().closure.upvalues[slot].clone();
                    self.push(self.read_upvalue_value(&upvalue));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_u8() as usize;
                    let upvalue = self.frames.last().unwrap().closure.upvalues[slot].clone();
                    let value = self.peek(0).clone();
                    self.write_upvalue_value(&upvalue, value);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(a.values_equal(&b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = a.values_equal(&b);
                    self.push(Value::Bool(!eq.is_truthy()));
                }
                OpCode::Greater => self.binary_op(Value::greater)?,
                OpCode::Less => self.binary_op(Value::less)?,
                OpCode::Add => self.binary_op(Value::add)?,
                OpCode::Subtract => self.binary_op(Value::sub)?,
                OpCode::Multiply => self.binary_op(Value::mul)?,
                OpCode::Divide => self.binary_op(Value::div)?,
                OpCode::Modulo => self.binary_op(Value::modulo)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(value.not());
                }
                OpCode::Negate => {
                    let value = self.pop();
                    self.push(value.negate()?);
                }
                OpCode::Print => {
                    let value = self.pop();
                    self.output.push_str(&value.display_string());
                    self.output.push('\n');
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_u8();
                    let callee = self.peek(argc as usize).clone();
                    self.call_value(callee, argc)?;
                }
                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Func(template) => template.function.clone(),
                        other => panic!("expected a Func constant for OP_CLOSURE, got {:?}", other),
                    };
                    let upvalues = self.closure_upvalues(&function);
                    self.push(Value::Func(Rc::new(Closure { function, upvalues })));
                }
                OpCode::CloseUpvalue => {
                    let slot = self.stack.len() - 1;
                    self.close_upvalues_from(slot);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues_from(frame.stack_base);
                    self.stack.truncate(frame.stack_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
            }
        }
    }

    fn binary_op(&mut self, op: impl Fn(&Value, &Value) -> Result<Value, Error>) -> Result<(), Error> {
        let b = self.pop();
        let a = self.pop();
        self.push(op(&a, &b)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> String {
        let mut vm = VirtualMachine::new();
        vm.interpret(src).unwrap();
        vm.get_output()
    }

    #[test]
    fn prints_arithmetic() {
        assert_eq!(run("print 1 + 2 * 3;"), "7");
    }

    #[test]
    fn if_else_branches() {
        assert_eq!(run("if (1 < 2) print \"yes\"; else print \"no\";"), "yes");
    }

    #[test]
    fn while_loop_accumulates() {
        assert_eq!(run("int i = 0; int sum = 0; while (i < 5) { sum = sum + i; i = i + 1; } print sum;"), "10");
    }

    #[test]
    fn for_loop_desugars_correctly() {
        assert_eq!(run("int sum = 0; for (int i = 0; i < 5; i = i + 1) { sum = sum + i; } print sum;"), "10");
    }

    #[test]
    fn recursive_function_call() {
        let src = "fun fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);";
        assert_eq!(run(src), "55");
    }

    #[test]
    fn closures_share_captured_state() {
        let src = "\
            fun counter() {\
                int count = 0;\
                fun increment() { count = count + 1; return count; }\
                return increment;\
            }\
            funref inc = counter();\
            print inc();\
            print inc();\
            print inc();\
        ";
        assert_eq!(run(src), "1\n2\n3");
    }

    #[test]
    fn native_functions_are_callable() {
        assert_eq!(run("print square(6);"), "36");
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let mut vm = VirtualMachine::new();
        let err = vm.interpret("print 1 / 0;").unwrap_err();
        assert!(matches!(err, Error::Runtime(RuntimeError::DivideByZero)));
    }

    #[test]
    fn calling_a_non_function_is_a_runtime_error() {
        let mut vm = VirtualMachine::new();
        let err = vm.interpret("int x = 1; print x();").unwrap_err();
        assert!(matches!(err, Error::Runtime(RuntimeError::NotCallable(_))));
    }

    #[test]
    fn reset_clears_globals_but_keeps_natives() {
        let mut vm = VirtualMachine::new();
        vm.interpret("int x = 5; print x;").unwrap();
        assert_eq!(vm.get_output(), "5");
        vm.reset();
        assert!(vm.interpret("print x;").is_err());
        vm.reset();
        vm.interpret("print square(4);").unwrap();
        assert_eq!(vm.get_output(), "16");
    }

    #[test]
    fn string_concatenation_coerces_non_strings() {
        assert_eq!(run("print \"n=\" + 42;"), "n=42");
    }
}
