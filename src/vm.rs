// The stack virtual machine.
//
// *Execution model*
//
// A module is a pair of constant pools plus a table of compiled functions.
// Execution starts at the entry function and proceeds one 4-byte
// instruction at a time: operands and results move across a single operand
// stack, each invocation gets a frame with numbered local slots, and arrays
// live on a reference-counted heap.
//
// *Ownership*
//
// Every value movement is a move, a copy, or a drop. Handlers that pop a
// reference and then fail release what they popped before returning, so
// after an error teardown the heap is always empty.
//
// *Validity*
//
// The instruction set is strongly typed and all bounds are checked at run
// time. The set of runtime errors is the Error enum in this file; all are
// fatal to the run.

use std::fmt;
use std::io::Write;
use std::rc::Rc;

use enumflags2::BitFlags;

use crate::bytecode::{disassemble_instruction, sign_extend, Function, Module, Opcode};
use crate::jit::{FunctionExecutor, JitStrategy, NoJit};
use crate::memory::{ArrayData, Heap, Locals, OperandStack};
use crate::value::{ElemType, HeapId, TypeSet, TypeTag, Value};

// The result of any operation.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidOpcode { pc: usize, byte: u8 },
    InvalidConstantIndex(u32),
    InvalidLocalIndex(usize),
    InvalidFunctionIndex(u32),
    StackUnderflow,
    InvalidValueType { expect: TypeSet, got: TypeTag },
    DivisionByZero,
    ArrayIndexOutOfBounds { index: i64, len: usize },
    InvalidArrayType { expect: ElemType, got: TypeTag },
    InvalidHeapId(HeapId),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidOpcode { .. } => "INVALID_OPCODE",
            Error::InvalidConstantIndex(_) => "INVALID_CONSTANT_INDEX",
            Error::InvalidLocalIndex(_) => "INVALID_LOCAL_INDEX",
            Error::InvalidFunctionIndex(_) => "INVALID_FUNCTION_INDEX",
            Error::StackUnderflow => "STACK_UNDERFLOW",
            Error::InvalidValueType { .. } => "INVALID_VALUE_TYPE",
            Error::DivisionByZero => "DIVISION_BY_ZERO",
            Error::ArrayIndexOutOfBounds { .. } => "ARRAY_INDEX_OUT_OF_BOUNDS",
            Error::InvalidArrayType { .. } => "INVALID_ARRAY_TYPE",
            Error::InvalidHeapId(_) => "INVALID_HEAP_ID",
        }
    }
}

fn type_set_names(set: TypeSet) -> String {
    let tags = [
        (TypeTag::Int, "int"),
        (TypeTag::Float, "float"),
        (TypeTag::Bool, "bool"),
        (TypeTag::Array, "array"),
        (TypeTag::Void, "void"),
    ];
    let names: Vec<&str> = tags
        .iter()
        .filter(|(tag, _)| set.contains(*tag))
        .map(|(_, name)| *name)
        .collect();
    names.join("|")
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidOpcode { pc, byte } => {
                write!(f, "INVALID_OPCODE: byte 0x{:02X} at pc {}", byte, pc)
            }
            Error::InvalidConstantIndex(index) => write!(f, "INVALID_CONSTANT_INDEX: {}", index),
            Error::InvalidLocalIndex(index) => write!(f, "INVALID_LOCAL_INDEX: {}", index),
            Error::InvalidFunctionIndex(index) => write!(f, "INVALID_FUNCTION_INDEX: {}", index),
            Error::StackUnderflow => write!(f, "STACK_UNDERFLOW"),
            Error::InvalidValueType { expect, got } => write!(
                f,
                "INVALID_VALUE_TYPE: expected {}, got {}",
                type_set_names(*expect),
                type_set_names(BitFlags::from_flag(*got)),
            ),
            Error::DivisionByZero => write!(f, "DIVISION_BY_ZERO"),
            Error::ArrayIndexOutOfBounds { index, len } => write!(
                f,
                "ARRAY_INDEX_OUT_OF_BOUNDS: index {} of length {}",
                index, len
            ),
            Error::InvalidArrayType { expect, got } => write!(
                f,
                "INVALID_ARRAY_TYPE: expected {} element, got {}",
                expect,
                type_set_names(BitFlags::from_flag(*got)),
            ),
            Error::InvalidHeapId(id) => write!(f, "INVALID_HEAP_ID: {}", id),
        }
    }
}

impl std::error::Error for Error {}

// Construct an INVALID_VALUE_TYPE error from the offending value.
fn expected(expect: TypeSet, got: &Value) -> Error {
    Error::InvalidValueType {
        expect,
        got: got.get_type(),
    }
}

// One active invocation: the function, its local slots, the program counter
// (in instruction units), and where to resume in the caller. The entry
// frame has no return address.
#[derive(Debug)]
pub struct Frame {
    pub func: usize,
    pub locals: Locals,
    pub pc: usize,
    pub ret_addr: Option<usize>,
}

// What an instruction handler tells the dispatcher about the program
// counter: advance past the instruction, branch to an explicit target, or
// leave it alone because the call stack changed.
pub enum ControlFlow {
    Advance,
    Branch(usize),
    Transfer,
}

// Generates the typed pop helpers. Popping a value of the wrong type
// releases it before reporting, so the ownership invariant holds on error
// paths.
macro_rules! pop_typed {
    ($name:ident, $variant:ident, $ty:ty) => {
        fn $name(&mut self) -> Result<$ty> {
            match self.stack.pop_move()? {
                Value::$variant(v) => Ok(v),
                other => {
                    let _ = self.heap.release_value(&other);
                    Err(expected(BitFlags::from_flag(TypeTag::$variant), &other))
                }
            }
        }
    };
}

pub struct Vm {
    module: Module,
    stack: OperandStack,
    frames: Vec<Frame>,
    heap: Heap,
    jit: Box<dyn JitStrategy>,
    trace: bool,
}

impl Vm {
    pub fn new(module: Module) -> Vm {
        Vm::with_strategy(module, Box::new(NoJit))
    }

    pub fn with_strategy(module: Module, jit: Box<dyn JitStrategy>) -> Vm {
        Vm {
            module,
            stack: OperandStack::new(),
            frames: Vec::new(),
            heap: Heap::new(),
            jit,
            trace: false,
        }
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn operand_depth(&self) -> usize {
        self.stack.depth()
    }

    // Run the module's entry function to completion.
    pub fn run(&mut self, out: &mut dyn Write) -> Result<()> {
        self.stack = OperandStack::new();
        self.frames.clear();
        self.heap = Heap::new();

        let entry = match self.module.entry_index() {
            Some(index) => index,
            None => {
                return Err(Error::InvalidFunctionIndex(
                    self.module.functions.len() as u32
                ))
            }
        };
        let locals = Locals::new(self.module.functions[entry].locals);
        self.frames.push(Frame {
            func: entry,
            locals,
            pc: 0,
            ret_addr: None,
        });

        while !self.frames.is_empty() {
            if let Err(error) = self.step(out) {
                self.teardown();
                return Err(error);
            }
        }
        Ok(())
    }

    // Release every live value: each frame's locals and the whole operand
    // stack. Called once on the way out of a failed run.
    fn teardown(&mut self) {
        self.stack.clear_and_release(&mut self.heap);
        while let Some(mut frame) = self.frames.pop() {
            frame.locals.clear_and_release(&mut self.heap);
        }
    }

    fn current_function(&self) -> Result<&Function> {
        let frame = self.frames.last().ok_or(Error::StackUnderflow)?;
        self.module
            .functions
            .get(frame.func)
            .ok_or(Error::InvalidFunctionIndex(frame.func as u32))
    }

    // Execute a single instruction of the top frame.
    fn step(&mut self, out: &mut dyn Write) -> Result<()> {
        let Some(frame) = self.frames.last() else {
            return Ok(());
        };
        let pc = frame.pc;
        let function = self
            .module
            .functions
            .get(frame.func)
            .ok_or(Error::InvalidFunctionIndex(frame.func as u32))?;

        // Falling off the end of a function is an implicit RETURN_VOID;
        // the one-past-end pc is a valid jump target.
        if pc >= function.instruction_count() {
            self.return_void()?;
            return Ok(());
        }

        // A whole frame can be delegated to a native executor, but only
        // from the very top of the function.
        if pc == 0 && self.jit.enabled() {
            if let Some(executor) = self.jit.lookup(&function.name) {
                return self.delegate(executor);
            }
        }

        let (byte, operand) = function
            .fetch(pc)
            .ok_or(Error::InvalidOpcode { pc, byte: 0 })?;
        let op = Opcode::from_byte(byte).ok_or(Error::InvalidOpcode { pc, byte })?;

        if self.trace {
            eprintln!(
                "{:5}  {:<24} depth={}",
                pc,
                disassemble_instruction(op, operand),
                self.stack.depth()
            );
        }
        trace!("{:5}  {:<24} depth={}", pc, disassemble_instruction(op, operand), self.stack.depth());

        match self.dispatch(op, operand, pc, out)? {
            ControlFlow::Advance => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.pc += 1;
                }
            }
            ControlFlow::Branch(target) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.pc = target;
                }
            }
            // The handler pushed or popped a frame; callers manage their
            // own program counters.
            ControlFlow::Transfer => {}
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        op: Opcode,
        operand: u32,
        pc: usize,
        out: &mut dyn Write,
    ) -> Result<ControlFlow> {
        match op {
            Opcode::PushInt => {
                let value = self
                    .module
                    .constants
                    .int(operand)
                    .ok_or(Error::InvalidConstantIndex(operand))?;
                self.stack.push_move(Value::Int(value));
                Ok(ControlFlow::Advance)
            }
            Opcode::PushFloat => {
                let value = self
                    .module
                    .constants
                    .float(operand)
                    .ok_or(Error::InvalidConstantIndex(operand))?;
                self.stack.push_move(Value::Float(value));
                Ok(ControlFlow::Advance)
            }
            Opcode::PushBool => {
                self.stack.push_move(Value::Bool(operand != 0));
                Ok(ControlFlow::Advance)
            }
            Opcode::Pop => {
                self.stack.pop_drop(&mut self.heap)?;
                Ok(ControlFlow::Advance)
            }
            Opcode::LoadLocal => self.load_local(operand as usize),
            Opcode::StoreLocal => self.store_local(operand as usize),

            // Integer arithmetic wraps silently, matching native two's
            // complement behavior.
            Opcode::AddInt => self.int_binop(|a, b| Ok(Value::Int(a.wrapping_add(b)))),
            Opcode::SubInt => self.int_binop(|a, b| Ok(Value::Int(a.wrapping_sub(b)))),
            Opcode::MulInt => self.int_binop(|a, b| Ok(Value::Int(a.wrapping_mul(b)))),
            Opcode::DivInt => self.int_binop(|a, b| {
                if b == 0 {
                    Err(Error::DivisionByZero)
                } else {
                    Ok(Value::Int(a.wrapping_div(b)))
                }
            }),
            Opcode::ModInt => self.int_binop(|a, b| {
                if b == 0 {
                    Err(Error::DivisionByZero)
                } else {
                    Ok(Value::Int(a.wrapping_rem(b)))
                }
            }),
            Opcode::NegInt => {
                let a = self.pop_int()?;
                self.stack.push_move(Value::Int(a.wrapping_neg()));
                Ok(ControlFlow::Advance)
            }

            // Floats are IEEE 754 and never trap; division by zero yields
            // an infinity or NaN.
            Opcode::AddFloat => self.float_binop(|a, b| Value::Float(a + b)),
            Opcode::SubFloat => self.float_binop(|a, b| Value::Float(a - b)),
            Opcode::MulFloat => self.float_binop(|a, b| Value::Float(a * b)),
            Opcode::DivFloat => self.float_binop(|a, b| Value::Float(a / b)),
            Opcode::NegFloat => {
                let a = self.pop_float()?;
                self.stack.push_move(Value::Float(-a));
                Ok(ControlFlow::Advance)
            }

            Opcode::EqInt => self.int_binop(|a, b| Ok(Value::Bool(a == b))),
            Opcode::NeInt => self.int_binop(|a, b| Ok(Value::Bool(a != b))),
            Opcode::LtInt => self.int_binop(|a, b| Ok(Value::Bool(a < b))),
            Opcode::LeInt => self.int_binop(|a, b| Ok(Value::Bool(a <= b))),
            Opcode::GtInt => self.int_binop(|a, b| Ok(Value::Bool(a > b))),
            Opcode::GeInt => self.int_binop(|a, b| Ok(Value::Bool(a >= b))),

            Opcode::EqFloat => self.float_binop(|a, b| Value::Bool(a == b)),
            Opcode::NeFloat => self.float_binop(|a, b| Value::Bool(a != b)),
            Opcode::LtFloat => self.float_binop(|a, b| Value::Bool(a < b)),
            Opcode::LeFloat => self.float_binop(|a, b| Value::Bool(a <= b)),
            Opcode::GtFloat => self.float_binop(|a, b| Value::Bool(a > b)),
            Opcode::GeFloat => self.float_binop(|a, b| Value::Bool(a >= b)),

            Opcode::And => self.bool_binop(|a, b| a && b),
            Opcode::Or => self.bool_binop(|a, b| a || b),
            Opcode::Not => {
                let a = self.pop_bool()?;
                self.stack.push_move(Value::Bool(!a));
                Ok(ControlFlow::Advance)
            }

            Opcode::Jump => self.jump(pc, operand, op),
            Opcode::JumpIfFalse => {
                let cond = self.pop_bool()?;
                if cond {
                    Ok(ControlFlow::Advance)
                } else {
                    self.jump(pc, operand, op)
                }
            }
            Opcode::JumpIfTrue => {
                let cond = self.pop_bool()?;
                if cond {
                    self.jump(pc, operand, op)
                } else {
                    Ok(ControlFlow::Advance)
                }
            }

            Opcode::Call => self.call(pc, operand),
            Opcode::Return => self.return_value(),
            Opcode::ReturnVoid => self.return_void(),

            Opcode::NewArrayInt => self.new_array(ElemType::Int),
            Opcode::NewArrayFloat => self.new_array(ElemType::Float),
            Opcode::NewArrayBool => self.new_array(ElemType::Bool),
            Opcode::ArrayLoad => self.array_load(),
            Opcode::ArrayStore => self.array_store(),

            Opcode::Print => self.print(out),
            Opcode::PrintArray => self.print_array(out),
        }
    }

    pop_typed!(pop_int, Int, i64);
    pop_typed!(pop_float, Float, f64);
    pop_typed!(pop_bool, Bool, bool);
    pop_typed!(pop_array, Array, HeapId);

    fn int_binop<F>(&mut self, f: F) -> Result<ControlFlow>
    where
        F: FnOnce(i64, i64) -> Result<Value>,
    {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.stack.push_move(f(a, b)?);
        Ok(ControlFlow::Advance)
    }

    fn float_binop<F>(&mut self, f: F) -> Result<ControlFlow>
    where
        F: FnOnce(f64, f64) -> Value,
    {
        let b = self.pop_float()?;
        let a = self.pop_float()?;
        self.stack.push_move(f(a, b));
        Ok(ControlFlow::Advance)
    }

    fn bool_binop<F>(&mut self, f: F) -> Result<ControlFlow>
    where
        F: FnOnce(bool, bool) -> bool,
    {
        let b = self.pop_bool()?;
        let a = self.pop_bool()?;
        self.stack.push_move(Value::Bool(f(a, b)));
        Ok(ControlFlow::Advance)
    }

    fn load_local(&mut self, index: usize) -> Result<ControlFlow> {
        let frame = self.frames.last().ok_or(Error::StackUnderflow)?;
        let value = frame.locals.get_copy(index, &mut self.heap)?;
        self.stack.push_move(value);
        Ok(ControlFlow::Advance)
    }

    fn store_local(&mut self, index: usize) -> Result<ControlFlow> {
        let value = self.stack.pop_move()?;
        let frame = self.frames.last_mut().ok_or(Error::StackUnderflow)?;
        match frame.locals.set_move(index, value, &mut self.heap) {
            Ok(()) => Ok(ControlFlow::Advance),
            Err(error) => {
                let _ = self.heap.release_value(&value);
                Err(error)
            }
        }
    }

    // Displacements are signed and measured in instruction units relative
    // to the jumping instruction. The one-past-end address is a legal
    // target; anything outside [0, count] is not.
    fn jump(&mut self, pc: usize, operand: u32, op: Opcode) -> Result<ControlFlow> {
        let count = self.current_function()?.instruction_count();
        let target = pc as i64 + sign_extend(operand) as i64;
        if target < 0 || target > count as i64 {
            return Err(Error::InvalidOpcode {
                pc,
                byte: op as u8,
            });
        }
        Ok(ControlFlow::Branch(target as usize))
    }

    fn call(&mut self, pc: usize, operand: u32) -> Result<ControlFlow> {
        let index = operand as usize;
        let function = self
            .module
            .functions
            .get(index)
            .ok_or(Error::InvalidFunctionIndex(operand))?;
        let arity = function.arity();
        let locals_count = function.locals;
        self.jit.record_call(&function.name);

        // Arguments move from the stack into the first local slots; the
        // last argument is on top.
        let mut locals = Locals::new(locals_count);
        for slot in (0..arity).rev() {
            let value = match self.stack.pop_move() {
                Ok(value) => value,
                Err(error) => {
                    locals.clear_and_release(&mut self.heap);
                    return Err(error);
                }
            };
            if let Err(error) = locals.set_move(slot, value, &mut self.heap) {
                let _ = self.heap.release_value(&value);
                locals.clear_and_release(&mut self.heap);
                return Err(error);
            }
        }

        self.frames.push(Frame {
            func: index,
            locals,
            pc: 0,
            ret_addr: Some(pc + 1),
        });
        Ok(ControlFlow::Transfer)
    }

    fn return_value(&mut self) -> Result<ControlFlow> {
        let value = self.stack.pop_move()?;
        let mut frame = self.frames.pop().ok_or(Error::StackUnderflow)?;
        frame.locals.clear_and_release(&mut self.heap);
        match (self.frames.last_mut(), frame.ret_addr) {
            (Some(caller), Some(ret_addr)) => {
                caller.pc = ret_addr;
                self.stack.push_move(value);
            }
            _ => {
                // A value returned from the entry frame has nowhere to go.
                self.heap.release_value(&value)?;
            }
        }
        Ok(ControlFlow::Transfer)
    }

    fn return_void(&mut self) -> Result<ControlFlow> {
        let mut frame = self.frames.pop().ok_or(Error::StackUnderflow)?;
        frame.locals.clear_and_release(&mut self.heap);
        if let (Some(caller), Some(ret_addr)) = (self.frames.last_mut(), frame.ret_addr) {
            caller.pc = ret_addr;
        }
        Ok(ControlFlow::Transfer)
    }

    // Hand the whole frame to a native executor. On success the operand
    // stack is already in the state the interpreter would have produced.
    fn delegate(&mut self, executor: Rc<dyn FunctionExecutor>) -> Result<()> {
        let mut frame = self.frames.pop().ok_or(Error::StackUnderflow)?;
        let result = executor.execute(&mut frame, &mut self.stack, &mut self.heap);
        frame.locals.clear_and_release(&mut self.heap);
        result?;
        if let (Some(caller), Some(ret_addr)) = (self.frames.last_mut(), frame.ret_addr) {
            caller.pc = ret_addr;
        }
        Ok(())
    }

    fn new_array(&mut self, elem: ElemType) -> Result<ControlFlow> {
        let len = self.pop_int()?;
        if len < 0 {
            return Err(Error::ArrayIndexOutOfBounds { index: len, len: 0 });
        }
        let id = self.heap.alloc(elem, len as usize);
        self.stack.push_move(Value::Array(id));
        Ok(ControlFlow::Advance)
    }

    fn array_load(&mut self) -> Result<ControlFlow> {
        let index = self.pop_int()?;
        let id = self.pop_array()?;
        let len = self.heap.get(id)?.data.len();
        if index < 0 || index as usize >= len {
            let _ = self.heap.release(id);
            return Err(Error::ArrayIndexOutOfBounds { index, len });
        }
        let value = self.heap.get(id)?.data.get(index as usize);
        self.heap.release(id)?;
        self.stack.push_move(value);
        Ok(ControlFlow::Advance)
    }

    fn store_element(&mut self, id: HeapId, index: i64, value: Value) -> Result<()> {
        let object = self.heap.get_mut(id)?;
        let len = object.data.len();
        if index < 0 || index as usize >= len {
            return Err(Error::ArrayIndexOutOfBounds { index, len });
        }
        object.data.set(index as usize, value)
    }

    fn array_store(&mut self) -> Result<ControlFlow> {
        let value = self.stack.pop_move()?;
        let index = match self.pop_int() {
            Ok(index) => index,
            Err(error) => {
                let _ = self.heap.release_value(&value);
                return Err(error);
            }
        };
        let id = match self.pop_array() {
            Ok(id) => id,
            Err(error) => {
                let _ = self.heap.release_value(&value);
                return Err(error);
            }
        };

        match self.store_element(id, index, value) {
            Ok(()) => {
                self.heap.release(id)?;
                Ok(ControlFlow::Advance)
            }
            Err(error) => {
                let _ = self.heap.release_value(&value);
                let _ = self.heap.release(id);
                Err(error)
            }
        }
    }

    fn print(&mut self, out: &mut dyn Write) -> Result<ControlFlow> {
        let value = self.stack.pop_move()?;
        match value {
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
                let _ = write!(out, "{}", value);
                Ok(ControlFlow::Advance)
            }
            other => {
                let _ = self.heap.release_value(&other);
                Err(expected(
                    TypeTag::Int | TypeTag::Float | TypeTag::Bool,
                    &other,
                ))
            }
        }
    }

    fn print_array(&mut self, out: &mut dyn Write) -> Result<ControlFlow> {
        let id = self.pop_array()?;
        let text = render_array(&self.heap.get(id)?.data);
        let _ = out.write_all(text.as_bytes());
        self.heap.release(id)?;
        Ok(ControlFlow::Advance)
    }
}

fn render_array(data: &ArrayData) -> String {
    let parts: Vec<String> = match data {
        ArrayData::Int(v) => v.iter().map(|x| format!("{}", x)).collect(),
        ArrayData::Float(v) => v.iter().map(|x| format!("{:?}", x)).collect(),
        ArrayData::Bool(v) => v.iter().map(|x| format!("{}", x)).collect(),
    };
    format!("[{}]", parts.join(", "))
}

// These tests are written against the *behavior* of the VM on hand-built
// modules: any conforming implementation should pass them. Source-level
// scenarios go through the full pipeline in the integration tests.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{encode, ConstantPool};
    use crate::jit::CountingJit;
    use crate::value::Type;

    fn asm(instructions: &[(Opcode, u32)]) -> Vec<u8> {
        let mut code = Vec::new();
        for &(op, operand) in instructions {
            code.extend_from_slice(&encode(op, operand));
        }
        code
    }

    fn func(name: &str, params: &[Type], ret: Type, locals: usize, code: Vec<u8>) -> Function {
        Function {
            name: name.to_string(),
            params: params
                .iter()
                .enumerate()
                .map(|(i, ty)| (format!("p{}", i), *ty))
                .collect(),
            ret,
            locals,
            code,
        }
    }

    fn module(ints: &[i64], floats: &[f64], functions: Vec<Function>) -> Module {
        let mut constants = ConstantPool::new();
        for &v in ints {
            constants.intern_int(v);
        }
        for &v in floats {
            constants.intern_float(v);
        }
        Module {
            constants,
            functions,
            entry: "main".to_string(),
        }
    }

    // Run to completion; return the result plus captured stdout, and check
    // the terminal heap and stack invariants.
    fn eval(module: Module) -> (Result<()>, String) {
        let mut vm = Vm::new(module);
        let mut out = Vec::new();
        let result = vm.run(&mut out);
        if result.is_err() {
            // Error teardown must have released everything.
            assert_eq!(vm.heap().object_count(), 0);
            assert_eq!(vm.operand_depth(), 0);
        }
        (result, String::from_utf8(out).unwrap())
    }

    fn assert_prints(ints: &[i64], floats: &[f64], code: &[(Opcode, u32)], expected: &str) {
        let m = module(ints, floats, vec![func("main", &[], Type::Void, 0, asm(code))]);
        let (result, out) = eval(m);
        assert_eq!(result, Ok(()));
        assert_eq!(out, expected);
    }

    fn assert_fails(ints: &[i64], floats: &[f64], code: &[(Opcode, u32)], expected: Error) {
        let m = module(ints, floats, vec![func("main", &[], Type::Void, 0, asm(code))]);
        let (result, _) = eval(m);
        assert_eq!(result, Err(expected));
    }

    #[test]
    fn test_int_arithmetic() {
        use Opcode::*;
        assert_prints(&[40, 2], &[], &[(PushInt, 0), (PushInt, 1), (AddInt, 0), (Print, 0)], "42");
        assert_prints(&[40, 2], &[], &[(PushInt, 0), (PushInt, 1), (SubInt, 0), (Print, 0)], "38");
        assert_prints(&[40, 2], &[], &[(PushInt, 0), (PushInt, 1), (MulInt, 0), (Print, 0)], "80");
        assert_prints(&[40, 2], &[], &[(PushInt, 0), (PushInt, 1), (DivInt, 0), (Print, 0)], "20");
        assert_prints(&[40, 3], &[], &[(PushInt, 0), (PushInt, 1), (ModInt, 0), (Print, 0)], "1");
        assert_prints(&[40], &[], &[(PushInt, 0), (NegInt, 0), (Print, 0)], "-40");
    }

    #[test]
    fn test_int_overflow_wraps() {
        use Opcode::*;
        assert_prints(
            &[i64::MAX, 1],
            &[],
            &[(PushInt, 0), (PushInt, 1), (AddInt, 0), (Print, 0)],
            "-9223372036854775808",
        );
        // i64::MIN / -1 also wraps instead of trapping.
        assert_prints(
            &[i64::MIN, -1],
            &[],
            &[(PushInt, 0), (PushInt, 1), (DivInt, 0), (Print, 0)],
            "-9223372036854775808",
        );
        assert_prints(&[i64::MIN], &[], &[(PushInt, 0), (NegInt, 0), (Print, 0)], "-9223372036854775808");
    }

    #[test]
    fn test_division_by_zero() {
        use Opcode::*;
        assert_fails(
            &[10, 0],
            &[],
            &[(PushInt, 0), (PushInt, 1), (DivInt, 0)],
            Error::DivisionByZero,
        );
        assert_fails(
            &[10, 0],
            &[],
            &[(PushInt, 0), (PushInt, 1), (ModInt, 0)],
            Error::DivisionByZero,
        );
    }

    #[test]
    fn test_float_arithmetic() {
        use Opcode::*;
        assert_prints(
            &[],
            &[1.5, 2.25],
            &[(PushFloat, 0), (PushFloat, 1), (AddFloat, 0), (Print, 0)],
            "3.75",
        );
        // IEEE division by zero is not an error.
        assert_prints(
            &[],
            &[1.0, 0.0],
            &[(PushFloat, 0), (PushFloat, 1), (DivFloat, 0), (Print, 0)],
            "inf",
        );
        assert_prints(
            &[],
            &[0.0],
            &[(PushFloat, 0), (PushFloat, 0), (DivFloat, 0), (Print, 0)],
            "NaN",
        );
        assert_prints(&[], &[2.5], &[(PushFloat, 0), (NegFloat, 0), (Print, 0)], "-2.5");
    }

    #[test]
    fn test_comparisons() {
        use Opcode::*;
        assert_prints(&[2, 3], &[], &[(PushInt, 0), (PushInt, 1), (LtInt, 0), (Print, 0)], "true");
        assert_prints(&[2, 2], &[], &[(PushInt, 0), (PushInt, 1), (GeInt, 0), (Print, 0)], "true");
        assert_prints(&[2, 3], &[], &[(PushInt, 0), (PushInt, 1), (EqInt, 0), (Print, 0)], "false");
        assert_prints(&[2, 3], &[], &[(PushInt, 0), (PushInt, 1), (NeInt, 0), (Print, 0)], "true");

        // NaN is ordered by ==/!= only.
        assert_prints(
            &[],
            &[f64::NAN],
            &[(PushFloat, 0), (PushFloat, 0), (EqFloat, 0), (Print, 0)],
            "false",
        );
        assert_prints(
            &[],
            &[f64::NAN],
            &[(PushFloat, 0), (PushFloat, 0), (NeFloat, 0), (Print, 0)],
            "true",
        );
        assert_prints(
            &[],
            &[f64::NAN, 1.0],
            &[(PushFloat, 0), (PushFloat, 1), (LeFloat, 0), (Print, 0)],
            "false",
        );
    }

    #[test]
    fn test_logic() {
        use Opcode::*;
        assert_prints(&[], &[], &[(PushBool, 1), (PushBool, 0), (And, 0), (Print, 0)], "false");
        assert_prints(&[], &[], &[(PushBool, 1), (PushBool, 0), (Or, 0), (Print, 0)], "true");
        assert_prints(&[], &[], &[(PushBool, 0), (Not, 0), (Print, 0)], "true");

        // Logic is typed: an int operand is rejected.
        assert_fails(
            &[1],
            &[],
            &[(PushInt, 0), (Not, 0)],
            Error::InvalidValueType {
                expect: BitFlags::from_flag(TypeTag::Bool),
                got: TypeTag::Int,
            },
        );
    }

    #[test]
    fn test_typed_arithmetic_rejects_mixed_operands() {
        use Opcode::*;
        assert_fails(
            &[1],
            &[2.0],
            &[(PushInt, 0), (PushFloat, 0), (AddInt, 0)],
            Error::InvalidValueType {
                expect: BitFlags::from_flag(TypeTag::Int),
                got: TypeTag::Float,
            },
        );
    }

    #[test]
    fn test_jumps() {
        use Opcode::*;
        // Skip over a push: prints only the second constant.
        assert_prints(
            &[1, 2],
            &[],
            &[(Jump, 2), (PushInt, 0), (PushInt, 1), (Print, 0)],
            "2",
        );

        // Backward displacement: loop decrementing from 3 to 0.
        //  0 PUSH_INT 3
        //  1 STORE_LOCAL 0
        //  2 LOAD_LOCAL 0
        //  3 PUSH_INT 0
        //  4 GT_INT
        //  5 JUMP_IF_FALSE +6  -> 11
        //  6 LOAD_LOCAL 0
        //  7 PUSH_INT 1
        //  8 SUB_INT
        //  9 STORE_LOCAL 0
        // 10 JUMP -8           -> 2
        // 11 LOAD_LOCAL 0
        // 12 PRINT
        let m = module(
            &[3, 0, 1],
            &[],
            vec![func(
                "main",
                &[],
                Type::Void,
                1,
                asm(&[
                    (PushInt, 0),
                    (StoreLocal, 0),
                    (LoadLocal, 0),
                    (PushInt, 1),
                    (GtInt, 0),
                    (JumpIfFalse, 6),
                    (LoadLocal, 0),
                    (PushInt, 2),
                    (SubInt, 0),
                    (StoreLocal, 0),
                    (Jump, crate::bytecode::encode_displacement(-8)),
                    (LoadLocal, 0),
                    (Print, 0),
                ]),
            )],
        );
        let (result, out) = eval(m);
        assert_eq!(result, Ok(()));
        assert_eq!(out, "0");
    }

    #[test]
    fn test_jump_one_past_end_is_implicit_return() {
        use Opcode::*;
        assert_prints(&[7], &[], &[(PushInt, 0), (Print, 0), (Jump, 1)], "7");
    }

    #[test]
    fn test_jump_out_of_range() {
        use Opcode::*;
        assert_fails(
            &[],
            &[],
            &[(Jump, 9)],
            Error::InvalidOpcode {
                pc: 0,
                byte: Opcode::Jump as u8,
            },
        );
        assert_fails(
            &[],
            &[],
            &[(Jump, crate::bytecode::encode_displacement(-1))],
            Error::InvalidOpcode {
                pc: 0,
                byte: Opcode::Jump as u8,
            },
        );
    }

    #[test]
    fn test_jump_if_true() {
        use Opcode::*;
        assert_prints(
            &[1, 2],
            &[],
            &[(PushBool, 1), (JumpIfTrue, 2), (PushInt, 0), (PushInt, 1), (Print, 0)],
            "2",
        );
    }

    #[test]
    fn test_reserved_opcode() {
        let m = module(
            &[],
            &[],
            vec![func("main", &[], Type::Void, 0, vec![0x00, 0, 0, 0])],
        );
        let (result, _) = eval(m);
        assert_eq!(result, Err(Error::InvalidOpcode { pc: 0, byte: 0x00 }));
    }

    #[test]
    fn test_constant_and_local_index_errors() {
        use Opcode::*;
        assert_fails(&[], &[], &[(PushInt, 5)], Error::InvalidConstantIndex(5));
        assert_fails(&[], &[], &[(PushFloat, 0)], Error::InvalidConstantIndex(0));
        // Out-of-range slot, and a slot that was never stored.
        assert_fails(&[], &[], &[(LoadLocal, 3)], Error::InvalidLocalIndex(3));
        let m = module(
            &[],
            &[],
            vec![func("main", &[], Type::Void, 1, asm(&[(LoadLocal, 0)]))],
        );
        let (result, _) = eval(m);
        assert_eq!(result, Err(Error::InvalidLocalIndex(0)));
    }

    #[test]
    fn test_stack_underflow() {
        use Opcode::*;
        assert_fails(&[], &[], &[(Pop, 0)], Error::StackUnderflow);
        assert_fails(&[], &[], &[(AddInt, 0)], Error::StackUnderflow);
    }

    #[test]
    fn test_locals_round_trip() {
        use Opcode::*;
        let m = module(
            &[11],
            &[],
            vec![func(
                "main",
                &[],
                Type::Void,
                1,
                asm(&[(PushInt, 0), (StoreLocal, 0), (LoadLocal, 0), (Print, 0)]),
            )],
        );
        let (result, out) = eval(m);
        assert_eq!(result, Ok(()));
        assert_eq!(out, "11");
    }

    #[test]
    fn test_calls_and_recursion() {
        use Opcode::*;
        // func fact(n: int): int {
        //   if (n <= 1) { return 1; } else { return n * fact(n - 1); }
        // }
        let fact = func(
            "fact",
            &[Type::Int],
            Type::Int,
            1,
            asm(&[
                (LoadLocal, 0),
                (PushInt, 0), // 1
                (LeInt, 0),
                (JumpIfFalse, 3), // -> 6
                (PushInt, 0),     // 1
                (Return, 0),
                (LoadLocal, 0),
                (LoadLocal, 0),
                (PushInt, 0), // 1
                (SubInt, 0),
                (Call, 1), // fact
                (MulInt, 0),
                (Return, 0),
            ]),
        );
        let main = func(
            "main",
            &[],
            Type::Void,
            0,
            asm(&[(PushInt, 1), (Call, 1), (Print, 0), (ReturnVoid, 0)]),
        );
        let m = module(&[1, 5], &[], vec![main, fact]);
        let (result, out) = eval(m);
        assert_eq!(result, Ok(()));
        assert_eq!(out, "120");
    }

    #[test]
    fn test_argument_transfer_order() {
        use Opcode::*;
        // sub(a, b) = a - b; args are pushed left to right, so the last
        // argument is popped into the highest slot.
        let sub = func(
            "sub",
            &[Type::Int, Type::Int],
            Type::Int,
            2,
            asm(&[(LoadLocal, 0), (LoadLocal, 1), (SubInt, 0), (Return, 0)]),
        );
        let main = func(
            "main",
            &[],
            Type::Void,
            0,
            asm(&[(PushInt, 0), (PushInt, 1), (Call, 1), (Print, 0)]),
        );
        let m = module(&[10, 4], &[], vec![main, sub]);
        let (result, out) = eval(m);
        assert_eq!(result, Ok(()));
        assert_eq!(out, "6");
    }

    #[test]
    fn test_void_callee_falls_off_end() {
        use Opcode::*;
        // noop() has no explicit return; falling off the end is an
        // implicit RETURN_VOID.
        let noop = func("noop", &[], Type::Void, 0, asm(&[]));
        let main = func(
            "main",
            &[],
            Type::Void,
            0,
            asm(&[(Call, 1), (PushInt, 0), (Print, 0)]),
        );
        let m = module(&[5], &[], vec![main, noop]);
        let (result, out) = eval(m);
        assert_eq!(result, Ok(()));
        assert_eq!(out, "5");
    }

    #[test]
    fn test_invalid_function_index() {
        use Opcode::*;
        assert_fails(&[], &[], &[(Call, 7)], Error::InvalidFunctionIndex(7));
    }

    #[test]
    fn test_missing_entry() {
        let m = module(&[], &[], vec![func("helper", &[], Type::Void, 0, asm(&[]))]);
        let mut vm = Vm::new(m);
        let mut out = Vec::new();
        assert_eq!(vm.run(&mut out), Err(Error::InvalidFunctionIndex(1)));
    }

    #[test]
    fn test_arrays() {
        use Opcode::*;
        // let a = int[2]; a[0] = 7; a[1] = a[0] + 1; printArray(a)
        let m = module(
            &[2, 0, 7, 1],
            &[],
            vec![func(
                "main",
                &[],
                Type::Void,
                1,
                asm(&[
                    (PushInt, 0), // 2
                    (NewArrayInt, 0),
                    (StoreLocal, 0),
                    (LoadLocal, 0),
                    (PushInt, 1), // 0
                    (PushInt, 2), // 7
                    (ArrayStore, 0),
                    (LoadLocal, 0),
                    (PushInt, 3), // 1
                    (LoadLocal, 0),
                    (PushInt, 1), // 0
                    (ArrayLoad, 0),
                    (PushInt, 3), // 1
                    (AddInt, 0),
                    (ArrayStore, 0),
                    (LoadLocal, 0),
                    (PrintArray, 0),
                ]),
            )],
        );
        let (result, out) = eval(m);
        assert_eq!(result, Ok(()));
        assert_eq!(out, "[7, 8]");
    }

    #[test]
    fn test_array_refcounts_balance() {
        use Opcode::*;
        let m = module(
            &[1],
            &[],
            vec![func(
                "main",
                &[],
                Type::Void,
                1,
                asm(&[
                    (PushInt, 0),
                    (NewArrayInt, 0),
                    (StoreLocal, 0),
                    (LoadLocal, 0),
                    (Pop, 0),
                ]),
            )],
        );
        let mut vm = Vm::new(m);
        let mut out = Vec::new();
        assert_eq!(vm.run(&mut out), Ok(()));
        assert_eq!(vm.heap().object_count(), 0);
        assert_eq!(vm.operand_depth(), 0);
    }

    #[test]
    fn test_array_bounds() {
        use Opcode::*;
        // Index == length is out of bounds.
        assert_fails(
            &[2],
            &[],
            &[(PushInt, 0), (NewArrayInt, 0), (PushInt, 0), (ArrayLoad, 0)],
            Error::ArrayIndexOutOfBounds { index: 2, len: 2 },
        );
        // Negative size.
        assert_fails(
            &[-1],
            &[],
            &[(PushInt, 0), (NewArrayBool, 0)],
            Error::ArrayIndexOutOfBounds { index: -1, len: 0 },
        );
    }

    #[test]
    fn test_array_element_type_check() {
        use Opcode::*;
        assert_fails(
            &[1, 0],
            &[2.0],
            &[
                (PushInt, 0),
                (NewArrayInt, 0),
                (PushInt, 1),
                (PushFloat, 0),
                (ArrayStore, 0),
            ],
            Error::InvalidArrayType {
                expect: ElemType::Int,
                got: TypeTag::Float,
            },
        );
    }

    #[test]
    fn test_print_rejects_arrays() {
        use Opcode::*;
        let m = module(
            &[1],
            &[],
            vec![func(
                "main",
                &[],
                Type::Void,
                0,
                asm(&[(PushInt, 0), (NewArrayInt, 0), (Print, 0)]),
            )],
        );
        let (result, _) = eval(m);
        assert_eq!(
            result,
            Err(Error::InvalidValueType {
                expect: TypeTag::Int | TypeTag::Float | TypeTag::Bool,
                got: TypeTag::Array,
            })
        );
    }

    #[test]
    fn test_print_array_forms() {
        use Opcode::*;
        assert_prints(&[0], &[], &[(PushInt, 0), (NewArrayInt, 0), (PrintArray, 0)], "[]");
        assert_prints(
            &[2],
            &[],
            &[(PushInt, 0), (NewArrayBool, 0), (PrintArray, 0)],
            "[false, false]",
        );
        assert_prints(
            &[2],
            &[],
            &[(PushInt, 0), (NewArrayFloat, 0), (PrintArray, 0)],
            "[0.0, 0.0]",
        );
    }

    #[test]
    fn test_error_teardown_releases_everything() {
        use Opcode::*;
        // One array parked in a local, one live on the stack, then a
        // division by zero. Everything must be released.
        let m = module(
            &[1, 10, 0],
            &[],
            vec![func(
                "main",
                &[],
                Type::Void,
                1,
                asm(&[
                    (PushInt, 0),
                    (NewArrayInt, 0),
                    (StoreLocal, 0),
                    (PushInt, 0),
                    (NewArrayFloat, 0),
                    (PushInt, 1),
                    (PushInt, 2),
                    (DivInt, 0),
                ]),
            )],
        );
        let mut vm = Vm::new(m);
        let mut out = Vec::new();
        assert_eq!(vm.run(&mut out), Err(Error::DivisionByZero));
        assert_eq!(vm.heap().object_count(), 0);
        assert_eq!(vm.operand_depth(), 0);
    }

    // ---- JIT delegation ----

    struct FixedInt(i64);

    impl FunctionExecutor for FixedInt {
        fn execute(
            &self,
            _frame: &mut Frame,
            stack: &mut OperandStack,
            _heap: &mut Heap,
        ) -> Result<()> {
            stack.push_move(Value::Int(self.0));
            Ok(())
        }
    }

    #[test]
    fn test_jit_delegation() {
        use Opcode::*;
        // The interpreted body would return 1; the installed executor
        // returns 99. With a zero threshold the first call delegates.
        let helper = func(
            "helper",
            &[],
            Type::Int,
            0,
            asm(&[(PushInt, 0), (Return, 0)]),
        );
        let main = func(
            "main",
            &[],
            Type::Void,
            0,
            asm(&[(Call, 1), (Print, 0)]),
        );
        let m = module(&[1], &[], vec![main, helper]);

        let mut jit = CountingJit::new(0);
        jit.install("helper", Rc::new(FixedInt(99)));
        let mut vm = Vm::with_strategy(m, Box::new(jit));
        let mut out = Vec::new();
        assert_eq!(vm.run(&mut out), Ok(()));
        assert_eq!(String::from_utf8(out).unwrap(), "99");
    }

    #[test]
    fn test_jit_warmup_threshold() {
        use Opcode::*;
        // Below the threshold the interpreter runs the body.
        let helper = func(
            "helper",
            &[],
            Type::Int,
            0,
            asm(&[(PushInt, 0), (Return, 0)]),
        );
        let main = func(
            "main",
            &[],
            Type::Void,
            0,
            asm(&[(Call, 1), (Print, 0), (Call, 1), (Print, 0)]),
        );
        let m = module(&[1], &[], vec![main, helper]);

        let mut jit = CountingJit::new(2);
        jit.install("helper", Rc::new(FixedInt(99)));
        let mut vm = Vm::with_strategy(m, Box::new(jit));
        let mut out = Vec::new();
        assert_eq!(vm.run(&mut out), Ok(()));
        // First call is cold (count 1 at entry), second is warm.
        assert_eq!(String::from_utf8(out).unwrap(), "199");
    }
}
