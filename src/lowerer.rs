// Lowering: turns a typed program into a bytecode module. Function CALL
// indices were assigned by the analyzer in source order; this pass emits
// each body as a linear instruction stream over the shared constant pools,
// mapping parameters to the first local slots and patching forward jumps
// once their targets are known.

use std::collections::HashMap;

use thiserror::Error;

use crate::analyzer::{CallTarget, TypedExpr, TypedExprKind, TypedFunction, TypedProgram, TypedStmt};
use crate::ast::{BinOp, UnOp};
use crate::bytecode::{
    encode, encode_displacement, ConstantPool, Function, Module, Opcode, DISPLACEMENT_MAX,
    DISPLACEMENT_MIN, INSTRUCTION_SIZE, OPERAND_MAX,
};
use crate::value::{ElemType, Type};

// All of these indicate lowerer bugs rather than user errors; lowering
// fails loudly without producing a partial module.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LowerError {
    #[error("internal: unresolved forward jump at instruction {site}")]
    UnresolvedJump { site: usize },
    #[error("internal: jump displacement out of range at instruction {site}")]
    DisplacementOverflow { site: usize },
    #[error("internal: unknown local `{name}` reached the lowerer")]
    UnknownLocal { name: String },
    #[error("too many constants in one module")]
    ConstantPoolOverflow,
    #[error("too many local slots in function `{name}`")]
    LocalOverflow { name: String },
}

pub fn lower(program: &TypedProgram) -> Result<Module, LowerError> {
    let mut constants = ConstantPool::new();
    let functions = program
        .functions
        .iter()
        .map(|func| lower_function(func, &mut constants))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Module {
        constants,
        functions,
        entry: "main".to_string(),
    })
}

// ---- instruction builder ----

// Accumulates encoded instructions for one function and tracks the jump
// sites that still need a target.
struct FunctionBuilder {
    code: Vec<u8>,
    pending: Vec<usize>,
    last_op: Option<Opcode>,
}

impl FunctionBuilder {
    fn new() -> FunctionBuilder {
        FunctionBuilder {
            code: Vec::new(),
            pending: Vec::new(),
            last_op: None,
        }
    }

    // The address of the next instruction, in instruction units.
    fn here(&self) -> usize {
        self.code.len() / INSTRUCTION_SIZE
    }

    fn emit(&mut self, op: Opcode, operand: u32) {
        self.last_op = Some(op);
        self.code.extend_from_slice(&encode(op, operand));
    }

    // Emit a jump whose target is not known yet; the returned site must be
    // patched before finish().
    fn emit_jump(&mut self, op: Opcode) -> usize {
        let site = self.here();
        self.pending.push(site);
        self.emit(op, 0);
        site
    }

    // Emit a jump to an already-known (typically backward) target.
    fn emit_jump_to(&mut self, op: Opcode, target: usize) -> Result<(), LowerError> {
        let site = self.here();
        self.emit(op, 0);
        self.patch(site, target)
    }

    fn patch_to_here(&mut self, site: usize) -> Result<(), LowerError> {
        self.patch(site, self.here())
    }

    fn patch(&mut self, site: usize, target: usize) -> Result<(), LowerError> {
        let displacement = target as i64 - site as i64;
        if displacement < DISPLACEMENT_MIN as i64 || displacement > DISPLACEMENT_MAX as i64 {
            return Err(LowerError::DisplacementOverflow { site });
        }
        let operand = encode_displacement(displacement as i32);
        let offset = site * INSTRUCTION_SIZE;
        self.code[offset + 1] = (operand >> 16) as u8;
        self.code[offset + 2] = (operand >> 8) as u8;
        self.code[offset + 3] = operand as u8;
        self.pending.retain(|&pending| pending != site);
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>, LowerError> {
        if let Some(&site) = self.pending.first() {
            return Err(LowerError::UnresolvedJump { site });
        }
        Ok(self.code)
    }
}

// ---- local slot numbering ----

// Scoped name-to-slot mapping. Slots are handed out once and never reused;
// a block's names go out of scope but their slots stay allocated, so the
// count at the end is the frame size.
struct SlotMap {
    scopes: Vec<HashMap<String, u32>>,
    next: u32,
    function: String,
}

impl SlotMap {
    fn new(function: &str) -> SlotMap {
        SlotMap {
            scopes: vec![HashMap::new()],
            next: 0,
            function: function.to_string(),
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str) -> Result<u32, LowerError> {
        if self.next > OPERAND_MAX {
            return Err(LowerError::LocalOverflow {
                name: self.function.clone(),
            });
        }
        let slot = self.next;
        self.next += 1;
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), slot);
        }
        Ok(slot)
    }

    fn lookup(&self, name: &str) -> Result<u32, LowerError> {
        for scope in self.scopes.iter().rev() {
            if let Some(&slot) = scope.get(name) {
                return Ok(slot);
            }
        }
        Err(LowerError::UnknownLocal {
            name: name.to_string(),
        })
    }

    fn count(&self) -> usize {
        self.next as usize
    }
}

// ---- lowering ----

struct Lowerer<'a> {
    builder: FunctionBuilder,
    slots: SlotMap,
    constants: &'a mut ConstantPool,
}

fn lower_function(
    func: &TypedFunction,
    constants: &mut ConstantPool,
) -> Result<Function, LowerError> {
    let mut lowerer = Lowerer {
        builder: FunctionBuilder::new(),
        slots: SlotMap::new(&func.name),
        constants,
    };

    // Parameters take slots 0..arity in declaration order.
    for (name, _) in &func.params {
        lowerer.slots.declare(name)?;
    }

    for stmt in &func.body {
        lowerer.stmt(stmt)?;
    }

    // A void function that does not end in an explicit return gets one.
    if func.ret == Type::Void
        && !matches!(
            lowerer.builder.last_op,
            Some(Opcode::Return | Opcode::ReturnVoid)
        )
    {
        lowerer.builder.emit(Opcode::ReturnVoid, 0);
    }

    let locals = lowerer.slots.count();
    let code = lowerer.builder.finish()?;
    Ok(Function {
        name: func.name.clone(),
        params: func.params.clone(),
        ret: func.ret,
        locals,
        code,
    })
}

impl<'a> Lowerer<'a> {
    fn stmt(&mut self, stmt: &TypedStmt) -> Result<(), LowerError> {
        match stmt {
            TypedStmt::Let { name, init, .. } => {
                self.expr(init)?;
                let slot = self.slots.declare(name)?;
                self.builder.emit(Opcode::StoreLocal, slot);
                Ok(())
            }
            TypedStmt::Expr(expr) => self.expr_stmt(expr),
            TypedStmt::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond)?;
                let skip_then = self.builder.emit_jump(Opcode::JumpIfFalse);
                self.block(then_block)?;
                match else_block {
                    Some(else_block) => {
                        let skip_else = self.builder.emit_jump(Opcode::Jump);
                        self.builder.patch_to_here(skip_then)?;
                        self.block(else_block)?;
                        self.builder.patch_to_here(skip_else)?;
                    }
                    None => self.builder.patch_to_here(skip_then)?,
                }
                Ok(())
            }
            TypedStmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.slots.push_scope();
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let top = self.builder.here();
                let exit = match cond {
                    Some(cond) => {
                        self.expr(cond)?;
                        Some(self.builder.emit_jump(Opcode::JumpIfFalse))
                    }
                    None => None,
                };
                self.block(body)?;
                if let Some(step) = step {
                    self.expr_stmt(step)?;
                }
                self.builder.emit_jump_to(Opcode::Jump, top)?;
                if let Some(exit) = exit {
                    self.builder.patch_to_here(exit)?;
                }
                self.slots.pop_scope();
                Ok(())
            }
            TypedStmt::Return(value) => {
                match value {
                    Some(expr) => {
                        self.expr(expr)?;
                        self.builder.emit(Opcode::Return, 0);
                    }
                    None => self.builder.emit(Opcode::ReturnVoid, 0),
                }
                Ok(())
            }
            TypedStmt::Block(stmts) => self.block(stmts),
        }
    }

    fn block(&mut self, stmts: &[TypedStmt]) -> Result<(), LowerError> {
        self.slots.push_scope();
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        self.slots.pop_scope();
        Ok(())
    }

    // An expression in statement position: the result is popped unless the
    // expression is void-typed and left nothing behind.
    fn expr_stmt(&mut self, expr: &TypedExpr) -> Result<(), LowerError> {
        self.expr(expr)?;
        if expr.ty != Type::Void {
            self.builder.emit(Opcode::Pop, 0);
        }
        Ok(())
    }

    fn expr(&mut self, expr: &TypedExpr) -> Result<(), LowerError> {
        match &expr.kind {
            TypedExprKind::Int(value) => {
                let slot = self.constants.intern_int(*value);
                if slot > OPERAND_MAX {
                    return Err(LowerError::ConstantPoolOverflow);
                }
                self.builder.emit(Opcode::PushInt, slot);
                Ok(())
            }
            TypedExprKind::Float(value) => {
                let slot = self.constants.intern_float(*value);
                if slot > OPERAND_MAX {
                    return Err(LowerError::ConstantPoolOverflow);
                }
                self.builder.emit(Opcode::PushFloat, slot);
                Ok(())
            }
            TypedExprKind::Bool(value) => {
                self.builder.emit(Opcode::PushBool, *value as u32);
                Ok(())
            }
            TypedExprKind::Local(name) => {
                let slot = self.slots.lookup(name)?;
                self.builder.emit(Opcode::LoadLocal, slot);
                Ok(())
            }
            TypedExprKind::Unary(op, operand) => {
                self.expr(operand)?;
                match (op, expr.ty) {
                    (UnOp::Neg, Type::Int) => self.builder.emit(Opcode::NegInt, 0),
                    (UnOp::Neg, Type::Float) => self.builder.emit(Opcode::NegFloat, 0),
                    // Unary plus is a no-op.
                    (UnOp::Plus, _) => {}
                    (UnOp::Not, _) => self.builder.emit(Opcode::Not, 0),
                    (op, ty) => panic!("no opcode for unary {:?} on {}", op, ty),
                }
                Ok(())
            }
            TypedExprKind::Binary(op, left, right) => {
                self.expr(left)?;
                self.expr(right)?;
                // The operand type picks the _INT or _FLOAT variant; the
                // analyzer made both sides agree.
                self.builder.emit(binary_opcode(*op, left.ty), 0);
                Ok(())
            }
            TypedExprKind::AssignLocal(name, value) => {
                self.expr(value)?;
                let slot = self.slots.lookup(name)?;
                self.builder.emit(Opcode::StoreLocal, slot);
                Ok(())
            }
            TypedExprKind::AssignElem {
                array,
                index,
                value,
            } => {
                self.expr(array)?;
                self.expr(index)?;
                self.expr(value)?;
                self.builder.emit(Opcode::ArrayStore, 0);
                Ok(())
            }
            TypedExprKind::Call { target, args } => {
                for arg in args {
                    self.expr(arg)?;
                }
                match target {
                    CallTarget::Print => self.builder.emit(Opcode::Print, 0),
                    CallTarget::PrintArray => self.builder.emit(Opcode::PrintArray, 0),
                    CallTarget::Function { index, .. } => {
                        self.builder.emit(Opcode::Call, *index)
                    }
                }
                Ok(())
            }
            TypedExprKind::Index { array, index } => {
                self.expr(array)?;
                self.expr(index)?;
                self.builder.emit(Opcode::ArrayLoad, 0);
                Ok(())
            }
            TypedExprKind::NewArray { elem, size } => {
                self.expr(size)?;
                let op = match elem {
                    ElemType::Int => Opcode::NewArrayInt,
                    ElemType::Float => Opcode::NewArrayFloat,
                    ElemType::Bool => Opcode::NewArrayBool,
                };
                self.builder.emit(op, 0);
                Ok(())
            }
        }
    }
}

fn binary_opcode(op: BinOp, operands: Type) -> Opcode {
    match (op, operands) {
        (BinOp::Add, Type::Int) => Opcode::AddInt,
        (BinOp::Sub, Type::Int) => Opcode::SubInt,
        (BinOp::Mul, Type::Int) => Opcode::MulInt,
        (BinOp::Div, Type::Int) => Opcode::DivInt,
        (BinOp::Mod, Type::Int) => Opcode::ModInt,
        (BinOp::Eq, Type::Int) => Opcode::EqInt,
        (BinOp::Ne, Type::Int) => Opcode::NeInt,
        (BinOp::Lt, Type::Int) => Opcode::LtInt,
        (BinOp::Le, Type::Int) => Opcode::LeInt,
        (BinOp::Gt, Type::Int) => Opcode::GtInt,
        (BinOp::Ge, Type::Int) => Opcode::GeInt,
        (BinOp::Add, Type::Float) => Opcode::AddFloat,
        (BinOp::Sub, Type::Float) => Opcode::SubFloat,
        (BinOp::Mul, Type::Float) => Opcode::MulFloat,
        (BinOp::Div, Type::Float) => Opcode::DivFloat,
        (BinOp::Eq, Type::Float) => Opcode::EqFloat,
        (BinOp::Ne, Type::Float) => Opcode::NeFloat,
        (BinOp::Lt, Type::Float) => Opcode::LtFloat,
        (BinOp::Le, Type::Float) => Opcode::LeFloat,
        (BinOp::Gt, Type::Float) => Opcode::GtFloat,
        (BinOp::Ge, Type::Float) => Opcode::GeFloat,
        (BinOp::And, Type::Bool) => Opcode::And,
        (BinOp::Or, Type::Bool) => Opcode::Or,
        (op, ty) => panic!("no opcode for binary {:?} on {} operands", op, ty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::bytecode::sign_extend;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn lower_source(text: &str) -> Module {
        let tokens = Lexer::new(text).tokenize().unwrap();
        let program = Parser::new(tokens).parse().unwrap();
        let typed = analyze(&program).unwrap();
        lower(&typed).unwrap()
    }

    // Decode a function body back into (opcode, raw operand) pairs.
    fn ops(function: &Function) -> Vec<(Opcode, u32)> {
        (0..function.instruction_count())
            .map(|pc| {
                let (byte, operand) = function.fetch(pc).unwrap();
                (Opcode::from_byte(byte).unwrap(), operand)
            })
            .collect()
    }

    #[test]
    fn test_instruction_streams_are_aligned() {
        let module = lower_source(
            "func f(n: int): int { return n * 2; } \
             func main(): void { print(f(21)); }",
        );
        for function in &module.functions {
            assert_eq!(function.code.len() % INSTRUCTION_SIZE, 0);
        }
    }

    #[test]
    fn test_simple_emission() {
        let module = lower_source("func main(): void { let x: int = 2; print(x); }");
        let main = &module.functions[0];
        assert_eq!(main.locals, 1);
        assert_eq!(
            ops(main),
            vec![
                (Opcode::PushInt, 0),
                (Opcode::StoreLocal, 0),
                (Opcode::LoadLocal, 0),
                (Opcode::Print, 0),
                (Opcode::ReturnVoid, 0),
            ]
        );
        assert_eq!(module.constants.int(0), Some(2));
    }

    #[test]
    fn test_if_else_patching() {
        let module = lower_source(
            "func main(): void { \
               let x: int = 2; \
               if (x < 1) { print(1); } else { print(2); } \
             }",
        );
        let main = &module.functions[0];
        // Interning: 2 -> slot 0 (reused by print(2)), 1 -> slot 1.
        assert_eq!(
            ops(main),
            vec![
                (Opcode::PushInt, 0),      // 0: 2
                (Opcode::StoreLocal, 0),   // 1
                (Opcode::LoadLocal, 0),    // 2
                (Opcode::PushInt, 1),      // 3: 1
                (Opcode::LtInt, 0),        // 4
                (Opcode::JumpIfFalse, 4),  // 5: -> 9 (else)
                (Opcode::PushInt, 1),      // 6: 1
                (Opcode::Print, 0),        // 7
                (Opcode::Jump, 3),         // 8: -> 11 (end)
                (Opcode::PushInt, 0),      // 9: 2, deduplicated
                (Opcode::Print, 0),        // 10
                (Opcode::ReturnVoid, 0),   // 11
            ]
        );
    }

    #[test]
    fn test_for_loop_shape() {
        let module = lower_source(
            "func main(): void { \
               let s: int = 0; \
               for (let i: int = 0; i < 10; i = i + 1) { s = s + i; } \
               print(s); \
             }",
        );
        let main = &module.functions[0];
        // Pool: 0 -> 0, 10 -> 1, 1 -> 2. Slots: s=0, i=1.
        let listing = ops(main);
        assert_eq!(
            listing,
            vec![
                (Opcode::PushInt, 0),       // 0
                (Opcode::StoreLocal, 0),    // 1: s
                (Opcode::PushInt, 0),       // 2: 0, deduplicated
                (Opcode::StoreLocal, 1),    // 3: i
                (Opcode::LoadLocal, 1),     // 4: loop top
                (Opcode::PushInt, 1),       // 5: 10
                (Opcode::LtInt, 0),         // 6
                (Opcode::JumpIfFalse, 10),  // 7: -> 17 (exit)
                (Opcode::LoadLocal, 0),     // 8
                (Opcode::LoadLocal, 1),     // 9
                (Opcode::AddInt, 0),        // 10
                (Opcode::StoreLocal, 0),    // 11: s = s + i, void, no POP
                (Opcode::LoadLocal, 1),     // 12
                (Opcode::PushInt, 2),       // 13: 1
                (Opcode::AddInt, 0),        // 14
                (Opcode::StoreLocal, 1),    // 15: i = i + 1
                (Opcode::Jump, encode_displacement(-12)), // 16: -> 4
                (Opcode::LoadLocal, 0),     // 17
                (Opcode::Print, 0),         // 18
                (Opcode::ReturnVoid, 0),    // 19
            ]
        );
        // The back edge really is negative.
        assert_eq!(sign_extend(listing[16].1), -12);
    }

    #[test]
    fn test_factorial_emission() {
        let module = lower_source(
            "func factorial(n: int): int { \
               if (n <= 1) { return 1; } else { return n * factorial(n - 1); } \
             } \
             func main(): void { let r: int = factorial(5); print(r); }",
        );
        assert_eq!(module.entry_index(), Some(1));

        let factorial = &module.functions[0];
        assert_eq!(factorial.locals, 1);
        // Pool: 1 -> 0, 5 -> 1. The else-skip jump targets one-past-end,
        // which is a valid address; both branches return first anyway.
        assert_eq!(
            ops(factorial),
            vec![
                (Opcode::LoadLocal, 0),    // 0
                (Opcode::PushInt, 0),      // 1: 1
                (Opcode::LeInt, 0),        // 2
                (Opcode::JumpIfFalse, 4),  // 3: -> 7 (else)
                (Opcode::PushInt, 0),      // 4: 1
                (Opcode::Return, 0),       // 5
                (Opcode::Jump, 8),         // 6: -> 14 (end)
                (Opcode::LoadLocal, 0),    // 7
                (Opcode::LoadLocal, 0),    // 8
                (Opcode::PushInt, 0),      // 9: 1
                (Opcode::SubInt, 0),       // 10
                (Opcode::Call, 0),         // 11: factorial
                (Opcode::MulInt, 0),       // 12
                (Opcode::Return, 0),       // 13
            ]
        );
    }

    #[test]
    fn test_expression_statement_pop_rules() {
        let module = lower_source(
            "func value(): int { return 1; } \
             func main(): void { value(); print(2); 3 + 4; }",
        );
        let main = &module.functions[1];
        assert_eq!(
            ops(main),
            vec![
                (Opcode::Call, 0),       // value()
                (Opcode::Pop, 0),        // discarded result
                (Opcode::PushInt, 1),    // 2
                (Opcode::Print, 0),      // void builtin, nothing to pop
                (Opcode::PushInt, 2),    // 3
                (Opcode::PushInt, 3),    // 4
                (Opcode::AddInt, 0),
                (Opcode::Pop, 0),
                (Opcode::ReturnVoid, 0),
            ]
        );
    }

    #[test]
    fn test_no_epilogue_after_explicit_return() {
        let module = lower_source("func main(): void { print(1); return; }");
        let main = &module.functions[0];
        let listing = ops(main);
        assert_eq!(listing.last(), Some(&(Opcode::ReturnVoid, 0)));
        // Exactly one return: the explicit one.
        let returns = listing
            .iter()
            .filter(|(op, _)| matches!(op, Opcode::Return | Opcode::ReturnVoid))
            .count();
        assert_eq!(returns, 1);
    }

    #[test]
    fn test_param_slots_come_first() {
        let module = lower_source(
            "func f(a: int, b: float): float { let c: float = b; return c; } \
             func main(): void { print(f(1, 2.0)); }",
        );
        let f = &module.functions[0];
        assert_eq!(f.locals, 3);
        assert_eq!(
            ops(f),
            vec![
                (Opcode::LoadLocal, 1),  // b
                (Opcode::StoreLocal, 2), // c
                (Opcode::LoadLocal, 2),
                (Opcode::Return, 0),
            ]
        );
    }

    #[test]
    fn test_array_expression_lowering() {
        let module = lower_source(
            "func main(): void { \
               let a: int[] = int[3]; \
               a[0] = 10; \
               print(a[0]); \
               printArray(a); \
             }",
        );
        let main = &module.functions[0];
        // Pool: 3 -> 0, 0 -> 1, 10 -> 2.
        assert_eq!(
            ops(main),
            vec![
                (Opcode::PushInt, 0),     // 3
                (Opcode::NewArrayInt, 0),
                (Opcode::StoreLocal, 0),
                (Opcode::LoadLocal, 0),
                (Opcode::PushInt, 1),     // 0
                (Opcode::PushInt, 2),     // 10
                (Opcode::ArrayStore, 0),
                (Opcode::LoadLocal, 0),
                (Opcode::PushInt, 1),     // 0
                (Opcode::ArrayLoad, 0),
                (Opcode::Print, 0),
                (Opcode::LoadLocal, 0),
                (Opcode::PrintArray, 0),
                (Opcode::ReturnVoid, 0),
            ]
        );
    }

    #[test]
    fn test_bool_and_float_literals() {
        let module = lower_source(
            "func main(): void { \
               let b: bool = true; \
               let f: float = 1.5; \
               let g: float = 1.5; \
               print(b && false); \
             }",
        );
        let main = &module.functions[0];
        assert_eq!(
            ops(main),
            vec![
                (Opcode::PushBool, 1),
                (Opcode::StoreLocal, 0),
                (Opcode::PushFloat, 0),
                (Opcode::StoreLocal, 1),
                (Opcode::PushFloat, 0), // 1.5 interned once
                (Opcode::StoreLocal, 2),
                (Opcode::LoadLocal, 0),
                (Opcode::PushBool, 0),
                (Opcode::And, 0),
                (Opcode::Print, 0),
                (Opcode::ReturnVoid, 0),
            ]
        );
        assert_eq!(module.constants.floats(), &[1.5]);
    }

    #[test]
    fn test_block_scoping_allocates_fresh_slots() {
        let module = lower_source(
            "func main(): void { \
               let x: int = 1; \
               { let y: int = 2; print(y); } \
               { let z: int = 3; print(z); } \
               print(x); \
             }",
        );
        let main = &module.functions[0];
        // Slots are not reused across sibling blocks.
        assert_eq!(main.locals, 3);
    }

    #[test]
    fn test_unary_lowering() {
        let module = lower_source(
            "func main(): void { \
               let x: int = 5; \
               print(-x); \
               let f: float = 1.5; \
               print(-f); \
               print(+x); \
               print(!(x < 6)); \
             }",
        );
        let main = &module.functions[0];
        let listing = ops(main);
        assert!(listing.contains(&(Opcode::NegInt, 0)));
        assert!(listing.contains(&(Opcode::NegFloat, 0)));
        assert!(listing.contains(&(Opcode::Not, 0)));
    }
}
