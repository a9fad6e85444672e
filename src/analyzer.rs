// Semantic analysis: resolves names, checks types, and rewrites the parsed
// AST into a typed program the lowerer consumes directly. Every expression
// node in the output carries its static type, which is what selects the
// _INT or _FLOAT opcode variants downstream.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{
    AssignTarget, BinOp, Expr, ExprKind, FuncDecl, Pos, Program, Stmt, StmtKind, TypeExpr, UnOp,
};
use crate::value::{ElemType, Type};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SemanticError {
    #[error("{pos}: unknown variable `{name}`")]
    UnknownVariable { name: String, pos: Pos },
    #[error("{pos}: unknown function `{name}`")]
    UnknownFunction { name: String, pos: Pos },
    #[error("{pos}: variable `{name}` is already declared in this scope")]
    DuplicateVariable { name: String, pos: Pos },
    #[error("duplicate function `{name}`")]
    DuplicateFunction { name: String },
    #[error("`{name}` is a built-in function and cannot be redefined")]
    ReservedFunction { name: String },
    #[error("{pos}: expected {expected}, found {found}")]
    TypeMismatch {
        expected: Type,
        found: Type,
        pos: Pos,
    },
    #[error("{pos}: operator `{op}` cannot be applied to {ty}")]
    InvalidOperand { op: String, ty: Type, pos: Pos },
    #[error("{pos}: condition must be bool, found {found}")]
    ConditionNotBool { found: Type, pos: Pos },
    #[error("{pos}: `{name}` takes {expected} argument(s), {found} given")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
        pos: Pos,
    },
    #[error("{pos}: not an array: {found}")]
    NotAnArray { found: Type, pos: Pos },
    #[error("{pos}: nested array types are not supported")]
    NestedArray { pos: Pos },
    #[error("{pos}: `void` is not a value type here")]
    VoidValue { pos: Pos },
    #[error("function `{name}` does not return a value on every path")]
    MissingReturn { name: String },
    #[error("program has no `main` function")]
    MissingMain,
    #[error("`main` must take no parameters and return void")]
    MainSignature,
}

// ---- typed program ----

#[derive(Debug, Clone, PartialEq)]
pub struct TypedProgram {
    pub functions: Vec<TypedFunction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedFunction {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub ret: Type,
    pub body: Vec<TypedStmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedStmt {
    Let {
        name: String,
        ty: Type,
        init: TypedExpr,
    },
    Expr(TypedExpr),
    If {
        cond: TypedExpr,
        then_block: Vec<TypedStmt>,
        else_block: Option<Vec<TypedStmt>>,
    },
    For {
        init: Option<Box<TypedStmt>>,
        cond: Option<TypedExpr>,
        step: Option<TypedExpr>,
        body: Vec<TypedStmt>,
    },
    Return(Option<TypedExpr>),
    Block(Vec<TypedStmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    Function { index: u32, name: String },
    Print,
    PrintArray,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedExprKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Local(String),
    Unary(UnOp, Box<TypedExpr>),
    Binary(BinOp, Box<TypedExpr>, Box<TypedExpr>),
    AssignLocal(String, Box<TypedExpr>),
    AssignElem {
        array: Box<TypedExpr>,
        index: Box<TypedExpr>,
        value: Box<TypedExpr>,
    },
    Call {
        target: CallTarget,
        args: Vec<TypedExpr>,
    },
    Index {
        array: Box<TypedExpr>,
        index: Box<TypedExpr>,
    },
    NewArray {
        elem: ElemType,
        size: Box<TypedExpr>,
    },
}

// ---- scopes ----

// Lexical scope chain for variable types: a stack of maps, innermost last.
struct Scopes {
    stack: Vec<HashMap<String, Type>>,
}

impl Scopes {
    fn new() -> Scopes {
        Scopes { stack: vec![] }
    }

    fn push(&mut self) {
        self.stack.push(HashMap::new());
    }

    fn pop(&mut self) {
        self.stack.pop();
    }

    // Declare in the innermost scope; false if the name is already there.
    fn declare(&mut self, name: &str, ty: Type) -> bool {
        match self.stack.last_mut() {
            Some(scope) => scope.insert(name.to_string(), ty).is_none(),
            None => false,
        }
    }

    fn lookup(&self, name: &str) -> Option<Type> {
        for scope in self.stack.iter().rev() {
            if let Some(ty) = scope.get(name) {
                return Some(*ty);
            }
        }
        None
    }
}

// ---- the analyzer ----

struct FuncSig {
    index: u32,
    params: Vec<Type>,
    ret: Type,
}

pub struct Analyzer {
    functions: HashMap<String, FuncSig>,
}

pub fn analyze(program: &Program) -> Result<TypedProgram, SemanticError> {
    Analyzer::new(program)?.run(program)
}

impl Analyzer {
    fn new(program: &Program) -> Result<Analyzer, SemanticError> {
        // Collect signatures first so calls can be resolved in any order.
        // A function's index in source order is its CALL operand.
        let mut functions = HashMap::new();
        for (index, decl) in program.functions.iter().enumerate() {
            if decl.name == "print" || decl.name == "printArray" {
                return Err(SemanticError::ReservedFunction {
                    name: decl.name.clone(),
                });
            }
            let params = decl
                .params
                .iter()
                .map(|p| resolve_type(&p.ty, p.pos))
                .collect::<Result<Vec<_>, _>>()?;
            let ret = resolve_type(&decl.ret, decl.pos)?;
            let sig = FuncSig {
                index: index as u32,
                params,
                ret,
            };
            if functions.insert(decl.name.clone(), sig).is_some() {
                return Err(SemanticError::DuplicateFunction {
                    name: decl.name.clone(),
                });
            }
        }

        match functions.get("main") {
            None => return Err(SemanticError::MissingMain),
            Some(sig) if !sig.params.is_empty() || sig.ret != Type::Void => {
                return Err(SemanticError::MainSignature)
            }
            Some(_) => {}
        }

        Ok(Analyzer { functions })
    }

    fn run(&self, program: &Program) -> Result<TypedProgram, SemanticError> {
        let functions = program
            .functions
            .iter()
            .map(|decl| self.check_function(decl))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TypedProgram { functions })
    }

    fn check_function(&self, decl: &FuncDecl) -> Result<TypedFunction, SemanticError> {
        let ret = resolve_type(&decl.ret, decl.pos)?;

        let mut scopes = Scopes::new();
        scopes.push();
        let mut params = Vec::new();
        for param in &decl.params {
            let ty = resolve_type(&param.ty, param.pos)?;
            if ty == Type::Void {
                return Err(SemanticError::VoidValue { pos: param.pos });
            }
            if !scopes.declare(&param.name, ty) {
                return Err(SemanticError::DuplicateVariable {
                    name: param.name.clone(),
                    pos: param.pos,
                });
            }
            params.push((param.name.clone(), ty));
        }

        let body = self.check_block(&decl.body, &mut scopes, ret)?;
        scopes.pop();

        if ret != Type::Void && !block_always_returns(&body) {
            return Err(SemanticError::MissingReturn {
                name: decl.name.clone(),
            });
        }

        Ok(TypedFunction {
            name: decl.name.clone(),
            params,
            ret,
            body,
        })
    }

    fn check_block(
        &self,
        stmts: &[Stmt],
        scopes: &mut Scopes,
        ret: Type,
    ) -> Result<Vec<TypedStmt>, SemanticError> {
        stmts
            .iter()
            .map(|stmt| self.check_stmt(stmt, scopes, ret))
            .collect()
    }

    fn check_stmt(
        &self,
        stmt: &Stmt,
        scopes: &mut Scopes,
        ret: Type,
    ) -> Result<TypedStmt, SemanticError> {
        match &stmt.kind {
            StmtKind::Let { name, ty, init } => {
                let declared = resolve_type(ty, stmt.pos)?;
                if declared == Type::Void {
                    return Err(SemanticError::VoidValue { pos: stmt.pos });
                }
                let init = self.check_expr(init, scopes)?;
                if init.ty != declared {
                    return Err(SemanticError::TypeMismatch {
                        expected: declared,
                        found: init.ty,
                        pos: stmt.pos,
                    });
                }
                if !scopes.declare(name, declared) {
                    return Err(SemanticError::DuplicateVariable {
                        name: name.clone(),
                        pos: stmt.pos,
                    });
                }
                Ok(TypedStmt::Let {
                    name: name.clone(),
                    ty: declared,
                    init,
                })
            }
            StmtKind::Expr(expr) => Ok(TypedStmt::Expr(self.check_expr(expr, scopes)?)),
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let cond_pos = cond.pos;
                let cond = self.check_expr(cond, scopes)?;
                if cond.ty != Type::Bool {
                    return Err(SemanticError::ConditionNotBool {
                        found: cond.ty,
                        pos: cond_pos,
                    });
                }
                scopes.push();
                let then_block = self.check_block(then_block, scopes, ret)?;
                scopes.pop();
                let else_block = match else_block {
                    Some(stmts) => {
                        scopes.push();
                        let checked = self.check_block(stmts, scopes, ret)?;
                        scopes.pop();
                        Some(checked)
                    }
                    None => None,
                };
                Ok(TypedStmt::If {
                    cond,
                    then_block,
                    else_block,
                })
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                // The initializer's declaration is scoped to the loop.
                scopes.push();
                let init = match init {
                    Some(stmt) => Some(Box::new(self.check_stmt(stmt, scopes, ret)?)),
                    None => None,
                };
                let cond = match cond {
                    Some(expr) => {
                        let pos = expr.pos;
                        let checked = self.check_expr(expr, scopes)?;
                        if checked.ty != Type::Bool {
                            return Err(SemanticError::ConditionNotBool {
                                found: checked.ty,
                                pos,
                            });
                        }
                        Some(checked)
                    }
                    None => None,
                };
                let body = {
                    scopes.push();
                    let checked = self.check_block(body, scopes, ret)?;
                    scopes.pop();
                    checked
                };
                let step = match step {
                    Some(expr) => Some(self.check_expr(expr, scopes)?),
                    None => None,
                };
                scopes.pop();
                Ok(TypedStmt::For {
                    init,
                    cond,
                    step,
                    body,
                })
            }
            StmtKind::Return(value) => match (value, ret) {
                (None, Type::Void) => Ok(TypedStmt::Return(None)),
                (None, expected) => Err(SemanticError::TypeMismatch {
                    expected,
                    found: Type::Void,
                    pos: stmt.pos,
                }),
                (Some(expr), expected) => {
                    let checked = self.check_expr(expr, scopes)?;
                    if checked.ty != expected {
                        return Err(SemanticError::TypeMismatch {
                            expected,
                            found: checked.ty,
                            pos: stmt.pos,
                        });
                    }
                    Ok(TypedStmt::Return(Some(checked)))
                }
            },
            StmtKind::Block(stmts) => {
                scopes.push();
                let checked = self.check_block(stmts, scopes, ret)?;
                scopes.pop();
                Ok(TypedStmt::Block(checked))
            }
        }
    }

    // A value-producing operand: void is rejected here, which is also what
    // keeps assignments (typed void) out of larger expressions.
    fn check_operand(&self, expr: &Expr, scopes: &mut Scopes) -> Result<TypedExpr, SemanticError> {
        let checked = self.check_expr(expr, scopes)?;
        if checked.ty == Type::Void {
            return Err(SemanticError::VoidValue { pos: expr.pos });
        }
        Ok(checked)
    }

    fn check_expr(&self, expr: &Expr, scopes: &mut Scopes) -> Result<TypedExpr, SemanticError> {
        match &expr.kind {
            ExprKind::Int(v) => Ok(TypedExpr {
                kind: TypedExprKind::Int(*v),
                ty: Type::Int,
            }),
            ExprKind::Float(v) => Ok(TypedExpr {
                kind: TypedExprKind::Float(*v),
                ty: Type::Float,
            }),
            ExprKind::Bool(v) => Ok(TypedExpr {
                kind: TypedExprKind::Bool(*v),
                ty: Type::Bool,
            }),
            ExprKind::Var(name) => {
                let ty = scopes
                    .lookup(name)
                    .ok_or_else(|| SemanticError::UnknownVariable {
                        name: name.clone(),
                        pos: expr.pos,
                    })?;
                Ok(TypedExpr {
                    kind: TypedExprKind::Local(name.clone()),
                    ty,
                })
            }
            ExprKind::Unary(op, operand) => {
                let operand_pos = operand.pos;
                let operand = self.check_operand(operand, scopes)?;
                let ty = match (op, operand.ty) {
                    (UnOp::Neg | UnOp::Plus, Type::Int) => Type::Int,
                    (UnOp::Neg | UnOp::Plus, Type::Float) => Type::Float,
                    (UnOp::Not, Type::Bool) => Type::Bool,
                    (op, ty) => {
                        return Err(SemanticError::InvalidOperand {
                            op: unop_text(*op).to_string(),
                            ty,
                            pos: operand_pos,
                        })
                    }
                };
                Ok(TypedExpr {
                    kind: TypedExprKind::Unary(*op, Box::new(operand)),
                    ty,
                })
            }
            ExprKind::Binary(op, left, right) => {
                let pos = expr.pos;
                let left = self.check_operand(left, scopes)?;
                let right = self.check_operand(right, scopes)?;
                if left.ty != right.ty {
                    return Err(SemanticError::TypeMismatch {
                        expected: left.ty,
                        found: right.ty,
                        pos,
                    });
                }
                let ty = binary_result(*op, left.ty).ok_or_else(|| {
                    SemanticError::InvalidOperand {
                        op: binop_text(*op).to_string(),
                        ty: left.ty,
                        pos,
                    }
                })?;
                Ok(TypedExpr {
                    kind: TypedExprKind::Binary(*op, Box::new(left), Box::new(right)),
                    ty,
                })
            }
            ExprKind::Assign { target, value } => match target {
                AssignTarget::Var(name) => {
                    let declared =
                        scopes
                            .lookup(name)
                            .ok_or_else(|| SemanticError::UnknownVariable {
                                name: name.clone(),
                                pos: expr.pos,
                            })?;
                    let value = self.check_operand(value, scopes)?;
                    if value.ty != declared {
                        return Err(SemanticError::TypeMismatch {
                            expected: declared,
                            found: value.ty,
                            pos: expr.pos,
                        });
                    }
                    Ok(TypedExpr {
                        kind: TypedExprKind::AssignLocal(name.clone(), Box::new(value)),
                        ty: Type::Void,
                    })
                }
                AssignTarget::Elem { array, index } => {
                    let array_pos = array.pos;
                    let array = self.check_operand(array, scopes)?;
                    let elem = match array.ty {
                        Type::Array(elem) => elem,
                        found => {
                            return Err(SemanticError::NotAnArray {
                                found,
                                pos: array_pos,
                            })
                        }
                    };
                    let index = self.check_index(index, scopes)?;
                    let value = self.check_operand(value, scopes)?;
                    if value.ty != Type::scalar(elem) {
                        return Err(SemanticError::TypeMismatch {
                            expected: Type::scalar(elem),
                            found: value.ty,
                            pos: expr.pos,
                        });
                    }
                    Ok(TypedExpr {
                        kind: TypedExprKind::AssignElem {
                            array: Box::new(array),
                            index: Box::new(index),
                            value: Box::new(value),
                        },
                        ty: Type::Void,
                    })
                }
            },
            ExprKind::Call { name, args } => self.check_call(name, args, expr.pos, scopes),
            ExprKind::Index { array, index } => {
                let array_pos = array.pos;
                let array = self.check_operand(array, scopes)?;
                let elem = match array.ty {
                    Type::Array(elem) => elem,
                    found => {
                        return Err(SemanticError::NotAnArray {
                            found,
                            pos: array_pos,
                        })
                    }
                };
                let index = self.check_index(index, scopes)?;
                Ok(TypedExpr {
                    kind: TypedExprKind::Index {
                        array: Box::new(array),
                        index: Box::new(index),
                    },
                    ty: Type::scalar(elem),
                })
            }
            ExprKind::NewArray { elem, size } => {
                let elem = match resolve_type(elem, expr.pos)? {
                    Type::Int => ElemType::Int,
                    Type::Float => ElemType::Float,
                    Type::Bool => ElemType::Bool,
                    _ => return Err(SemanticError::VoidValue { pos: expr.pos }),
                };
                let size = self.check_index(size, scopes)?;
                Ok(TypedExpr {
                    kind: TypedExprKind::NewArray {
                        elem,
                        size: Box::new(size),
                    },
                    ty: Type::Array(elem),
                })
            }
        }
    }

    // Array indices and sizes are int expressions.
    fn check_index(&self, expr: &Expr, scopes: &mut Scopes) -> Result<TypedExpr, SemanticError> {
        let pos = expr.pos;
        let checked = self.check_operand(expr, scopes)?;
        if checked.ty != Type::Int {
            return Err(SemanticError::TypeMismatch {
                expected: Type::Int,
                found: checked.ty,
                pos,
            });
        }
        Ok(checked)
    }

    fn check_call(
        &self,
        name: &str,
        args: &[Expr],
        pos: Pos,
        scopes: &mut Scopes,
    ) -> Result<TypedExpr, SemanticError> {
        // Built-ins first; user functions cannot shadow them.
        if name == "print" {
            if args.len() != 1 {
                return Err(SemanticError::ArityMismatch {
                    name: name.to_string(),
                    expected: 1,
                    found: args.len(),
                    pos,
                });
            }
            let arg_pos = args[0].pos;
            let arg = self.check_operand(&args[0], scopes)?;
            if !arg.ty.is_scalar() {
                return Err(SemanticError::TypeMismatch {
                    expected: Type::Int,
                    found: arg.ty,
                    pos: arg_pos,
                });
            }
            return Ok(TypedExpr {
                kind: TypedExprKind::Call {
                    target: CallTarget::Print,
                    args: vec![arg],
                },
                ty: Type::Void,
            });
        }
        if name == "printArray" {
            if args.len() != 1 {
                return Err(SemanticError::ArityMismatch {
                    name: name.to_string(),
                    expected: 1,
                    found: args.len(),
                    pos,
                });
            }
            let arg_pos = args[0].pos;
            let arg = self.check_operand(&args[0], scopes)?;
            if !matches!(arg.ty, Type::Array(_)) {
                return Err(SemanticError::NotAnArray {
                    found: arg.ty,
                    pos: arg_pos,
                });
            }
            return Ok(TypedExpr {
                kind: TypedExprKind::Call {
                    target: CallTarget::PrintArray,
                    args: vec![arg],
                },
                ty: Type::Void,
            });
        }

        let sig = self
            .functions
            .get(name)
            .ok_or_else(|| SemanticError::UnknownFunction {
                name: name.to_string(),
                pos,
            })?;
        if args.len() != sig.params.len() {
            return Err(SemanticError::ArityMismatch {
                name: name.to_string(),
                expected: sig.params.len(),
                found: args.len(),
                pos,
            });
        }
        let mut checked_args = Vec::new();
        for (arg, &param_ty) in args.iter().zip(sig.params.iter()) {
            let arg_pos = arg.pos;
            let checked = self.check_operand(arg, scopes)?;
            if checked.ty != param_ty {
                return Err(SemanticError::TypeMismatch {
                    expected: param_ty,
                    found: checked.ty,
                    pos: arg_pos,
                });
            }
            checked_args.push(checked);
        }
        Ok(TypedExpr {
            kind: TypedExprKind::Call {
                target: CallTarget::Function {
                    index: sig.index,
                    name: name.to_string(),
                },
                args: checked_args,
            },
            ty: sig.ret,
        })
    }
}

fn resolve_type(ty: &TypeExpr, pos: Pos) -> Result<Type, SemanticError> {
    match ty {
        TypeExpr::Int => Ok(Type::Int),
        TypeExpr::Float => Ok(Type::Float),
        TypeExpr::Bool => Ok(Type::Bool),
        TypeExpr::Void => Ok(Type::Void),
        TypeExpr::Array(inner) => match inner.as_ref() {
            TypeExpr::Int => Ok(Type::Array(ElemType::Int)),
            TypeExpr::Float => Ok(Type::Array(ElemType::Float)),
            TypeExpr::Bool => Ok(Type::Array(ElemType::Bool)),
            TypeExpr::Void => Err(SemanticError::VoidValue { pos }),
            TypeExpr::Array(_) => Err(SemanticError::NestedArray { pos }),
        },
    }
}

fn binary_result(op: BinOp, operands: Type) -> Option<Type> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => match operands {
            Type::Int => Some(Type::Int),
            Type::Float => Some(Type::Float),
            _ => None,
        },
        // Modulo is integer-only; there is no MOD_FLOAT.
        BinOp::Mod => match operands {
            Type::Int => Some(Type::Int),
            _ => None,
        },
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => match operands {
            Type::Int | Type::Float => Some(Type::Bool),
            _ => None,
        },
        BinOp::And | BinOp::Or => match operands {
            Type::Bool => Some(Type::Bool),
            _ => None,
        },
    }
}

fn binop_text(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::And => "&&",
        BinOp::Or => "||",
    }
}

fn unop_text(op: UnOp) -> &'static str {
    match op {
        UnOp::Neg => "-",
        UnOp::Plus => "+",
        UnOp::Not => "!",
    }
}

// Conservative "every path returns" check used for non-void functions.
fn block_always_returns(stmts: &[TypedStmt]) -> bool {
    stmts.iter().any(stmt_always_returns)
}

fn stmt_always_returns(stmt: &TypedStmt) -> bool {
    match stmt {
        TypedStmt::Return(_) => true,
        TypedStmt::Block(stmts) => block_always_returns(stmts),
        TypedStmt::If {
            then_block,
            else_block: Some(else_block),
            ..
        } => block_always_returns(then_block) && block_always_returns(else_block),
        _ => false,
    }
}
