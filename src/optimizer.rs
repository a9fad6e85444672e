// AST-level optimizations: constant folding and dead-code elimination.
// Both are behavior-preserving rewrites. Folding uses the same wrapping
// integer semantics the VM has, and a division or modulo by a literal zero
// is left alone so the runtime error still happens.

use crate::ast::{
    AssignTarget, BinOp, Expr, ExprKind, FuncDecl, Program, Stmt, StmtKind, UnOp,
};

pub fn optimize(program: Program) -> Program {
    let functions = program
        .functions
        .into_iter()
        .map(|decl| {
            let FuncDecl {
                name,
                params,
                ret,
                body,
                pos,
            } = decl;
            FuncDecl {
                name,
                params,
                ret,
                body: fold_block(body),
                pos,
            }
        })
        .collect();
    Program { functions }
}

fn fold_block(stmts: Vec<Stmt>) -> Vec<Stmt> {
    let mut out = Vec::new();
    for stmt in stmts {
        let Some(stmt) = fold_stmt(stmt) else { continue };
        let is_return = matches!(stmt.kind, StmtKind::Return(_));
        out.push(stmt);
        // Anything after a return in the same block is unreachable.
        if is_return {
            break;
        }
    }
    out
}

// None means the statement folded away entirely.
fn fold_stmt(stmt: Stmt) -> Option<Stmt> {
    let pos = stmt.pos;
    let kind = match stmt.kind {
        StmtKind::Let { name, ty, init } => StmtKind::Let {
            name,
            ty,
            init: fold_expr(init),
        },
        StmtKind::Expr(expr) => StmtKind::Expr(fold_expr(expr)),
        StmtKind::If {
            cond,
            then_block,
            else_block,
        } => {
            let cond = fold_expr(cond);
            let then_block = fold_block(then_block);
            let else_block = else_block.map(fold_block);
            // A literal condition decides the branch now.
            match cond.kind {
                ExprKind::Bool(true) => StmtKind::Block(then_block),
                ExprKind::Bool(false) => match else_block {
                    Some(stmts) => StmtKind::Block(stmts),
                    None => return None,
                },
                _ => StmtKind::If {
                    cond,
                    then_block,
                    else_block,
                },
            }
        }
        StmtKind::For {
            init,
            cond,
            step,
            body,
        } => {
            let init = match init {
                Some(stmt) => Some(Box::new(fold_stmt(*stmt)?)),
                None => None,
            };
            let cond = cond.map(fold_expr);
            let step = step.map(fold_expr);
            let body = fold_block(body);
            match cond {
                // Never entered: only the initializer's effect remains,
                // still in its own scope.
                Some(Expr {
                    kind: ExprKind::Bool(false),
                    ..
                }) => match init {
                    Some(init) => StmtKind::Block(vec![*init]),
                    None => return None,
                },
                // Always entered: same as the condition-less form.
                Some(Expr {
                    kind: ExprKind::Bool(true),
                    ..
                }) => StmtKind::For {
                    init,
                    cond: None,
                    step,
                    body,
                },
                cond => StmtKind::For {
                    init,
                    cond,
                    step,
                    body,
                },
            }
        }
        StmtKind::Return(value) => StmtKind::Return(value.map(fold_expr)),
        StmtKind::Block(stmts) => StmtKind::Block(fold_block(stmts)),
    };
    Some(Stmt { kind, pos })
}

fn fold_expr(expr: Expr) -> Expr {
    let pos = expr.pos;
    let kind = match expr.kind {
        ExprKind::Unary(op, operand) => {
            let operand = fold_expr(*operand);
            match (op, &operand.kind) {
                (UnOp::Neg, ExprKind::Int(v)) => ExprKind::Int(v.wrapping_neg()),
                (UnOp::Neg, ExprKind::Float(v)) => ExprKind::Float(-v),
                (UnOp::Plus, ExprKind::Int(v)) => ExprKind::Int(*v),
                (UnOp::Plus, ExprKind::Float(v)) => ExprKind::Float(*v),
                (UnOp::Not, ExprKind::Bool(v)) => ExprKind::Bool(!v),
                _ => ExprKind::Unary(op, Box::new(operand)),
            }
        }
        ExprKind::Binary(op, left, right) => {
            let left = fold_expr(*left);
            let right = fold_expr(*right);
            match (&left.kind, &right.kind) {
                (ExprKind::Int(a), ExprKind::Int(b)) => {
                    fold_int(op, *a, *b).unwrap_or(ExprKind::Binary(
                        op,
                        Box::new(left),
                        Box::new(right),
                    ))
                }
                (ExprKind::Float(a), ExprKind::Float(b)) => {
                    fold_float(op, *a, *b).unwrap_or(ExprKind::Binary(
                        op,
                        Box::new(left),
                        Box::new(right),
                    ))
                }
                (ExprKind::Bool(a), ExprKind::Bool(b)) => {
                    fold_bool(op, *a, *b).unwrap_or(ExprKind::Binary(
                        op,
                        Box::new(left),
                        Box::new(right),
                    ))
                }
                _ => ExprKind::Binary(op, Box::new(left), Box::new(right)),
            }
        }
        ExprKind::Assign { target, value } => {
            let target = match target {
                AssignTarget::Var(name) => AssignTarget::Var(name),
                AssignTarget::Elem { array, index } => AssignTarget::Elem {
                    array: Box::new(fold_expr(*array)),
                    index: Box::new(fold_expr(*index)),
                },
            };
            ExprKind::Assign {
                target,
                value: Box::new(fold_expr(*value)),
            }
        }
        ExprKind::Call { name, args } => ExprKind::Call {
            name,
            args: args.into_iter().map(fold_expr).collect(),
        },
        ExprKind::Index { array, index } => ExprKind::Index {
            array: Box::new(fold_expr(*array)),
            index: Box::new(fold_expr(*index)),
        },
        ExprKind::NewArray { elem, size } => ExprKind::NewArray {
            elem,
            size: Box::new(fold_expr(*size)),
        },
        literal => literal,
    };
    Expr { kind, pos }
}

// Integer folding wraps exactly like the VM. Division and modulo by zero
// are not folded; they stay as runtime errors.
fn fold_int(op: BinOp, a: i64, b: i64) -> Option<ExprKind> {
    let kind = match op {
        BinOp::Add => ExprKind::Int(a.wrapping_add(b)),
        BinOp::Sub => ExprKind::Int(a.wrapping_sub(b)),
        BinOp::Mul => ExprKind::Int(a.wrapping_mul(b)),
        BinOp::Div if b != 0 => ExprKind::Int(a.wrapping_div(b)),
        BinOp::Mod if b != 0 => ExprKind::Int(a.wrapping_rem(b)),
        BinOp::Eq => ExprKind::Bool(a == b),
        BinOp::Ne => ExprKind::Bool(a != b),
        BinOp::Lt => ExprKind::Bool(a < b),
        BinOp::Le => ExprKind::Bool(a <= b),
        BinOp::Gt => ExprKind::Bool(a > b),
        BinOp::Ge => ExprKind::Bool(a >= b),
        _ => return None,
    };
    Some(kind)
}

fn fold_float(op: BinOp, a: f64, b: f64) -> Option<ExprKind> {
    let kind = match op {
        BinOp::Add => ExprKind::Float(a + b),
        BinOp::Sub => ExprKind::Float(a - b),
        BinOp::Mul => ExprKind::Float(a * b),
        // IEEE division never traps, so folding by zero is fine too.
        BinOp::Div => ExprKind::Float(a / b),
        BinOp::Eq => ExprKind::Bool(a == b),
        BinOp::Ne => ExprKind::Bool(a != b),
        BinOp::Lt => ExprKind::Bool(a < b),
        BinOp::Le => ExprKind::Bool(a <= b),
        BinOp::Gt => ExprKind::Bool(a > b),
        BinOp::Ge => ExprKind::Bool(a >= b),
        _ => return None,
    };
    Some(kind)
}

fn fold_bool(op: BinOp, a: bool, b: bool) -> Option<ExprKind> {
    let kind = match op {
        BinOp::And => ExprKind::Bool(a && b),
        BinOp::Or => ExprKind::Bool(a || b),
        _ => return None,
    };
    Some(kind)
}
