use std::fmt;

use enumflags2::BitFlags;

// Identifier of a heap object. Ids are nonzero and never reused during a
// run, so a stale ArrayRef can always be told apart from a live one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeapId(pub u32);

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// Element type of a heap array. Arrays hold only scalars, which is what
// keeps the reference graph acyclic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElemType {
    Int,
    Float,
    Bool,
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ElemType::Int => write!(f, "int"),
            ElemType::Float => write!(f, "float"),
            ElemType::Bool => write!(f, "bool"),
        }
    }
}

// Static types. The bytecode layer allows exactly one level of array
// nesting, so an array type is just its element type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Int,
    Float,
    Bool,
    Void,
    Array(ElemType),
}

impl Type {
    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Bool)
    }

    pub fn scalar(elem: ElemType) -> Type {
        match elem {
            ElemType::Int => Type::Int,
            ElemType::Float => Type::Float,
            ElemType::Bool => Type::Bool,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Bool => write!(f, "bool"),
            Type::Void => write!(f, "void"),
            Type::Array(elem) => write!(f, "{}[]", elem),
        }
    }
}

// Runtime type of a value, as a bitflag so errors can describe sets of
// acceptable types.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum TypeTag {
    Int = 0b00001,
    Float = 0b00010,
    Bool = 0b00100,
    Array = 0b01000,
    Void = 0b10000,
}

pub type TypeSet = BitFlags<TypeTag>;

// All runtime values. Arrays live on the heap; the stack and locals only
// carry references to them.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(HeapId),
    Void,
}

impl Value {
    pub fn get_type(&self) -> TypeTag {
        match self {
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Bool(_) => TypeTag::Bool,
            Value::Array(_) => TypeTag::Array,
            Value::Void => TypeTag::Void,
        }
    }

    pub fn as_heap_ref(&self) -> Option<HeapId> {
        match self {
            Value::Array(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    // The display form used by `print`. Floats keep a decimal point so a
    // whole float still reads as a float.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Array(id) => write!(f, "array{}", id),
            Value::Void => write!(f, "void"),
        }
    }
}
