// The JIT seam. The interpreter only sees this small interface: a strategy
// is told about every call, and may answer a lookup with a native executor
// once a function is warm. Executors run a whole frame and must leave the
// operand stack exactly as the interpreter would have.

use std::collections::HashMap;
use std::rc::Rc;

use crate::memory::{Heap, OperandStack};
use crate::vm::{Frame, Result};

pub trait FunctionExecutor {
    fn execute(&self, frame: &mut Frame, stack: &mut OperandStack, heap: &mut Heap)
        -> Result<()>;
}

pub trait JitStrategy {
    fn enabled(&self) -> bool;

    // Called on every CALL instruction, for profiling.
    fn record_call(&mut self, name: &str);

    // An executor for the named function, if one is ready.
    fn lookup(&self, name: &str) -> Option<Rc<dyn FunctionExecutor>>;
}

// The default strategy: everything stays interpreted.
pub struct NoJit;

impl JitStrategy for NoJit {
    fn enabled(&self) -> bool {
        false
    }

    fn record_call(&mut self, _name: &str) {}

    fn lookup(&self, _name: &str) -> Option<Rc<dyn FunctionExecutor>> {
        None
    }
}

// A profiling strategy: counts calls and hands out registered executors
// once a function has crossed the warmup threshold.
pub struct CountingJit {
    threshold: u32,
    counts: HashMap<String, u32>,
    executors: HashMap<String, Rc<dyn FunctionExecutor>>,
}

impl CountingJit {
    pub fn new(threshold: u32) -> CountingJit {
        CountingJit {
            threshold,
            counts: HashMap::new(),
            executors: HashMap::new(),
        }
    }

    pub fn install(&mut self, name: &str, executor: Rc<dyn FunctionExecutor>) {
        self.executors.insert(name.to_string(), executor);
    }

    pub fn call_count(&self, name: &str) -> u32 {
        self.counts.get(name).copied().unwrap_or(0)
    }
}

impl JitStrategy for CountingJit {
    fn enabled(&self) -> bool {
        true
    }

    fn record_call(&mut self, name: &str) {
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
    }

    fn lookup(&self, name: &str) -> Option<Rc<dyn FunctionExecutor>> {
        if self.call_count(name) < self.threshold {
            return None;
        }
        self.executors.get(name).cloned()
    }
}
