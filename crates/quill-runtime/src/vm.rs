//! Stack-based executor for Quill bytecode.
//!
//! One `Vm` runs one extension's bytecode unit. Host operations are
//! reached only through the [`HostCalls`] trait, so the VM itself holds
//! no host state and the bridge keeps full control over what a call may
//! touch.
//!
//! Every failure mode inside the interpreter (bad index, division by
//! zero, unknown function, runaway loop) surfaces as
//! [`RuntimeError::ExecutionFault`]; the VM never panics on extension
//! input. The instruction budget and the cooperative cancel flag are
//! checked once per instruction, which makes every instruction a yield
//! point for cancellation.

use crate::bytecode::{Bytecode, Constant, Function, Instruction};
use crate::error::{RuntimeError, RuntimeResult};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default per-call instruction budget.
pub const DEFAULT_INSTRUCTION_BUDGET: u64 = 1_000_000;

/// Maximum nested `CallFn` depth.
const MAX_CALL_DEPTH: usize = 64;

/// Host operations available to running bytecode.
///
/// Implemented by the native bridge; the VM passes argument values
/// through unchanged and pushes whatever the host returns. Host errors
/// (capability denials, marshal errors) propagate to the caller intact.
pub trait HostCalls {
    fn host_call(&mut self, name: &str, args: Vec<Value>) -> RuntimeResult<Value>;
}

/// Cooperative cancellation flag shared between the host and a VM.
///
/// There is no preemption: a cancelled VM keeps running until its next
/// yield point, then fails the current call with an execution fault.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the current call.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// A Quill bytecode interpreter for one extension.
pub struct Vm {
    bytecode: Arc<Bytecode>,
    globals: HashMap<String, Value>,
    budget: u64,
    cancel: CancelToken,
}

impl Vm {
    /// Create a VM over validated bytecode.
    pub fn new(bytecode: Bytecode, budget: u64, cancel: CancelToken) -> Self {
        Self {
            bytecode: Arc::new(bytecode),
            globals: HashMap::new(),
            budget,
            cancel,
        }
    }

    /// Whether the bytecode defines a function with this name.
    pub fn has_function(&self, name: &str) -> bool {
        self.bytecode.functions.iter().any(|f| f.name == name)
    }

    /// The cancel token shared with the host.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Call a named function with the given arguments.
    ///
    /// Missing arguments are filled with null and extras are dropped;
    /// hooks and user entry points share one uniform invocation shape.
    pub fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        host: &mut dyn HostCalls,
    ) -> RuntimeResult<Value> {
        self.cancel.clear();
        let bytecode = Arc::clone(&self.bytecode);
        let function = find_function(&bytecode, name)?;
        let mut steps = 0u64;
        self.run(&bytecode, function, args, host, 0, &mut steps)
    }

    fn run(
        &mut self,
        bytecode: &Bytecode,
        function: &Function,
        args: Vec<Value>,
        host: &mut dyn HostCalls,
        depth: usize,
        steps: &mut u64,
    ) -> RuntimeResult<Value> {
        if depth > MAX_CALL_DEPTH {
            return Err(fault("call depth exceeded"));
        }

        let mut locals = vec![Value::Null; function.params.len() + function.local_count];
        for (slot, arg) in locals.iter_mut().zip(args.into_iter()) {
            *slot = arg;
        }

        let mut stack: Vec<Value> = Vec::new();
        let code = &function.instructions;
        let mut pc: usize = 0;

        while pc < code.len() {
            *steps += 1;
            if *steps > self.budget {
                return Err(fault("instruction budget exceeded"));
            }
            if self.cancel.is_cancelled() {
                return Err(fault("cancelled by host"));
            }

            let mut next = pc + 1;

            match &code[pc] {
                Instruction::LoadConst { index } => {
                    let constant = bytecode
                        .constants
                        .get(*index)
                        .ok_or_else(|| fault(&format!("constant {index} out of range")))?;
                    stack.push(constant_value(constant));
                }
                Instruction::LoadLocal { index } => {
                    let value = locals
                        .get(*index)
                        .cloned()
                        .ok_or_else(|| fault(&format!("local {index} out of range")))?;
                    stack.push(value);
                }
                Instruction::StoreLocal { index } => {
                    let value = pop(&mut stack)?;
                    let slot = locals
                        .get_mut(*index)
                        .ok_or_else(|| fault(&format!("local {index} out of range")))?;
                    *slot = value;
                }
                Instruction::LoadGlobal { name } => {
                    let value = self
                        .globals
                        .get(name)
                        .cloned()
                        .ok_or_else(|| fault(&format!("undefined global '{name}'")))?;
                    stack.push(value);
                }
                Instruction::StoreGlobal { name } => {
                    let value = pop(&mut stack)?;
                    self.globals.insert(name.clone(), value);
                }
                Instruction::CallFn { name, arg_count } => {
                    let callee = find_function(bytecode, name)?;
                    let call_args = pop_args(&mut stack, *arg_count)?;
                    let result = self.run(bytecode, callee, call_args, host, depth + 1, steps)?;
                    stack.push(result);
                }
                Instruction::CallHost { name, arg_count } => {
                    let call_args = pop_args(&mut stack, *arg_count)?;
                    let result = host.host_call(name, call_args)?;
                    stack.push(result);
                }
                Instruction::Return => {
                    return Ok(stack.pop().unwrap_or(Value::Null));
                }
                Instruction::Jump { offset } => {
                    next = jump_target(pc, *offset, code.len())?;
                }
                Instruction::JumpIfFalse { offset } => {
                    let condition = pop(&mut stack)?;
                    if !condition.is_truthy() {
                        next = jump_target(pc, *offset, code.len())?;
                    }
                }
                Instruction::Pop => {
                    pop(&mut stack)?;
                }
                Instruction::Dup => {
                    let top = stack
                        .last()
                        .cloned()
                        .ok_or_else(|| fault("stack underflow on dup"))?;
                    stack.push(top);
                }
                Instruction::Add => binary(&mut stack, |a, b| add(a, b))?,
                Instruction::Sub => binary(&mut stack, |a, b| arithmetic("subtract", a, b))?,
                Instruction::Mul => binary(&mut stack, |a, b| arithmetic("multiply", a, b))?,
                Instruction::Div => binary(&mut stack, |a, b| divide(a, b))?,
                Instruction::Eq => binary(&mut stack, |a, b| Ok(Value::Bool(values_equal(&a, &b))))?,
                Instruction::Ne => {
                    binary(&mut stack, |a, b| Ok(Value::Bool(!values_equal(&a, &b))))?
                }
                Instruction::Lt => binary(&mut stack, |a, b| compare(a, b, |o| o.is_lt()))?,
                Instruction::Le => binary(&mut stack, |a, b| compare(a, b, |o| o.is_le()))?,
                Instruction::Gt => binary(&mut stack, |a, b| compare(a, b, |o| o.is_gt()))?,
                Instruction::Ge => binary(&mut stack, |a, b| compare(a, b, |o| o.is_ge()))?,
                Instruction::Not => {
                    let value = pop(&mut stack)?;
                    stack.push(Value::Bool(!value.is_truthy()));
                }
                Instruction::And => binary(&mut stack, |a, b| {
                    Ok(Value::Bool(a.is_truthy() && b.is_truthy()))
                })?,
                Instruction::Or => binary(&mut stack, |a, b| {
                    Ok(Value::Bool(a.is_truthy() || b.is_truthy()))
                })?,
                Instruction::MakeList { count } => {
                    let items = pop_args(&mut stack, *count)?;
                    stack.push(Value::List(items));
                }
                Instruction::MakeMap { count } => {
                    let mut entries = Vec::with_capacity(*count);
                    for _ in 0..*count {
                        let value = pop(&mut stack)?;
                        let key = match pop(&mut stack)? {
                            Value::Str(s) => s,
                            other => {
                                return Err(fault(&format!(
                                    "map key must be a string, got {}",
                                    other.type_name()
                                )))
                            }
                        };
                        entries.push((key, value));
                    }
                    entries.reverse();
                    stack.push(Value::Map(entries));
                }
                Instruction::GetIndex => {
                    let index = pop(&mut stack)?;
                    let container = pop(&mut stack)?;
                    stack.push(get_index(container, index)?);
                }
                Instruction::SetIndex => {
                    let value = pop(&mut stack)?;
                    let index = pop(&mut stack)?;
                    let container = pop(&mut stack)?;
                    stack.push(set_index(container, index, value)?);
                }
                Instruction::Nop => {}
            }

            pc = next;
        }

        // Falling off the end of a function returns null.
        Ok(Value::Null)
    }
}

fn find_function<'a>(bytecode: &'a Bytecode, name: &str) -> RuntimeResult<&'a Function> {
    bytecode
        .functions
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| fault(&format!("unknown function '{name}'")))
}

fn fault(message: &str) -> RuntimeError {
    RuntimeError::ExecutionFault(message.to_string())
}

fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::Null => Value::Null,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::String(s) => Value::Str(s.clone()),
    }
}

fn pop(stack: &mut Vec<Value>) -> RuntimeResult<Value> {
    stack.pop().ok_or_else(|| fault("stack underflow"))
}

fn pop_args(stack: &mut Vec<Value>, count: usize) -> RuntimeResult<Vec<Value>> {
    if stack.len() < count {
        return Err(fault("stack underflow collecting call arguments"));
    }
    let args = stack.split_off(stack.len() - count);
    Ok(args)
}

fn binary(
    stack: &mut Vec<Value>,
    op: impl FnOnce(Value, Value) -> RuntimeResult<Value>,
) -> RuntimeResult<()> {
    let b = pop(stack)?;
    let a = pop(stack)?;
    stack.push(op(a, b)?);
    Ok(())
}

fn jump_target(pc: usize, offset: i32, len: usize) -> RuntimeResult<usize> {
    let target = pc as i64 + offset as i64;
    if target < 0 || target > len as i64 {
        return Err(fault(&format!("jump target {target} out of range")));
    }
    Ok(target as usize)
}

fn add(a: Value, b: Value) -> RuntimeResult<Value> {
    match (&a, &b) {
        (Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{x}{y}"))),
        (Value::List(x), Value::List(y)) => {
            let mut joined = x.clone();
            joined.extend(y.iter().cloned());
            Ok(Value::List(joined))
        }
        _ => arithmetic("add", a, b),
    }
}

fn arithmetic(op: &str, a: Value, b: Value) -> RuntimeResult<Value> {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => {
            let result = match op {
                "add" => x.checked_add(*y),
                "subtract" => x.checked_sub(*y),
                "multiply" => x.checked_mul(*y),
                _ => None,
            };
            result
                .map(Value::Int)
                .ok_or_else(|| fault(&format!("integer overflow in {op}")))
        }
        _ => {
            let (x, y) = (as_float(&a), as_float(&b));
            match (x, y) {
                (Some(x), Some(y)) => {
                    let result = match op {
                        "add" => x + y,
                        "subtract" => x - y,
                        "multiply" => x * y,
                        _ => return Err(fault(&format!("unsupported arithmetic op {op}"))),
                    };
                    Ok(Value::Float(result))
                }
                _ => Err(fault(&format!(
                    "cannot {op} {} and {}",
                    a.type_name(),
                    b.type_name()
                ))),
            }
        }
    }
}

fn divide(a: Value, b: Value) -> RuntimeResult<Value> {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                return Err(fault("division by zero"));
            }
            x.checked_div(*y)
                .map(Value::Int)
                .ok_or_else(|| fault("integer overflow in divide"))
        }
        _ => match (as_float(&a), as_float(&b)) {
            (Some(x), Some(y)) => {
                if y == 0.0 {
                    return Err(fault("division by zero"));
                }
                Ok(Value::Float(x / y))
            }
            _ => Err(fault(&format!(
                "cannot divide {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn compare(
    a: Value,
    b: Value,
    check: impl FnOnce(std::cmp::Ordering) -> bool,
) -> RuntimeResult<Value> {
    let ordering = match (&a, &b) {
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => match (as_float(&a), as_float(&b)) {
            (Some(x), Some(y)) => x
                .partial_cmp(&y)
                .ok_or_else(|| fault("cannot order NaN"))?,
            _ => {
                return Err(fault(&format!(
                    "cannot compare {} and {}",
                    a.type_name(),
                    b.type_name()
                )))
            }
        },
    };
    Ok(Value::Bool(check(ordering)))
}

fn get_index(container: Value, index: Value) -> RuntimeResult<Value> {
    match (container, index) {
        (Value::List(items), Value::Int(i)) => {
            if i < 0 || i as usize >= items.len() {
                return Err(fault(&format!("list index {i} out of range")));
            }
            Ok(items[i as usize].clone())
        }
        (Value::Map(entries), Value::Str(key)) => Ok(entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)),
        (container, index) => Err(fault(&format!(
            "cannot index {} with {}",
            container.type_name(),
            index.type_name()
        ))),
    }
}

fn set_index(container: Value, index: Value, value: Value) -> RuntimeResult<Value> {
    match (container, index) {
        (Value::List(mut items), Value::Int(i)) => {
            if i < 0 || i as usize >= items.len() {
                return Err(fault(&format!("list index {i} out of range")));
            }
            items[i as usize] = value;
            Ok(Value::List(items))
        }
        (Value::Map(mut entries), Value::Str(key)) => {
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
            Ok(Value::Map(entries))
        }
        (container, index) => Err(fault(&format!(
            "cannot index {} with {}",
            container.type_name(),
            index.type_name()
        ))),
    }
}
