//! Quill bytecode format and loader.
//!
//! The Quill bytecode format (`.qlb`) is the compiled form of an
//! extension's code.
//!
//! ## Format
//!
//! ```text
//! +----------------+
//! | Magic (4 bytes)|  "QLB\x01" (version 1)
//! +----------------+
//! | Body           |  JSON: metadata, constant pool, functions
//! +----------------+
//! ```
//!
//! Files without the magic are parsed directly as JSON (development
//! format). Loading never executes anything; execution happens only when
//! a session explicitly calls a function through the VM.

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Magic bytes for Quill bytecode files.
pub const MAGIC: &[u8; 4] = b"QLB\x01";

/// Quill bytecode representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bytecode {
    /// Version of the bytecode format.
    pub version: u8,

    /// Extension metadata embedded in bytecode.
    pub metadata: BytecodeMetadata,

    /// Constant pool.
    pub constants: Vec<Constant>,

    /// Function definitions.
    pub functions: Vec<Function>,

    /// Entry point function name.
    pub entry_point: String,
}

/// Metadata embedded in bytecode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BytecodeMetadata {
    /// Extension ID.
    pub extension_id: String,

    /// Extension version.
    pub extension_version: String,

    /// Compilation timestamp.
    pub compiled_at: Option<String>,

    /// Compiler version.
    pub compiler_version: Option<String>,
}

/// A constant value in the constant pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Constant {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Float value.
    Float(f64),
    /// String value.
    String(String),
}

/// A function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Function name.
    pub name: String,

    /// Parameter names.
    pub params: Vec<String>,

    /// Instructions.
    pub instructions: Vec<Instruction>,

    /// Local variable count (in addition to parameters).
    pub local_count: usize,
}

/// A bytecode instruction.
///
/// Jump offsets are relative to the jump instruction itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Instruction {
    /// Load a constant from the pool.
    LoadConst { index: usize },

    /// Load a local variable.
    LoadLocal { index: usize },

    /// Store to a local variable.
    StoreLocal { index: usize },

    /// Load a global variable.
    LoadGlobal { name: String },

    /// Store to a global variable.
    StoreGlobal { name: String },

    /// Call another function in this bytecode unit.
    CallFn { name: String, arg_count: usize },

    /// Call a host operation through the bridge.
    CallHost { name: String, arg_count: usize },

    /// Return from function.
    Return,

    /// Jump to offset.
    Jump { offset: i32 },

    /// Pop condition; jump if it is falsy.
    JumpIfFalse { offset: i32 },

    /// Pop value from stack.
    Pop,

    /// Duplicate top of stack.
    Dup,

    /// Binary add (also string concatenation).
    Add,

    /// Binary subtract.
    Sub,

    /// Binary multiply.
    Mul,

    /// Binary divide.
    Div,

    /// Comparison: equal.
    Eq,

    /// Comparison: not equal.
    Ne,

    /// Comparison: less than.
    Lt,

    /// Comparison: less than or equal.
    Le,

    /// Comparison: greater than.
    Gt,

    /// Comparison: greater than or equal.
    Ge,

    /// Logical not.
    Not,

    /// Logical and.
    And,

    /// Logical or.
    Or,

    /// Create list from N items on stack.
    MakeList { count: usize },

    /// Create map from N key-value pairs on stack.
    MakeMap { count: usize },

    /// Get index/key from list/map.
    GetIndex,

    /// Set index/key in list/map; pushes the modified container.
    SetIndex,

    /// No operation.
    Nop,
}

/// Bytecode loader.
pub struct BytecodeLoader;

impl BytecodeLoader {
    /// Load bytecode from a file.
    pub fn load(path: &Path) -> RuntimeResult<Bytecode> {
        let content = std::fs::read(path)?;
        Self::parse(&content)
    }

    /// Parse bytecode from bytes.
    pub fn parse(bytes: &[u8]) -> RuntimeResult<Bytecode> {
        if bytes.len() < 4 {
            return Err(RuntimeError::BytecodeError(
                "file too small to be valid bytecode".to_string(),
            ));
        }

        if &bytes[0..4] == MAGIC {
            Self::parse_json(&bytes[4..])
        } else {
            // Development/debug format without the magic prefix.
            Self::parse_json(bytes)
        }
    }

    fn parse_json(bytes: &[u8]) -> RuntimeResult<Bytecode> {
        let content = std::str::from_utf8(bytes)
            .map_err(|e| RuntimeError::BytecodeError(format!("invalid UTF-8: {e}")))?;

        serde_json::from_str(content)
            .map_err(|e| RuntimeError::BytecodeError(format!("invalid bytecode JSON: {e}")))
    }

    /// Validate bytecode structure.
    pub fn validate(bytecode: &Bytecode) -> RuntimeResult<()> {
        if bytecode.version != 1 {
            return Err(RuntimeError::BytecodeError(format!(
                "unsupported bytecode version: {}",
                bytecode.version
            )));
        }

        let has_entry = bytecode
            .functions
            .iter()
            .any(|f| f.name == bytecode.entry_point);

        if !has_entry {
            return Err(RuntimeError::BytecodeError(format!(
                "entry point function '{}' not found",
                bytecode.entry_point
            )));
        }

        for function in &bytecode.functions {
            for instruction in &function.instructions {
                if let Instruction::LoadConst { index } = instruction {
                    if *index >= bytecode.constants.len() {
                        return Err(RuntimeError::BytecodeError(format!(
                            "function '{}' references constant {} but the pool has {}",
                            function.name,
                            index,
                            bytecode.constants.len()
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
