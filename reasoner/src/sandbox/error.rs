use thiserror::Error;

/// Failure raised while running a script. Always contained: the sandbox turns
/// it into a failed `ExecutionOutcome`, never a panic or a process exit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("{fault} (line {line})")]
    Runtime { line: usize, fault: Fault },
    #[error("code length exceeded: {length} characters, limit is {limit}")]
    LengthExceeded { length: usize, limit: usize },
}

/// Runtime fault without position information. Statements attach their line
/// when the fault escapes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("name '{0}' is not defined")]
    UndefinedName(String),
    #[error("'{0}' is not available in the sandbox")]
    Denied(String),
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    Value(String),
    #[error("division by zero")]
    ZeroDivision,
    #[error("{0}")]
    Index(String),
    #[error("key {0} not found")]
    Key(String),
    #[error("{0}")]
    Attribute(String),
    #[error("integer overflow")]
    Overflow,
    #[error("execution step limit exceeded")]
    FuelExhausted,
    #[error("{0} exceeds the sandbox size limit")]
    TooLarge(String),
    #[error(
        "cannot change a {0} in place while another name still refers to it; copy it first, e.g. list(x) or dict(x)"
    )]
    Shared(&'static str),
    #[error("'{0}' outside loop")]
    LoopControl(&'static str),
}

impl Fault {
    pub fn at(self, line: usize) -> ScriptError {
        ScriptError::Runtime { line, fault: self }
    }
}
