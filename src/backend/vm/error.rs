/// Runtime error kinds: arity mismatch, type errors, undefined globals or
/// properties, non-callable call, stack overflow.
#[derive(Debug, Clone)]
pub enum ErrorKind {
    TypeError(String),
    UndefinedVariable(String),
    UndefinedProperty(String),
    InvalidCall(String),
    StackOverflow,
    InternalError(String),
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub name: String,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub trace: Vec<Frame>,
}

impl RuntimeError {
    pub fn message(&self) -> String {
        match &self.kind {
            ErrorKind::TypeError(m) => m.clone(),
            ErrorKind::UndefinedVariable(name) => format!("Undefined variable '{name}'."),
            ErrorKind::UndefinedProperty(name) => format!("Undefined property '{name}'."),
            ErrorKind::InvalidCall(m) => m.clone(),
            ErrorKind::StackOverflow => "Stack overflow.".to_string(),
            ErrorKind::InternalError(m) => format!("Internal error: {m}"),
        }
    }

    /// Prints the message followed by one `[line N] in NAME` per active
    /// frame, innermost first.
    pub fn report(&self) {
        eprintln!("{}", self.message());
        for frame in self.trace.iter().rev() {
            eprintln!("[line {}] in {}", frame.line, frame.name);
        }
    }
}
