use crate::RuntimeError;
use std::fmt;
use std::process::Command;

/// A program and its argument vector, validated before anything is spawned.
///
/// Arguments are passed straight to the OS without a shell, so paths with
/// spaces or shell metacharacters need no quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.program.trim().is_empty() {
            return Err(RuntimeError::InvalidCommand("program must not be empty".to_owned()));
        }
        if self.program != self.program.trim() {
            return Err(RuntimeError::InvalidCommand(format!(
                "program '{}' has surrounding whitespace",
                self.program
            )));
        }
        if self.program.contains('\0') {
            return Err(RuntimeError::InvalidCommand("program contains a NUL byte".to_owned()));
        }
        for (i, arg) in self.args.iter().enumerate() {
            if arg.contains('\0') {
                return Err(RuntimeError::InvalidCommand(format!(
                    "argument {i} of '{}' contains a NUL byte",
                    self.program
                )));
            }
            if arg.contains(['\n', '\r']) {
                return Err(RuntimeError::InvalidCommand(format!(
                    "argument {i} of '{}' contains a line break",
                    self.program
                )));
            }
        }
        Ok(())
    }

    pub fn to_command(&self) -> Result<Command, RuntimeError> {
        self.validate()?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        Ok(cmd)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}
