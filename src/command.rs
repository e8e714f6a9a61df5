/// Worker command specifications: program path, positional args, and the
/// `{N}` placeholder expansion used to splice CLI parameters into them.
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Matches `{1}`, `{2}`, ... inside an argument.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(\d+)\}").unwrap());

/// One worker to launch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    name: String,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

/// Returned when a spec is built without a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyCommand;

impl fmt::Display for EmptyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command is empty")
    }
}

impl std::error::Error for EmptyCommand {}

impl CommandSpec {
    /// Build a spec from a program and its arguments.
    ///
    /// The display name defaults to the program's file name.
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, EmptyCommand> {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(EmptyCommand);
        }
        let name = default_name(&program);
        Ok(Self {
            name,
            program,
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        })
    }

    /// Build a spec from a flat argv (`[program, arg1, ...]`).
    #[cfg(test)]
    pub fn from_argv(argv: &[&str]) -> Result<Self, EmptyCommand> {
        let (program, args) = argv.split_first().ok_or(EmptyCommand)?;
        Self::new(*program, args.iter().copied())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

fn default_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

/// A `{N}` placeholder with no matching positional parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedPlaceholder {
    pub position: usize,
    pub available: usize,
}

impl fmt::Display for UnresolvedPlaceholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "placeholder {{{}}} needs positional parameter {} but only {} given",
            self.position, self.position, self.available
        )
    }
}

impl std::error::Error for UnresolvedPlaceholder {}

/// Replace every `{N}` in `template` with `params[N - 1]`.
///
/// `{0}` is never valid: positions are 1-based, like a launch script's argv.
pub fn expand_placeholders(template: &str, params: &[String]) -> Result<String, UnresolvedPlaceholder> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let position: usize = caps[1].parse().unwrap_or(0);
        let value = position
            .checked_sub(1)
            .and_then(|i| params.get(i))
            .ok_or(UnresolvedPlaceholder {
                position,
                available: params.len(),
            })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}
