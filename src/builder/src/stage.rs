//! Stages and instructions.
//!
//! A [`Stage`] is the already-parsed `FROM ... <instructions>` unit of a
//! build. Each [`Step`] keeps the instruction's original text, keyword,
//! flags and raw arguments; [`Step::resolve`] substitutes variables and
//! turns it into a typed [`Instruction`].

use std::collections::BTreeMap;

use kiln_core::error::{BuildError, Result};

use crate::image::HealthCheck;
use crate::words::{expand_word, split_words};

/// One stage of a multi-stage build.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Alias from `FROM ... AS <name>`, or the position as a string
    pub name: String,
    /// Index of this stage in the build
    pub position: usize,
    /// Base image reference, a prior stage name, or `scratch`
    pub base: String,
    /// Instructions in source order
    pub steps: Vec<Step>,
}

impl Stage {
    pub fn new(position: usize, base: impl Into<String>, alias: Option<&str>) -> Self {
        Self {
            name: alias
                .map(str::to_string)
                .unwrap_or_else(|| position.to_string()),
            position,
            base: base.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Build a stage from single-line instruction texts.
    pub fn from_lines(
        position: usize,
        base: &str,
        alias: Option<&str>,
        lines: &[&str],
    ) -> Result<Self> {
        let mut stage = Stage::new(position, base, alias);
        for line in lines {
            stage.steps.push(Step::from_line(line)?);
        }
        Ok(stage)
    }

    /// Stages or images this stage reads files from: `--from=` of COPY/ADD
    /// and `from=` of `RUN --mount`, expanded with the user's build
    /// arguments. A value that does not expand is kept as written.
    pub fn from_references(&self, args: &BTreeMap<String, String>) -> Vec<String> {
        let lookup = |name: &str| args.get(name).cloned();
        self.steps
            .iter()
            .flat_map(|step| {
                let copy_from = step.flag_value("--from").map(str::to_string);
                let mount_from = step
                    .flags
                    .iter()
                    .filter_map(|f| f.strip_prefix("--mount="))
                    .filter_map(|m| {
                        m.split(',')
                            .find_map(|field| field.strip_prefix("from="))
                            .map(str::to_string)
                    })
                    .collect::<Vec<_>>();
                copy_from.into_iter().chain(mount_from)
            })
            .map(|raw| expand_word(&raw, &lookup).unwrap_or(raw))
            .collect()
    }
}

/// Whether any of `steps` at or after `from` is a RUN.
pub fn runs_remaining(steps: &[Step], from: usize) -> bool {
    steps
        .iter()
        .skip(from)
        .any(|s| s.kind() == InstructionKind::Run)
}

/// An instruction as handed over by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Instruction text as written, used for history and diagnostics
    pub original: String,
    /// Lowercase keyword (`run`, `copy`, ...)
    pub command: String,
    /// Flags such as `--from=builder`
    pub flags: Vec<String>,
    /// Arguments before variable substitution
    pub args: Vec<String>,
    /// Arguments were given in JSON (exec) form
    pub json: bool,
}

impl Step {
    pub fn new(command: &str, flags: Vec<String>, args: Vec<String>) -> Self {
        let mut original = command.to_uppercase();
        for part in flags.iter().chain(args.iter()) {
            original.push(' ');
            original.push_str(part);
        }
        Self {
            original,
            command: command.to_lowercase(),
            flags,
            args,
            json: false,
        }
    }

    /// Build a step from one instruction line such as `COPY --from=a /x /y`.
    ///
    /// Only single-line forms are understood; no continuations or heredocs.
    pub fn from_line(line: &str) -> Result<Self> {
        let original = line.trim().to_string();
        let (keyword, mut rest) = split_first_word(&original);
        if keyword.is_empty() {
            return Err(BuildError::InvalidInstruction("empty instruction".into()));
        }
        let command = keyword.to_lowercase();
        let kind = InstructionKind::from_command(&command);

        let mut flags = Vec::new();
        if kind.accepts_flags() {
            while rest.starts_with("--") {
                let (flag, after) = split_first_word(rest);
                flags.push(flag.to_string());
                rest = after;
            }
        }

        let mut json = false;
        let args = if rest.starts_with('[') && kind.accepts_json() {
            json = true;
            parse_json_array(rest)?
        } else {
            match kind {
                InstructionKind::Run
                | InstructionKind::Cmd
                | InstructionKind::Entrypoint
                | InstructionKind::OnBuild
                | InstructionKind::Maintainer
                | InstructionKind::StopSignal
                | InstructionKind::Workdir
                | InstructionKind::User
                | InstructionKind::Unrecognized => {
                    if rest.is_empty() {
                        Vec::new()
                    } else {
                        vec![rest.to_string()]
                    }
                }
                InstructionKind::Healthcheck => {
                    let (first, after) = split_first_word(rest);
                    if first.eq_ignore_ascii_case("CMD") {
                        vec!["CMD".to_string(), after.to_string()]
                    } else {
                        vec![first.to_uppercase()]
                    }
                }
                InstructionKind::Env | InstructionKind::Label => {
                    let (first, after) = split_first_word(rest);
                    if first.contains('=') || first.is_empty() {
                        split_words(rest)
                    } else {
                        // legacy `ENV KEY value with spaces`
                        vec![format!("{}={}", first, after)]
                    }
                }
                _ => split_words(rest),
            }
        };

        Ok(Self {
            original,
            command,
            flags,
            args,
            json,
        })
    }

    pub fn kind(&self) -> InstructionKind {
        InstructionKind::from_command(&self.command)
    }

    /// Value of a `--name=value` flag, if present.
    pub fn flag_value(&self, name: &str) -> Option<&str> {
        self.flags.iter().find_map(|f| {
            f.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    /// Original text without the leading keyword.
    pub fn original_args(&self) -> &str {
        split_first_word(&self.original).1
    }

    /// Substitute variables and produce a typed instruction.
    pub fn resolve(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Instruction> {
        let kind = self.kind();
        let expand = |word: &str| -> Result<String> {
            if kind.expands_variables() {
                expand_word(word, lookup)
            } else {
                Ok(word.to_string())
            }
        };

        if !kind.accepts_flags() && !self.flags.is_empty() {
            return Err(BuildError::InvalidInstruction(format!(
                "{} does not accept flags: {}",
                self.command.to_uppercase(),
                self.flags.join(" ")
            )));
        }

        let instruction = match kind {
            InstructionKind::Run => {
                let mut mounts = Vec::new();
                for flag in &self.flags {
                    let Some(value) = flag.strip_prefix("--mount=") else {
                        return Err(BuildError::InvalidInstruction(format!(
                            "RUN flag {} is not supported",
                            flag
                        )));
                    };
                    mounts.push(RunMount::parse(&expand_word(value, lookup)?)?);
                }
                self.require_args(1)?;
                Instruction::Run {
                    args: self.args.clone(),
                    shell_form: !self.json,
                    mounts,
                }
            }
            InstructionKind::Copy | InstructionKind::Add => {
                let spec = self.resolve_copy(kind, &expand)?;
                if kind == InstructionKind::Copy {
                    Instruction::Copy(spec)
                } else {
                    Instruction::Add(spec)
                }
            }
            InstructionKind::Env | InstructionKind::Label => {
                self.require_args(1)?;
                let mut pairs = Vec::new();
                for word in &self.args {
                    let expanded = expand(word)?;
                    let (key, value) = expanded.split_once('=').ok_or_else(|| {
                        BuildError::InvalidInstruction(format!(
                            "{} expects KEY=VALUE, got {:?}",
                            self.command.to_uppercase(),
                            word
                        ))
                    })?;
                    if key.is_empty() {
                        return Err(BuildError::InvalidInstruction(format!(
                            "{} has an empty key",
                            self.command.to_uppercase()
                        )));
                    }
                    pairs.push((key.to_string(), value.to_string()));
                }
                if kind == InstructionKind::Env {
                    Instruction::Env(pairs)
                } else {
                    Instruction::Label(pairs)
                }
            }
            InstructionKind::Arg => {
                self.require_args(1)?;
                let mut decls = Vec::new();
                for word in &self.args {
                    match word.split_once('=') {
                        Some((name, default)) => {
                            decls.push((name.to_string(), Some(expand(default)?)))
                        }
                        None => decls.push((word.clone(), None)),
                    }
                }
                Instruction::Arg(decls)
            }
            InstructionKind::Workdir => Instruction::Workdir(expand(self.single_arg()?)?),
            InstructionKind::User => Instruction::User(expand(self.single_arg()?)?),
            InstructionKind::StopSignal => Instruction::StopSignal(expand(self.single_arg()?)?),
            InstructionKind::Expose => {
                self.require_args(1)?;
                Instruction::Expose(self.expand_all(&expand)?)
            }
            InstructionKind::Volume => {
                self.require_args(1)?;
                Instruction::Volume(self.expand_all(&expand)?)
            }
            InstructionKind::Entrypoint => Instruction::Entrypoint {
                args: self.args.clone(),
                shell_form: !self.json,
            },
            InstructionKind::Cmd => Instruction::Cmd {
                args: self.args.clone(),
                shell_form: !self.json,
            },
            InstructionKind::Shell => {
                if !self.json {
                    return Err(BuildError::InvalidInstruction(
                        "SHELL requires the JSON form".into(),
                    ));
                }
                self.require_args(1)?;
                Instruction::Shell(self.args.clone())
            }
            InstructionKind::Healthcheck => Instruction::Healthcheck(self.resolve_healthcheck()?),
            InstructionKind::OnBuild => {
                let trigger = self.single_arg()?;
                let keyword = split_first_word(trigger).0.to_ascii_lowercase();
                if matches!(keyword.as_str(), "onbuild" | "from" | "maintainer") {
                    return Err(BuildError::InvalidInstruction(format!(
                        "{} is not allowed as an ONBUILD trigger",
                        keyword.to_uppercase()
                    )));
                }
                Instruction::OnBuild(trigger.to_string())
            }
            InstructionKind::Maintainer => {
                Instruction::Maintainer(self.single_arg()?.to_string())
            }
            InstructionKind::Unrecognized => Instruction::Unrecognized(self.original.clone()),
        };
        Ok(instruction)
    }

    fn resolve_copy(
        &self,
        kind: InstructionKind,
        expand: &dyn Fn(&str) -> Result<String>,
    ) -> Result<CopySpec> {
        let name = self.command.to_uppercase();
        let allowed: &[&str] = if kind == InstructionKind::Copy {
            &["--from", "--chown", "--chmod"]
        } else {
            &["--chown", "--chmod"]
        };

        let mut spec = CopySpec::default();
        for flag in &self.flags {
            let (key, value) = flag.split_once('=').unwrap_or((flag.as_str(), ""));
            if !allowed.contains(&key) || !flag.contains('=') {
                return Err(BuildError::InvalidInstruction(format!(
                    "{} only supports the {} flags, got {:?}",
                    name,
                    allowed
                        .iter()
                        .map(|f| format!("{}=", f))
                        .collect::<Vec<_>>()
                        .join(" "),
                    flag
                )));
            }
            let value = expand(value)?;
            if value.is_empty() {
                return Err(BuildError::InvalidInstruction(format!(
                    "{}: flag {} has an empty value",
                    name, key
                )));
            }
            match key {
                "--from" => spec.from = Some(value),
                "--chown" => spec.chown = Some(value),
                _ => {
                    let mode = u32::from_str_radix(&value, 8).map_err(|_| {
                        BuildError::InvalidInstruction(format!(
                            "{}: invalid --chmod value {:?}",
                            name, value
                        ))
                    })?;
                    spec.chmod = Some(mode);
                }
            }
        }

        if self.args.len() < 2 {
            return Err(BuildError::InvalidInstruction(format!(
                "{} requires at least one source and a destination",
                name
            )));
        }
        let mut words = self.expand_all(expand)?;
        spec.dest = words.pop().unwrap_or_default();
        spec.sources = words;
        Ok(spec)
    }

    fn resolve_healthcheck(&self) -> Result<HealthCheck> {
        let mut check = HealthCheck::default();
        match self.args.first().map(String::as_str) {
            Some("NONE") => {
                if !self.flags.is_empty() {
                    return Err(BuildError::InvalidInstruction(
                        "HEALTHCHECK NONE takes no flags".into(),
                    ));
                }
                check.test = vec!["NONE".to_string()];
                return Ok(check);
            }
            Some("CMD") => {
                let command = self.args.get(1).map(String::as_str).unwrap_or("").trim();
                if command.is_empty() {
                    return Err(BuildError::InvalidInstruction(
                        "HEALTHCHECK CMD requires a command".into(),
                    ));
                }
                if command.starts_with('[') {
                    check.test = vec!["CMD".to_string()];
                    check.test.extend(parse_json_array(command)?);
                } else {
                    check.test = vec!["CMD-SHELL".to_string(), command.to_string()];
                }
            }
            _ => {
                return Err(BuildError::InvalidInstruction(
                    "HEALTHCHECK expects NONE or CMD".into(),
                ))
            }
        }

        for flag in &self.flags {
            let (key, value) = flag.split_once('=').unwrap_or((flag.as_str(), ""));
            match key {
                "--interval" => check.interval = Some(value.to_string()),
                "--timeout" => check.timeout = Some(value.to_string()),
                "--start-period" => check.start_period = Some(value.to_string()),
                "--retries" => {
                    check.retries = Some(value.parse().map_err(|_| {
                        BuildError::InvalidInstruction(format!(
                            "HEALTHCHECK: invalid --retries value {:?}",
                            value
                        ))
                    })?)
                }
                _ => {
                    return Err(BuildError::InvalidInstruction(format!(
                        "HEALTHCHECK: unknown flag {}",
                        flag
                    )))
                }
            }
        }
        Ok(check)
    }

    fn require_args(&self, n: usize) -> Result<()> {
        if self.args.len() < n {
            return Err(BuildError::InvalidInstruction(format!(
                "{} requires at least {} argument(s)",
                self.command.to_uppercase(),
                n
            )));
        }
        Ok(())
    }

    fn single_arg(&self) -> Result<&str> {
        match self.args.as_slice() {
            [one] => Ok(one.as_str()),
            _ => Err(BuildError::InvalidInstruction(format!(
                "{} requires exactly one argument",
                self.command.to_uppercase()
            ))),
        }
    }

    fn expand_all(&self, expand: &dyn Fn(&str) -> Result<String>) -> Result<Vec<String>> {
        self.args.iter().map(|a| expand(a)).collect()
    }
}

/// Tag of an instruction, independent of its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    Run,
    Copy,
    Add,
    Env,
    Label,
    Arg,
    Workdir,
    User,
    Expose,
    Volume,
    Entrypoint,
    Cmd,
    Shell,
    StopSignal,
    Healthcheck,
    OnBuild,
    Maintainer,
    Unrecognized,
}

impl InstructionKind {
    pub fn from_command(command: &str) -> Self {
        match command.to_ascii_lowercase().as_str() {
            "run" => Self::Run,
            "copy" => Self::Copy,
            "add" => Self::Add,
            "env" => Self::Env,
            "label" => Self::Label,
            "arg" => Self::Arg,
            "workdir" => Self::Workdir,
            "user" => Self::User,
            "expose" => Self::Expose,
            "volume" => Self::Volume,
            "entrypoint" => Self::Entrypoint,
            "cmd" => Self::Cmd,
            "shell" => Self::Shell,
            "stopsignal" => Self::StopSignal,
            "healthcheck" => Self::Healthcheck,
            "onbuild" => Self::OnBuild,
            "maintainer" => Self::Maintainer,
            _ => Self::Unrecognized,
        }
    }

    /// Instructions whose effect is a filesystem layer.
    pub const fn requires_layer(self) -> bool {
        matches!(self, Self::Run | Self::Copy | Self::Add)
    }

    /// Instructions whose arguments go through variable substitution.
    pub const fn expands_variables(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Copy
                | Self::Env
                | Self::Expose
                | Self::Label
                | Self::StopSignal
                | Self::User
                | Self::Volume
                | Self::Workdir
                | Self::Arg
        )
    }

    const fn accepts_flags(self) -> bool {
        matches!(self, Self::Run | Self::Copy | Self::Add | Self::Healthcheck)
    }

    const fn accepts_json(self) -> bool {
        matches!(
            self,
            Self::Run
                | Self::Cmd
                | Self::Entrypoint
                | Self::Shell
                | Self::Copy
                | Self::Add
                | Self::Volume
        )
    }
}

/// Sources, destination and flags of a COPY or ADD.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopySpec {
    pub sources: Vec<String>,
    pub dest: String,
    /// Stage name, stage index or image reference
    pub from: Option<String>,
    /// `user[:group]`
    pub chown: Option<String>,
    pub chmod: Option<u32>,
}

/// What backs a `RUN --mount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// A path from the build context, a stage or an image
    Bind,
    /// A directory kept by the store across builds
    Cache,
}

/// One `RUN --mount=type=...,target=...` request.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMount {
    pub kind: MountKind,
    /// Where the mount appears in the container
    pub target: String,
    /// Path inside the mounted source, its root when unset
    pub source: Option<String>,
    /// Stage name, stage index or image reference; the build context when unset
    pub from: Option<String>,
    /// Cache identity, the target when unset
    pub id: Option<String>,
    pub read_only: bool,
}

impl RunMount {
    /// Parse the comma-separated `key=value` list of a `--mount` flag.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |msg: String| BuildError::InvalidInstruction(format!("RUN --mount: {}", msg));
        let mut kind = MountKind::Bind;
        let mut target = None;
        let mut source = None;
        let mut from = None;
        let mut id = None;
        let mut read_only = None;

        for field in value.split(',').filter(|f| !f.is_empty()) {
            let (key, val) = match field.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (field, None),
            };
            let required = || {
                val.filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| invalid(format!("{} needs a value", key)))
            };
            match key {
                "type" => {
                    kind = match val {
                        Some("bind") => MountKind::Bind,
                        Some("cache") => MountKind::Cache,
                        other => {
                            return Err(invalid(format!(
                                "unsupported mount type {:?}",
                                other.unwrap_or("")
                            )))
                        }
                    }
                }
                "target" | "dst" | "destination" => target = Some(required()?),
                "source" | "src" => source = Some(required()?),
                "from" => from = Some(required()?),
                "id" => id = Some(required()?),
                "ro" | "readonly" | "rw" | "readwrite" => {
                    let flag = match val {
                        None | Some("true") => true,
                        Some("false") => false,
                        Some(other) => {
                            return Err(invalid(format!("invalid value {:?} for {}", other, key)))
                        }
                    };
                    let writable = matches!(key, "rw" | "readwrite");
                    read_only = Some(flag != writable);
                }
                _ => return Err(invalid(format!("unknown option {:?}", key))),
            }
        }

        let target = target.ok_or_else(|| invalid("target is required".into()))?;
        if kind == MountKind::Cache && from.is_some() {
            return Err(invalid("from= is only supported for bind mounts".into()));
        }
        Ok(Self {
            kind,
            target,
            source,
            from,
            id,
            read_only: read_only.unwrap_or(kind == MountKind::Bind),
        })
    }
}

/// A resolved instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Run {
        args: Vec<String>,
        shell_form: bool,
        mounts: Vec<RunMount>,
    },
    Copy(CopySpec),
    Add(CopySpec),
    Env(Vec<(String, String)>),
    Label(Vec<(String, String)>),
    Arg(Vec<(String, Option<String>)>),
    Workdir(String),
    User(String),
    Expose(Vec<String>),
    Volume(Vec<String>),
    Entrypoint { args: Vec<String>, shell_form: bool },
    Cmd { args: Vec<String>, shell_form: bool },
    Shell(Vec<String>),
    StopSignal(String),
    Healthcheck(HealthCheck),
    OnBuild(String),
    Maintainer(String),
    Unrecognized(String),
}

impl Instruction {
    pub fn kind(&self) -> InstructionKind {
        match self {
            Instruction::Run { .. } => InstructionKind::Run,
            Instruction::Copy(_) => InstructionKind::Copy,
            Instruction::Add(_) => InstructionKind::Add,
            Instruction::Env(_) => InstructionKind::Env,
            Instruction::Label(_) => InstructionKind::Label,
            Instruction::Arg(_) => InstructionKind::Arg,
            Instruction::Workdir(_) => InstructionKind::Workdir,
            Instruction::User(_) => InstructionKind::User,
            Instruction::Expose(_) => InstructionKind::Expose,
            Instruction::Volume(_) => InstructionKind::Volume,
            Instruction::Entrypoint { .. } => InstructionKind::Entrypoint,
            Instruction::Cmd { .. } => InstructionKind::Cmd,
            Instruction::Shell(_) => InstructionKind::Shell,
            Instruction::StopSignal(_) => InstructionKind::StopSignal,
            Instruction::Healthcheck(_) => InstructionKind::Healthcheck,
            Instruction::OnBuild(_) => InstructionKind::OnBuild,
            Instruction::Maintainer(_) => InstructionKind::Maintainer,
            Instruction::Unrecognized(_) => InstructionKind::Unrecognized,
        }
    }

    pub fn requires_layer(&self) -> bool {
        self.kind().requires_layer()
    }

    /// The COPY/ADD details, if this is one.
    pub fn copy_spec(&self) -> Option<&CopySpec> {
        match self {
            Instruction::Copy(spec) | Instruction::Add(spec) => Some(spec),
            _ => None,
        }
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn parse_json_array(s: &str) -> Result<Vec<String>> {
    serde_json::from_str::<Vec<String>>(s.trim())
        .map_err(|e| BuildError::InvalidInstruction(format!("invalid JSON array {:?}: {}", s, e)))
}
