//! Per-instruction handlers.
//!
//! Handlers apply an instruction's effect on the image configuration and
//! build arguments. Whatever must touch the container filesystem is
//! returned as an [`Effect`] for the stage runner to carry out.

use kiln_core::error::{BuildError, Result};

use crate::args::BuildArgSet;
use crate::image::ImageConfig;
use crate::securepath::clean;
use crate::stage::{CopySpec, Instruction, InstructionKind, RunMount};

/// Filesystem work left for the stage runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    /// Execute this argv in the container
    Run {
        argv: Vec<String>,
        mounts: Vec<RunMount>,
    },
    Copy { spec: CopySpec, add: bool },
    /// Newly declared volumes
    Volumes(Vec<String>),
}

/// State a handler may change.
pub struct DispatchContext<'a> {
    pub config: &'a mut ImageConfig,
    pub args: &'a mut BuildArgSet,
    pub ignore_unrecognized: bool,
}

pub type Handler = fn(&mut DispatchContext<'_>, Instruction) -> Result<Effect>;

/// Handler for an instruction kind.
pub fn handler(kind: InstructionKind) -> Handler {
    match kind {
        InstructionKind::Run => run,
        InstructionKind::Copy | InstructionKind::Add => copy,
        InstructionKind::Env => env,
        InstructionKind::Label => label,
        InstructionKind::Arg => arg,
        InstructionKind::Workdir => workdir,
        InstructionKind::User => user,
        InstructionKind::Expose => expose,
        InstructionKind::Volume => volume,
        InstructionKind::Entrypoint | InstructionKind::Cmd => command,
        InstructionKind::Shell => shell,
        InstructionKind::StopSignal => stop_signal,
        InstructionKind::Healthcheck => healthcheck,
        InstructionKind::OnBuild => on_build,
        InstructionKind::Maintainer => maintainer,
        InstructionKind::Unrecognized => unrecognized,
    }
}

/// Apply `instruction` through its handler.
pub fn dispatch(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    handler(instruction.kind())(ctx, instruction)
}

fn mismatch(expected: &str) -> BuildError {
    BuildError::Other(format!("handler for {} got another instruction", expected))
}

fn with_shell(config: &ImageConfig, args: Vec<String>, shell_form: bool) -> Vec<String> {
    if shell_form {
        let mut argv = config.shell();
        argv.extend(args);
        argv
    } else {
        args
    }
}

fn run(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Run {
        args,
        shell_form,
        mounts,
    } = instruction
    else {
        return Err(mismatch("RUN"));
    };
    Ok(Effect::Run {
        argv: with_shell(ctx.config, args, shell_form),
        mounts,
    })
}

fn copy(_ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    match instruction {
        Instruction::Copy(spec) => Ok(Effect::Copy { spec, add: false }),
        Instruction::Add(spec) => Ok(Effect::Copy { spec, add: true }),
        _ => Err(mismatch("COPY/ADD")),
    }
}

fn env(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Env(pairs) = instruction else {
        return Err(mismatch("ENV"));
    };
    for (key, value) in pairs {
        ctx.config.env_set(&key, &value);
    }
    Ok(Effect::None)
}

fn label(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Label(pairs) = instruction else {
        return Err(mismatch("LABEL"));
    };
    ctx.config.labels.extend(pairs);
    Ok(Effect::None)
}

fn arg(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Arg(decls) = instruction else {
        return Err(mismatch("ARG"));
    };
    for (name, default) in decls {
        ctx.args.declare(&name, default);
    }
    Ok(Effect::None)
}

fn workdir(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Workdir(path) = instruction else {
        return Err(mismatch("WORKDIR"));
    };
    let path = if path.starts_with('/') {
        clean(&path)
    } else {
        clean(&format!("{}/{}", ctx.config.workdir(), path))
    };
    ctx.config.working_dir = Some(path);
    Ok(Effect::None)
}

fn user(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::User(user) = instruction else {
        return Err(mismatch("USER"));
    };
    ctx.config.user = Some(user);
    Ok(Effect::None)
}

fn expose(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Expose(ports) = instruction else {
        return Err(mismatch("EXPOSE"));
    };
    for port in ports {
        let port = if port.contains('/') {
            port
        } else {
            format!("{}/tcp", port)
        };
        ctx.config.exposed_ports.insert(port);
    }
    Ok(Effect::None)
}

fn volume(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Volume(paths) = instruction else {
        return Err(mismatch("VOLUME"));
    };
    let mut added = Vec::new();
    for path in paths {
        if path.trim().is_empty() {
            return Err(BuildError::InvalidInstruction(
                "VOLUME specified can not be an empty string".into(),
            ));
        }
        ctx.config.volumes.insert(path.clone());
        added.push(path);
    }
    Ok(Effect::Volumes(added))
}

fn command(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    match instruction {
        Instruction::Entrypoint { args, shell_form } => {
            ctx.config.entrypoint = Some(with_shell(ctx.config, args, shell_form));
            // A new entrypoint drops the inherited command.
            ctx.config.cmd = None;
        }
        Instruction::Cmd { args, shell_form } => {
            ctx.config.cmd = Some(with_shell(ctx.config, args, shell_form));
        }
        _ => return Err(mismatch("ENTRYPOINT/CMD")),
    }
    Ok(Effect::None)
}

fn shell(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Shell(argv) = instruction else {
        return Err(mismatch("SHELL"));
    };
    ctx.config.shell = Some(argv);
    Ok(Effect::None)
}

fn stop_signal(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::StopSignal(signal) = instruction else {
        return Err(mismatch("STOPSIGNAL"));
    };
    ctx.config.stop_signal = Some(signal);
    Ok(Effect::None)
}

fn healthcheck(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Healthcheck(check) = instruction else {
        return Err(mismatch("HEALTHCHECK"));
    };
    ctx.config.healthcheck = Some(check);
    Ok(Effect::None)
}

fn on_build(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::OnBuild(trigger) = instruction else {
        return Err(mismatch("ONBUILD"));
    };
    ctx.config.on_build.push(trigger);
    Ok(Effect::None)
}

fn maintainer(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Maintainer(author) = instruction else {
        return Err(mismatch("MAINTAINER"));
    };
    ctx.config.author = Some(author);
    Ok(Effect::None)
}

fn unrecognized(ctx: &mut DispatchContext<'_>, instruction: Instruction) -> Result<Effect> {
    let Instruction::Unrecognized(original) = instruction else {
        return Err(mismatch("unrecognized"));
    };
    if ctx.ignore_unrecognized {
        tracing::warn!(instruction = %original, "Ignoring unrecognized instruction");
        Ok(Effect::None)
    } else {
        Err(BuildError::UnknownInstruction(original))
    }
}
