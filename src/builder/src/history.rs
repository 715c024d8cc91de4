//! Canonical history strings and history comparison.
//!
//! The `created_by` value written for each instruction is also the key the
//! layer cache matches on, so both sides come from [`created_by`].

use crate::args::BuildArgSet;
use crate::image::{HistoryEntry, ImageConfig};
use crate::stage::{InstructionKind, Step};

/// `created_by` for commits that correspond to no instruction.
pub const BASE_CREATED_BY: &str = "/bin/sh";

/// Field-for-field comparison of two history entries.
pub fn entries_equal(base: &HistoryEntry, derived: &HistoryEntry) -> bool {
    base.created_by == derived.created_by
        && base.comment == derived.comment
        && base.author == derived.author
        && base.empty_layer == derived.empty_layer
        && base.created == derived.created
}

/// Canonical `created_by` for `step`.
///
/// `content_summary` is the digest summary of what a COPY/ADD adds, or of
/// what a RUN bind-mounts.
pub fn created_by(
    step: &Step,
    content_summary: Option<&str>,
    args: &BuildArgSet,
    config: &ImageConfig,
) -> String {
    match step.kind() {
        InstructionKind::Arg => format!("/bin/sh -c #(nop) ARG {}", args.history_key()),
        InstructionKind::Run => {
            let command = step.original_args();
            let resolved = args.resolved_for_run(config);
            let mut text = if resolved.is_empty() {
                format!("/bin/sh -c {}", command)
            } else {
                format!(
                    "|{} {} /bin/sh -c {}",
                    resolved.len(),
                    resolved.join(" "),
                    command
                )
            };
            if let Some(summary) = content_summary {
                text.push_str(" # mounts ");
                text.push_str(summary);
            }
            text
        }
        InstructionKind::Copy | InstructionKind::Add => {
            let dest = step.args.last().map(String::as_str).unwrap_or("");
            format!(
                "/bin/sh -c #(nop) {} {} in {} ",
                step.command.to_uppercase(),
                content_summary.unwrap_or(""),
                dest
            )
        }
        _ => format!("/bin/sh -c #(nop) {}", step.original),
    }
}
