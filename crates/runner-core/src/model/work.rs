//! `NodeSpec` and the `WorkSpec` tagged union (§3, §9 "tagged variants").

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ids::ProducerId;

/// A closed tagged union describing one unit of runnable work. Validators
/// must reject unknown tags (§9) -- `serde`'s internally-tagged enum with
/// `deny_unknown_fields` on each variant enforces this at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum WorkSpec {
    /// Direct process spawn, no shell interpolation.
    Process { executable: String, #[serde(default)] args: Vec<String> },

    /// Shell-mediated invocation.
    Shell { command: String, shell: Shell },

    /// Opaque AI delegate. The runner treats the child process as an
    /// opaque command with stdio, PID, exit code, and an optional session
    /// identifier -- it does not interpret the agent's output.
    Agent {
        instructions: String,
        #[serde(default, rename = "maxTurns")]
        max_turns: Option<u32>,
        #[serde(default, rename = "allowedFolders")]
        allowed_folders: Vec<String>,
        #[serde(default, rename = "allowedUrls")]
        allowed_urls: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shell {
    Cmd,
    Powershell,
    Pwsh,
    Bash,
    Sh,
}

/// Optional per-node failure policy override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct FailurePolicy {
    pub no_auto_heal: bool,
    pub resume_from_phase: Option<String>,
}

/// Declarative unit of work (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeSpec {
    pub producer_id: ProducerId,
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<ProducerId>,
    pub work: WorkSpec,
    #[serde(default)]
    pub prechecks: Option<WorkSpec>,
    #[serde(default)]
    pub postchecks: Option<WorkSpec>,
    #[serde(default)]
    pub expects_no_changes: bool,
    #[serde(default)]
    pub on_failure: Option<FailurePolicy>,
}

/// Field size bounds from §6.1.
pub const MAX_TASK_LEN: usize = 5_000;
pub const MAX_INSTRUCTIONS_LEN: usize = 100_000;
