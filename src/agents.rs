//! Built-in coding agent definitions.

use std::collections::HashMap;

use crate::config::ConfigError;

/// Placeholder replaced by the story prompt in an agent's argument template.
pub const PROMPT_PLACEHOLDER: &str = "{{prompt}}";

/// A coding agent CLI that can run a story non-interactively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPlugin {
    pub id: &'static str,
    pub name: &'static str,
    pub command: &'static str,
    /// Arguments for a one-shot run; contains [`PROMPT_PLACEHOLDER`].
    pub print_args: &'static [&'static str],
}

const BUILT_IN_AGENTS: &[AgentPlugin] = &[
    AgentPlugin {
        id: "claude-code",
        name: "Claude Code",
        command: "claude",
        print_args: &["-p", PROMPT_PLACEHOLDER],
    },
    AgentPlugin {
        id: "amp",
        name: "Amp",
        command: "amp",
        print_args: &["--execute", PROMPT_PLACEHOLDER],
    },
    AgentPlugin {
        id: "opencode",
        name: "OpenCode",
        command: "opencode",
        print_args: &["run", PROMPT_PLACEHOLDER],
    },
    AgentPlugin {
        id: "droid",
        name: "Droid",
        command: "droid",
        print_args: &[PROMPT_PLACEHOLDER],
    },
    AgentPlugin {
        id: "codex",
        name: "Codex",
        command: "codex",
        print_args: &["exec", PROMPT_PLACEHOLDER],
    },
    AgentPlugin {
        id: "cursor",
        name: "Cursor Agent",
        command: "agent",
        print_args: &["-p", PROMPT_PLACEHOLDER],
    },
    AgentPlugin {
        id: "continue",
        name: "Continue",
        command: "cn",
        print_args: &["-p", PROMPT_PLACEHOLDER],
    },
    AgentPlugin {
        id: "copilot",
        name: "GitHub Copilot",
        command: "copilot",
        print_args: &[PROMPT_PLACEHOLDER],
    },
];

/// All agents known out of the box.
pub fn built_in_agents() -> &'static [AgentPlugin] {
    BUILT_IN_AGENTS
}

/// Looks up a built-in agent by id.
pub fn find_agent(id: &str) -> Option<&'static AgentPlugin> {
    BUILT_IN_AGENTS.iter().find(|agent| agent.id == id)
}

/// Executable and arguments for one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub executable: String,
    pub args: Vec<String>,
}

/// Builds the command line that runs `agent_id` with `prompt`.
///
/// `overrides` maps agent ids to custom executable paths.
pub fn resolve_invocation(
    agent_id: &str,
    prompt: &str,
    overrides: &HashMap<String, String>,
) -> Result<AgentInvocation, ConfigError> {
    let agent = find_agent(agent_id).ok_or_else(|| ConfigError::UnknownAgent(agent_id.to_string()))?;
    let executable = overrides
        .get(agent_id)
        .filter(|path| !path.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| agent.command.to_string());
    let args = agent
        .print_args
        .iter()
        .map(|arg| arg.replace(PROMPT_PLACEHOLDER, prompt))
        .collect();
    Ok(AgentInvocation { executable, args })
}
