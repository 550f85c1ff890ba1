//! Build the argv and environment for each agent CLI. The claude CLI accepts a
//! caller-chosen conversation id on creation and resumes by id; the copilot CLI
//! only resumes by id (creation ids are discovered from its state directory).

use std::path::Path;

use portable_pty::CommandBuilder;

use super::AgentKind;

/// True when the deployment asked for permission prompts to be bypassed
/// (container deployments where every action is already sandboxed).
pub fn docker_mode() -> bool {
    std::env::var("DOCKER_MODE").is_ok_and(|v| !v.is_empty())
}

/// Argv for an agent start. `resume` only takes effect when a conversation id
/// is known; otherwise the start falls back to creating a new conversation.
pub fn argv_for_agent(
    agent: AgentKind,
    session_id: &str,
    conversation_id: Option<&str>,
    prompt: Option<&str>,
    resume: bool,
    docker: bool,
) -> Vec<String> {
    let mut argv: Vec<String> = vec![agent.as_str().to_string()];
    match agent {
        AgentKind::Claude => {
            if let Some(p) = prompt.filter(|p| !p.is_empty()) {
                argv.push(p.to_string());
            }
            match conversation_id.filter(|_| resume) {
                Some(conv) => {
                    argv.push("--resume".into());
                    argv.push(conv.to_string());
                }
                None => {
                    argv.push("--session-id".into());
                    argv.push(session_id.to_string());
                }
            }
            if docker {
                argv.push("--dangerously-skip-permissions".into());
            }
        }
        AgentKind::Copilot => {
            if let Some(p) = prompt.filter(|p| !p.is_empty()) {
                argv.push("-p".into());
                argv.push(p.to_string());
            }
            if let Some(conv) = conversation_id.filter(|_| resume) {
                argv.push("--resume".into());
                argv.push(conv.to_string());
            }
            if docker {
                argv.push("--allow-all-tools".into());
            }
        }
    }
    argv
}

/// CommandBuilder for an agent start: argv from [`argv_for_agent`], cwd set to
/// the workspace, parent env inherited with the terminal vars forced.
pub fn command_for_agent(
    agent: AgentKind,
    workspace_path: &Path,
    session_id: &str,
    conversation_id: Option<&str>,
    prompt: Option<&str>,
    resume: bool,
    docker: bool,
) -> CommandBuilder {
    let argv = argv_for_agent(agent, session_id, conversation_id, prompt, resume, docker);
    let mut cmd = CommandBuilder::new(&argv[0]);
    for a in &argv[1..] {
        cmd.arg(a);
    }
    cmd.cwd(workspace_path);
    cmd.env("TERM", "xterm-256color");
    cmd.env("FORCE_COLOR", "1");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_first_start_uses_session_id_flag() {
        let argv = argv_for_agent(AgentKind::Claude, "uuid-1", None, Some("hello"), false, false);
        assert_eq!(
            argv,
            vec!["claude", "hello", "--session-id", "uuid-1"]
        );
    }

    #[test]
    fn claude_resume_uses_stored_conversation_id() {
        let argv = argv_for_agent(
            AgentKind::Claude,
            "uuid-1",
            Some("conv-9"),
            None,
            true,
            false,
        );
        assert_eq!(argv, vec!["claude", "--resume", "conv-9"]);
    }

    #[test]
    fn claude_resume_without_conversation_falls_back_to_create() {
        let argv = argv_for_agent(AgentKind::Claude, "uuid-1", None, None, true, false);
        assert_eq!(argv, vec!["claude", "--session-id", "uuid-1"]);
    }

    #[test]
    fn copilot_never_passes_our_session_id() {
        let argv = argv_for_agent(AgentKind::Copilot, "uuid-1", None, Some("fix it"), false, false);
        assert_eq!(argv, vec!["copilot", "-p", "fix it"]);
    }

    #[test]
    fn copilot_resume_by_discovered_id() {
        let argv = argv_for_agent(AgentKind::Copilot, "uuid-1", Some("z"), None, true, false);
        assert_eq!(argv, vec!["copilot", "--resume", "z"]);
    }

    #[test]
    fn docker_mode_appends_permission_bypass() {
        let claude = argv_for_agent(AgentKind::Claude, "u", None, None, false, true);
        assert_eq!(claude.last().unwrap(), "--dangerously-skip-permissions");
        let copilot = argv_for_agent(AgentKind::Copilot, "u", None, None, false, true);
        assert_eq!(copilot.last().unwrap(), "--allow-all-tools");
    }
}
