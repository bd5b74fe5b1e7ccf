//! Naming convention for multiplexed terminal sessions.
//!
//! A managed session is named `berth-{agent}-{id}`. This module is the only
//! place that knows the convention; everything else goes through the
//! encode/decode pair so the format can change without touching call sites.

use super::AgentType;

const SESSION_PREFIX: &str = "berth";

/// Compose the multiplexed session name for an agent type and session id.
pub fn mux_session_name(agent: AgentType, id: &str) -> String {
    format!("{SESSION_PREFIX}-{agent}-{id}")
}

/// Parse a multiplexed session name back into its agent type and session id.
/// Returns None for names this system does not manage.
pub fn parse_mux_name(name: &str) -> Option<(AgentType, String)> {
    let rest = name.strip_prefix(SESSION_PREFIX)?.strip_prefix('-')?;
    // Agent identifiers never contain '-', so the first '-' ends the agent.
    let (agent, id) = rest.split_once('-')?;
    if id.is_empty() {
        return None;
    }
    let agent: AgentType = agent.parse().ok()?;
    Some((agent, id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_agents() {
        for agent in [
            AgentType::Claude,
            AgentType::Codex,
            AgentType::Opencode,
            AgentType::Gemini,
            AgentType::Aider,
            AgentType::Cursor,
            AgentType::Shell,
        ] {
            let name = mux_session_name(agent, "4f2a91c0de3e4b0f8f0a");
            let (parsed_agent, parsed_id) = parse_mux_name(&name).unwrap();
            assert_eq!(parsed_agent, agent);
            assert_eq!(parsed_id, "4f2a91c0de3e4b0f8f0a");
        }
    }

    #[test]
    fn roundtrip_tolerates_dashes_in_id() {
        let name = mux_session_name(AgentType::Shell, "a-b-c");
        assert_eq!(
            parse_mux_name(&name),
            Some((AgentType::Shell, "a-b-c".to_string()))
        );
    }

    #[test]
    fn rejects_foreign_names() {
        assert_eq!(parse_mux_name("main"), None);
        assert_eq!(parse_mux_name("berth"), None);
        assert_eq!(parse_mux_name("berth-"), None);
        assert_eq!(parse_mux_name("berth-claude-"), None);
        assert_eq!(parse_mux_name("berth-copilot-abc"), None);
        assert_eq!(parse_mux_name("mux-claude-abc"), None);
    }
}
