//! Static delegation tree for the Miya agent roster.
//!
//! Only the task manager sits at the root. A handful of agents may hand work
//! to code search, everything else is a leaf.

use miya_types::ToolPermissions;

pub const TASK_MANAGER_AGENT: &str = "1-task-manager";
pub const CODE_SEARCH_AGENT: &str = "2-code-search";
pub const DOCS_HELPER_AGENT: &str = "3-docs-helper";
pub const ARCHITECTURE_ADVISOR_AGENT: &str = "4-architecture-advisor";
pub const CODE_FIXER_AGENT: &str = "5-code-fixer";
pub const UI_DESIGNER_AGENT: &str = "6-ui-designer";
pub const CODE_SIMPLICITY_REVIEWER_AGENT: &str = "7-code-simplicity-reviewer";

/// Agent assumed for sessions the manager never created.
pub const ROOT_AGENT: &str = TASK_MANAGER_AGENT;

const TASK_MANAGER_CHILDREN: &[&str] = &[
    CODE_SEARCH_AGENT,
    DOCS_HELPER_AGENT,
    ARCHITECTURE_ADVISOR_AGENT,
    CODE_FIXER_AGENT,
    UI_DESIGNER_AGENT,
];
const SEARCH_ONLY: &[&str] = &[CODE_SEARCH_AGENT];
const LEAF: &[&str] = &[];

/// Legacy names still accepted from older configs and prompts.
const AGENT_ALIASES: &[(&str, &str)] = &[
    ("orchestrator", TASK_MANAGER_AGENT),
    ("explorer", CODE_SEARCH_AGENT),
    ("explore", CODE_SEARCH_AGENT),
    ("librarian", DOCS_HELPER_AGENT),
    ("oracle", ARCHITECTURE_ADVISOR_AGENT),
    ("fixer", CODE_FIXER_AGENT),
    ("4-code-fixer", CODE_FIXER_AGENT),
    ("designer", UI_DESIGNER_AGENT),
    ("frontend-ui-ux-engineer", UI_DESIGNER_AGENT),
    ("code-simplicity-reviewer", CODE_SIMPLICITY_REVIEWER_AGENT),
    ("simplicity_reviewer", CODE_SIMPLICITY_REVIEWER_AGENT),
];

pub fn canonical_agent_name(name: &str) -> &str {
    let trimmed = name.trim();
    AGENT_ALIASES
        .iter()
        .find(|(alias, _)| *alias == trimmed)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(trimmed)
}

/// Keys under which per-agent config may be stored: the name as given, its
/// canonical form, then every legacy alias of that canonical form.
pub fn agent_config_keys(name: &str) -> Vec<&str> {
    let canonical = canonical_agent_name(name);
    let mut keys = vec![name, canonical];
    keys.extend(
        AGENT_ALIASES
            .iter()
            .filter(|(_, target)| *target == canonical)
            .map(|(alias, _)| *alias),
    );
    let mut seen = Vec::with_capacity(keys.len());
    keys.retain(|key| {
        if seen.contains(key) {
            false
        } else {
            seen.push(*key);
            true
        }
    });
    keys
}

pub fn allowed_subagents(agent: &str) -> &'static [&'static str] {
    match canonical_agent_name(agent) {
        TASK_MANAGER_AGENT => TASK_MANAGER_CHILDREN,
        CODE_SEARCH_AGENT
        | DOCS_HELPER_AGENT
        | ARCHITECTURE_ADVISOR_AGENT
        | CODE_SIMPLICITY_REVIEWER_AGENT => LEAF,
        CODE_FIXER_AGENT | UI_DESIGNER_AGENT => SEARCH_ONLY,
        // unknown agents may still look things up
        _ => SEARCH_ONLY,
    }
}

pub fn can_delegate(agent: &str) -> bool {
    !allowed_subagents(agent).is_empty()
}

pub fn is_delegation_allowed(parent_agent: &str, candidate: &str) -> bool {
    let candidate = canonical_agent_name(candidate);
    allowed_subagents(parent_agent).contains(&candidate)
}

/// Tool switches injected into the first prompt of a spawned session.
pub fn tool_permissions_for(agent: &str) -> ToolPermissions {
    ToolPermissions::for_delegation(can_delegate(agent))
}
