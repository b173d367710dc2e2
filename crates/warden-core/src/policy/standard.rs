//! The standard rule set for filesystem, fetch and command tools.
//!
//! | Rule                     | Decision | Applies to                                     |
//! |--------------------------|----------|------------------------------------------------|
//! | `path_containment`       | deny     | file tools with a path outside the sandbox     |
//! | `write_size_limit`       | deny     | write tools whose content exceeds the limit    |
//! | `destructive_filesystem` | escalate | delete/move tools inside the sandbox           |
//! | `filesystem_access`      | allow    | read/write tools naming a path in the sandbox  |
//! | `domain_allowlist[:srv]` | allow    | fetch tools to an allow-listed domain          |
//! | `unlisted_domain`        | escalate/deny | fetch tools to any other domain (by mode) |
//! | `command_allowlist`      | allow    | exec tools running one allow-listed program    |
//! | `command_not_allowed`    | deny     | other programs, or chained/redirected commands |
//! | `default_deny`           | deny     | everything else                                |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::condition::Condition;
use super::error::PolicyResult;
use super::engine::PolicyEngine;
use super::rule::PolicyRule;

/// How fetches to domains outside the allowlist are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Unlisted domains are escalated to the operator.
    #[default]
    Restrictive,
    /// Unlisted domains are denied outright.
    Locked,
}

/// Whether the domain allowlist is the union across servers or per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainScope {
    #[default]
    Union,
    PerServer,
}

/// Sandbox network policy: allowed domains per tool server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkPolicy {
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(default)]
    pub scope: DomainScope,
    /// Server name → allowed domain patterns (`example.com`, `*.example.com`).
    #[serde(default)]
    pub servers: BTreeMap<String, Vec<String>>,
}

impl NetworkPolicy {
    pub fn with_server<const N: usize>(mut self, server: &str, domains: [&str; N]) -> Self {
        self.servers.insert(
            server.to_string(),
            domains.iter().map(|d| (*d).to_string()).collect(),
        );
        self
    }

    pub fn with_mode(mut self, mode: NetworkMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_scope(mut self, scope: DomainScope) -> Self {
        self.scope = scope;
        self
    }

    /// Union of allowed domains across all servers, sorted and deduplicated.
    pub fn allowed_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.servers.values().flatten().cloned().collect();
        domains.sort();
        domains.dedup();
        domains
    }
}

/// Tool names and limits the standard rule set is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardPolicy {
    pub read_tools: Vec<String>,
    pub write_tools: Vec<String>,
    pub destructive_tools: Vec<String>,
    pub fetch_tools: Vec<String>,
    pub exec_tools: Vec<String>,
    /// Arguments holding filesystem paths.
    pub path_arguments: Vec<String>,
    pub url_argument: String,
    pub command_argument: String,
    pub content_argument: String,
    pub allowed_commands: Vec<String>,
    pub max_write_bytes: usize,
}

impl Default for StandardPolicy {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
        Self {
            read_tools: strings(&[
                "read_file",
                "read_text_file",
                "read_multiple_files",
                "list_directory",
                "directory_tree",
                "search_files",
                "get_file_info",
            ]),
            write_tools: strings(&["write_file", "edit_file", "create_directory"]),
            destructive_tools: strings(&["delete_file", "remove_directory", "move_file"]),
            fetch_tools: strings(&["fetch", "http_get"]),
            exec_tools: strings(&["run_command", "shell"]),
            path_arguments: strings(&["path", "paths", "source", "destination"]),
            url_argument: "url".into(),
            command_argument: "command".into(),
            content_argument: "content".into(),
            allowed_commands: strings(&[
                "ls", "cat", "head", "tail", "grep", "find", "wc", "git", "cargo", "rustc",
            ]),
            max_write_bytes: 1024 * 1024,
        }
    }
}

impl StandardPolicy {
    fn file_tools(&self) -> Vec<String> {
        self.read_tools
            .iter()
            .chain(&self.write_tools)
            .chain(&self.destructive_tools)
            .cloned()
            .collect()
    }
}

/// Build the standard ordered rule list.
pub fn standard_rules(policy: &StandardPolicy, network: &NetworkPolicy) -> Vec<PolicyRule> {
    let mut rules = vec![
        PolicyRule::deny(
            "path_containment",
            Condition::all(vec![
                Condition::ToolIs {
                    tools: policy.file_tools(),
                },
                Condition::PathOutsideSandbox {
                    arguments: policy.path_arguments.clone(),
                },
            ]),
            "Access to paths outside the sandbox root is denied. \
             Use a path inside the workspace; relative paths resolve against the sandbox root.",
        )
        .describe("File tools may only touch paths under the sandbox root"),
        PolicyRule::deny(
            "write_size_limit",
            Condition::all(vec![
                Condition::ToolIs {
                    tools: policy.write_tools.clone(),
                },
                Condition::ArgumentLargerThan {
                    argument: policy.content_argument.clone(),
                    max_bytes: policy.max_write_bytes,
                },
            ]),
            format!(
                "Write content exceeds the {} byte limit. Split the change into smaller writes.",
                policy.max_write_bytes
            ),
        ),
        PolicyRule::escalate(
            "destructive_filesystem",
            Condition::ToolIs {
                tools: policy.destructive_tools.clone(),
            },
            "Deleting or moving files requires operator approval. \
             If approval is refused, leave the file in place or write a new file instead.",
        )
        .describe("Destructive filesystem mutations are escalated to a human"),
        PolicyRule::allow(
            "filesystem_access",
            Condition::all(vec![
                Condition::ToolIs {
                    tools: policy
                        .read_tools
                        .iter()
                        .chain(&policy.write_tools)
                        .cloned()
                        .collect(),
                },
                Condition::PathsInsideSandbox {
                    arguments: policy.path_arguments.clone(),
                },
            ]),
            "File access inside the sandbox root is permitted.",
        ),
    ];

    let fetch_tools = Condition::ToolIs {
        tools: policy.fetch_tools.clone(),
    };
    match network.scope {
        DomainScope::Union => rules.push(PolicyRule::allow(
            "domain_allowlist",
            Condition::all(vec![
                fetch_tools.clone(),
                Condition::DomainAllowed {
                    argument: policy.url_argument.clone(),
                    domains: network.allowed_domains(),
                },
            ]),
            "Network access to an allow-listed domain is permitted.",
        )),
        DomainScope::PerServer => {
            for (server, domains) in &network.servers {
                rules.push(PolicyRule::allow(
                    format!("domain_allowlist:{server}"),
                    Condition::all(vec![
                        fetch_tools.clone(),
                        Condition::ServerIs {
                            servers: vec![server.clone()],
                        },
                        Condition::DomainAllowed {
                            argument: policy.url_argument.clone(),
                            domains: domains.clone(),
                        },
                    ]),
                    format!("Network access to a domain allow-listed for {server} is permitted."),
                ));
            }
        }
    }

    let allowed = network.allowed_domains();
    let listed = if allowed.is_empty() {
        "none are configured".to_string()
    } else {
        allowed.join(", ")
    };
    let unlisted = Condition::all(vec![
        fetch_tools,
        Condition::ArgumentPresent {
            argument: policy.url_argument.clone(),
        },
    ]);
    rules.push(match network.mode {
        NetworkMode::Restrictive => PolicyRule::escalate(
            "unlisted_domain",
            unlisted,
            format!(
                "This domain is not on the network allowlist and needs operator approval. \
                 Allowed domains: {listed}."
            ),
        ),
        NetworkMode::Locked => PolicyRule::deny(
            "unlisted_domain",
            unlisted,
            format!(
                "Network access to this domain is not allowed. \
                 Use one of the allowed domains: {listed}."
            ),
        ),
    });

    let exec_tools = Condition::ToolIs {
        tools: policy.exec_tools.clone(),
    };
    rules.push(PolicyRule::allow(
        "command_allowlist",
        Condition::all(vec![
            exec_tools.clone(),
            Condition::CommandAllowed {
                argument: policy.command_argument.clone(),
                commands: policy.allowed_commands.clone(),
            },
        ]),
        "The command is on the allowlist.",
    ));
    rules.push(PolicyRule::deny(
        "command_not_allowed",
        exec_tools,
        format!(
            "This command is not allowed. Run a single allow-listed program per call, \
             without shell operators (; | & ` $( > <) or line breaks. Allowed programs: {}.",
            policy.allowed_commands.join(", ")
        ),
    ));

    rules
}

/// Convenience: a validated engine over [`standard_rules`].
pub fn standard_engine(
    policy: &StandardPolicy,
    network: &NetworkPolicy,
) -> PolicyResult<PolicyEngine> {
    PolicyEngine::new(standard_rules(policy, network))
}
