//! Rule conditions: a small, serializable predicate language.
//!
//! Every condition is a function of the request and the sandbox root, so a
//! rule set can be printed, diffed and unit tested as plain data. Path
//! conditions also consult the filesystem to follow symlinks.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::canonical_json;
use crate::request::ToolCallRequest;

/// Predicate over `(request, sandbox_root)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Always holds. Used by catch-all rules.
    Always,
    /// Tool name is one of `tools`.
    ToolIs { tools: Vec<String> },
    /// Server name is one of `servers`.
    ServerIs { servers: Vec<String> },
    /// The named argument is present (any value, including null).
    ArgumentPresent { argument: String },
    /// Any of the named path arguments resolves outside the sandbox root.
    /// Arrays are checked element-wise; other non-string values count as outside.
    PathOutsideSandbox { arguments: Vec<String> },
    /// At least one of the named path arguments is present and every present
    /// one resolves inside the sandbox root.
    PathsInsideSandbox { arguments: Vec<String> },
    /// The URL/domain argument's host matches an allowlist entry.
    DomainAllowed { argument: String, domains: Vec<String> },
    /// The URL/domain argument is present and its host matches no entry.
    /// Unparseable hosts count as not allowed.
    DomainNotAllowed { argument: String, domains: Vec<String> },
    /// The command argument's program is in `commands` and a string command
    /// contains no shell control syntax.
    CommandAllowed { argument: String, commands: Vec<String> },
    /// The command argument is present and fails [`Condition::CommandAllowed`].
    CommandNotAllowed { argument: String, commands: Vec<String> },
    /// The argument's size in bytes exceeds `max_bytes` (strings by length,
    /// other values by canonical JSON length).
    ArgumentLargerThan { argument: String, max_bytes: usize },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn tool_is<const N: usize>(tools: [&str; N]) -> Self {
        Condition::ToolIs {
            tools: tools.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::All { conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Any { conditions }
    }

    pub fn negate(condition: Condition) -> Self {
        Condition::Not {
            condition: Box::new(condition),
        }
    }

    /// Returns `true` if this is an unconditional match.
    pub fn is_unconditional(&self) -> bool {
        matches!(self, Condition::Always)
    }

    /// Evaluate the predicate.
    pub fn holds(&self, request: &ToolCallRequest, sandbox_root: &Path) -> bool {
        match self {
            Condition::Always => true,
            Condition::ToolIs { tools } => tools.iter().any(|t| *t == request.tool_name),
            Condition::ServerIs { servers } => servers.iter().any(|s| *s == request.server_name),
            Condition::ArgumentPresent { argument } => request.argument(argument).is_some(),
            Condition::PathOutsideSandbox { arguments } => arguments.iter().any(|name| {
                request
                    .argument(name)
                    .is_some_and(|value| path_value_outside(sandbox_root, value))
            }),
            Condition::PathsInsideSandbox { arguments } => {
                let mut present = arguments
                    .iter()
                    .filter_map(|name| request.argument(name))
                    .peekable();
                present.peek().is_some()
                    && present.all(|value| !path_value_outside(sandbox_root, value))
            }
            Condition::DomainAllowed { argument, domains } => request
                .argument_str(argument)
                .and_then(extract_host)
                .is_some_and(|host| domains.iter().any(|d| domain_matches(&host, d))),
            Condition::DomainNotAllowed { argument, domains } => {
                match request.argument(argument) {
                    None => false,
                    Some(value) => !value
                        .as_str()
                        .and_then(extract_host)
                        .is_some_and(|host| domains.iter().any(|d| domain_matches(&host, d))),
                }
            }
            Condition::CommandAllowed { argument, commands } => request
                .argument(argument)
                .is_some_and(|value| command_allowed(value, commands)),
            Condition::CommandNotAllowed { argument, commands } => request
                .argument(argument)
                .is_some_and(|value| !command_allowed(value, commands)),
            Condition::ArgumentLargerThan {
                argument,
                max_bytes,
            } => request
                .argument(argument)
                .is_some_and(|value| argument_size(value) > *max_bytes),
            Condition::All { conditions } => {
                conditions.iter().all(|c| c.holds(request, sandbox_root))
            }
            Condition::Any { conditions } => {
                conditions.iter().any(|c| c.holds(request, sandbox_root))
            }
            Condition::Not { condition } => !condition.holds(request, sandbox_root),
        }
    }
}

/// Lexically normalize a path: collapse `.` and `..` without touching the
/// filesystem. `..` at the root stays at the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Resolve a path the way the OS would open it: the longest existing
/// ancestor is canonicalized (following symlinks) and the parts that do not
/// exist yet are re-appended and collapsed lexically.
///
/// `None` when a dangling symlink sits on the path, since creating through it
/// would land wherever its target points.
pub fn resolve_path(path: &Path) -> Option<PathBuf> {
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        match std::fs::canonicalize(ancestor) {
            Ok(real) => {
                let rest = path.strip_prefix(ancestor).ok()?;
                return Some(normalize_path(&real.join(rest)));
            }
            Err(_) if is_symlink(ancestor) => return None,
            Err(_) => {}
        }
    }
    Some(normalize_path(path))
}

/// Resolve `raw` against the sandbox root. Relative paths join onto the root.
pub fn resolve_in_sandbox(sandbox_root: &Path, raw: &str) -> Option<PathBuf> {
    let raw = raw.strip_prefix("file://").unwrap_or(raw);
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        resolve_path(candidate)
    } else {
        resolve_path(&sandbox_root.join(candidate))
    }
}

/// Returns `true` if `raw` resolves to the sandbox root or a path beneath it,
/// after symlinks on both sides are followed.
pub fn is_inside_sandbox(sandbox_root: &Path, raw: &str) -> bool {
    let Some(root) = resolve_path(sandbox_root) else {
        return false;
    };
    resolve_in_sandbox(sandbox_root, raw).is_some_and(|path| path.starts_with(&root))
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_symlink())
}

/// Extract the lowercase host from a URL, or accept a bare domain.
pub fn extract_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = url::Url::parse(raw)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| url::Url::parse(&format!("https://{raw}")).ok())?;
    parsed
        .host_str()
        .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
        .filter(|h| !h.is_empty())
}

/// Check if a domain matches an allowlist pattern (case-insensitive).
///
/// Supports exact match and wildcard prefix (`*.example.com` matches
/// `api.example.com` but not `example.com` itself).
pub fn domain_matches(domain: &str, pattern: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    let pattern = pattern.trim().to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix('*') {
        domain.ends_with(suffix)
    } else {
        domain == pattern
    }
}

/// The program name of a command argument: the first whitespace-separated
/// word of a string, or the first element of an argv array, reduced to its
/// basename.
pub fn command_program(value: &Value) -> Option<String> {
    let first = match value {
        Value::String(command) => command.split_whitespace().next()?,
        Value::Array(argv) => argv.first()?.as_str()?,
        _ => return None,
    };
    let program = Path::new(first).file_name()?.to_str()?;
    Some(program.to_string())
}

/// Shell syntax that chains, substitutes or redirects commands.
const SHELL_CONTROL: &[&str] = &[";", "|", "&", "`", "$(", ">", "<", "\n", "\r"];

/// Returns `true` if `command` would do more than run one program when
/// handed to a shell.
pub fn has_shell_control(command: &str) -> bool {
    SHELL_CONTROL.iter().any(|token| command.contains(token))
}

fn command_allowed(value: &Value, commands: &[String]) -> bool {
    if value.as_str().is_some_and(has_shell_control) {
        return false;
    }
    command_program(value).is_some_and(|program| commands.iter().any(|c| *c == program))
}

// Arrays of paths are outside if any element is.
fn path_value_outside(sandbox_root: &Path, value: &Value) -> bool {
    match value {
        Value::String(raw) => !is_inside_sandbox(sandbox_root, raw),
        Value::Array(items) => items
            .iter()
            .any(|item| path_value_outside(sandbox_root, item)),
        _ => true,
    }
}

fn argument_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        other => canonical_json(other).len(),
    }
}
