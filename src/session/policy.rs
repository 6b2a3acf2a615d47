//! Policy evaluation: device-group membership, permission collection, and
//! the wildcard resource matcher.

use std::collections::HashMap;

use std::sync::Arc;

use crate::config::DeviceGroup;
use crate::error::{Error, Result};
use crate::metrics::{Counter, MetricsSink, NoopMetricsSink};
use crate::session::manager::Session;

/// A compiled policy rule: one `(principal, operation, resource)` grant
/// collected from a device group's policies, with resource template
/// variables already substituted from the session's attributes.
#[derive(Debug, Clone)]
pub struct Permission {
    /// `*` (the session's own identity) or a specific principal name.
    pub principal: String,
    /// `service:action`, possibly `service:*` or `*`.
    pub operation_pattern: String,
    /// `service:type:name`, possibly containing `*`/`?` wildcards, with
    /// `${iot:...}` and custom policy variables already resolved.
    pub resource_pattern: String,
}

/// An `operation` string split into its `service:action` parts.
pub struct ParsedOperation<'a> {
    pub service: &'a str,
    pub action: &'a str,
}

impl<'a> ParsedOperation<'a> {
    /// Parse `service:action`: both parts non-empty, `service` entirely
    /// alphabetic, `action` alphanumeric plus `-`/`_`.
    pub fn parse(operation: &'a str) -> Option<Self> {
        let (service, action) = operation.split_once(':')?;
        if service.is_empty() || action.is_empty() {
            return None;
        }
        if !service.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        if !action.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return None;
        }
        Some(Self { service, action })
    }
}

/// A `resource` string split into its `service:type:name` parts.
pub struct ParsedResource<'a> {
    pub service: &'a str,
    pub resource_type: &'a str,
    pub name: &'a str,
}

impl<'a> ParsedResource<'a> {
    /// Parse `service:type:name`: all three parts non-empty, `name`
    /// matching the same character class as a Thing name.
    pub fn parse(resource: &'a str) -> Option<Self> {
        let mut parts = resource.splitn(3, ':');
        let service = parts.next()?;
        let resource_type = parts.next()?;
        let name = parts.next()?;
        if service.is_empty() || resource_type.is_empty() || name.is_empty() {
            return None;
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-' || c == '/') {
            return None;
        }
        Some(Self { service, resource_type, name })
    }
}

/// Glob-style match supporting `*` (any run of characters, including
/// none) and `?` (exactly one character), via a dynamic-programming table
/// over `pattern`/`value` positions rather than backtracking character by
/// character.
pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let mut dp = vec![vec![false; value.len() + 1]; pattern.len() + 1];
    dp[0][0] = true;
    for i in 1..=pattern.len() {
        if pattern[i - 1] == '*' {
            dp[i][0] = dp[i - 1][0];
        }
    }
    for i in 1..=pattern.len() {
        for j in 1..=value.len() {
            dp[i][j] = match pattern[i - 1] {
                '*' => dp[i - 1][j] || dp[i][j - 1],
                '?' => dp[i - 1][j - 1],
                c => dp[i - 1][j - 1] && c == value[j - 1],
            };
        }
    }
    dp[pattern.len()][value.len()]
}

fn operation_matches(pattern: &str, operation: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(service) = pattern.strip_suffix(":*") {
        return operation.split_once(':').map(|(s, _)| s == service).unwrap_or(false);
    }
    pattern == operation
}

fn principal_matches(pattern: &str, session: &Session) -> bool {
    if pattern == "*" {
        return true;
    }
    session.attribute("Thing.ThingName") == Some(pattern) || session.attribute("CertificateId") == Some(pattern)
}

/// Substitute `${iot:Connection.Thing.ThingName}`-style and custom
/// policy-variable placeholders in a resource template. An unresolvable
/// placeholder is left as the literal `${...}` text, which then simply
/// fails to match any real resource.
fn substitute_variables(template: &str, policy_variables: &HashMap<String, String>, session: &Session) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = &after[..end];
        let resolved = resolve_variable(name, policy_variables, session);
        out.push_str(&resolved.unwrap_or_else(|| format!("${{{name}}}")));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve_variable(name: &str, policy_variables: &HashMap<String, String>, session: &Session) -> Option<String> {
    match name {
        "iot:Connection.Thing.ThingName" => session.attribute("Thing.ThingName").map(str::to_string),
        "iot:Connection.Thing.CertificateId" => session.attribute("CertificateId").map(str::to_string),
        other => policy_variables.get(other).cloned(),
    }
}

/// Evaluates which device groups a session belongs to and compiles their
/// policies into `Permission`s.
pub struct GroupManager {
    groups: HashMap<String, DeviceGroup>,
}

impl GroupManager {
    /// Build a group manager from the configured device-group tree.
    pub fn new(groups: HashMap<String, DeviceGroup>) -> Self {
        Self { groups }
    }

    /// Every permission granted by groups whose selection rule matches
    /// `session`, with resource templates already substituted.
    pub fn applicable_permissions(&self, session: &Session) -> Vec<Permission> {
        let mut permissions = Vec::new();
        for group in self.groups.values() {
            if !Self::selection_rule_matches(&group.selection_rule, session) {
                continue;
            }
            for policy in group.policies.values() {
                for principal in &policy.principals {
                    for operation in &policy.operations {
                        for resource in &policy.resources {
                            let resource_pattern = substitute_variables(resource, &policy.policy_variables, session);
                            permissions.push(Permission {
                                principal: principal.clone(),
                                operation_pattern: operation.clone(),
                                resource_pattern,
                            });
                        }
                    }
                }
            }
        }
        permissions
    }

    /// Evaluate a `"<attribute>: MATCHES_EXPRESSION: \"<pattern>\""`
    /// selection rule against the session's attributes.
    fn selection_rule_matches(rule: &str, session: &Session) -> bool {
        let mut parts = rule.splitn(3, ':');
        let Some(attribute) = parts.next().map(str::trim) else { return false };
        let Some(operator) = parts.next().map(str::trim) else { return false };
        let Some(pattern) = parts.next().map(str::trim) else { return false };
        if operator != "MATCHES_EXPRESSION" {
            return false;
        }
        let pattern = pattern.trim_matches('"');
        match session.attribute(attribute) {
            Some(value) => wildcard_matches(pattern, value),
            None => false,
        }
    }
}

/// Authorizes `(operation, resource)` requests against a session's
/// applicable permissions. The pseudo-session and component credentials
/// always authorize; otherwise the first matching permission wins and
/// there is no explicit deny.
pub struct PolicyEvaluator {
    group_manager: GroupManager,
    metrics: Arc<dyn MetricsSink>,
}

impl PolicyEvaluator {
    /// Construct an evaluator over `group_manager`. Reports to a no-op
    /// metrics sink; use `with_metrics` to wire in a real one.
    pub fn new(group_manager: GroupManager) -> Self {
        Self::with_metrics(group_manager, Arc::new(NoopMetricsSink))
    }

    /// Same as `new`, reporting authorization outcomes to `metrics`.
    pub fn with_metrics(group_manager: GroupManager, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { group_manager, metrics }
    }

    /// Authorize `operation` against `resource` for `session`.
    pub fn authorize(&self, session: &Session, operation: &str, resource: &str) -> Result<bool> {
        if session.is_allow_all() || session.is_component() {
            self.metrics.increment(Counter::AuthorizationGranted);
            return Ok(true);
        }

        let Some(parsed_operation) = ParsedOperation::parse(operation) else {
            tracing::warn!(operation, "authorize: malformed operation");
            self.metrics.increment(Counter::AuthorizationDenied);
            return Ok(false);
        };
        let Some(parsed_resource) = ParsedResource::parse(resource) else {
            tracing::warn!(resource, "authorize: malformed resource");
            self.metrics.increment(Counter::AuthorizationDenied);
            return Ok(false);
        };
        if parsed_operation.service != parsed_resource.service {
            return Err(Error::Authorization(format!(
                "operation service '{}' does not match resource service '{}'",
                parsed_operation.service, parsed_resource.service
            )));
        }

        let permissions = self.group_manager.applicable_permissions(session);
        for permission in &permissions {
            if !principal_matches(&permission.principal, session) {
                continue;
            }
            if !operation_matches(&permission.operation_pattern, operation) {
                continue;
            }
            if !wildcard_matches(&permission.resource_pattern, resource) {
                continue;
            }
            self.metrics.increment(Counter::AuthorizationGranted);
            return Ok(true);
        }
        self.metrics.increment(Counter::AuthorizationDenied);
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceGroupPolicy;
    use std::collections::HashMap as Map;

    fn session_with(thing_name: &str) -> Session {
        let mut attributes = Map::new();
        attributes.insert("Thing.ThingName".to_string(), thing_name.to_string());
        Session { session_id: "s1".to_string(), attributes }
    }

    #[test]
    fn wildcard_matches_star_and_question_mark() {
        assert!(wildcard_matches("iot:topic:home/*", "iot:topic:home/livingroom/temp"));
        assert!(wildcard_matches("device-?", "device-1"));
        assert!(!wildcard_matches("device-?", "device-12"));
        assert!(wildcard_matches("*", "anything"));
    }

    #[test]
    fn allow_all_session_authorizes_unconditionally() {
        let evaluator = PolicyEvaluator::new(GroupManager::new(HashMap::new()));
        let session = Session::allow_all();
        assert!(evaluator.authorize(&session, "mqtt:publish", "mqtt:topic:any").unwrap());
    }

    #[test]
    fn mismatched_operation_and_resource_service_is_an_error() {
        let evaluator = PolicyEvaluator::new(GroupManager::new(HashMap::new()));
        let session = session_with("livingroom-1");
        let result = evaluator.authorize(&session, "mqtt:publish", "greengrass:component:foo");
        assert!(result.is_err());
    }

    #[test]
    fn a_matching_group_policy_grants_access() {
        let mut policies = HashMap::new();
        policies.insert(
            "publish-telemetry".to_string(),
            DeviceGroupPolicy {
                policy_variables: HashMap::new(),
                operations: vec!["mqtt:publish".to_string()],
                resources: vec!["mqtt:topic:home/${iot:Connection.Thing.ThingName}/telemetry".to_string()],
                principals: vec!["*".to_string()],
            },
        );
        let mut groups = HashMap::new();
        groups.insert(
            "living-room-devices".to_string(),
            DeviceGroup { selection_rule: "Thing.ThingName: MATCHES_EXPRESSION: \"livingroom-*\"".to_string(), policies },
        );

        let evaluator = PolicyEvaluator::new(GroupManager::new(groups));
        let session = session_with("livingroom-1");
        assert!(evaluator
            .authorize(&session, "mqtt:publish", "mqtt:topic:home/livingroom-1/telemetry")
            .unwrap());
    }

    #[test]
    fn a_session_outside_the_selection_rule_is_denied() {
        let mut policies = HashMap::new();
        policies.insert(
            "publish-telemetry".to_string(),
            DeviceGroupPolicy {
                policy_variables: HashMap::new(),
                operations: vec!["mqtt:publish".to_string()],
                resources: vec!["mqtt:topic:*".to_string()],
                principals: vec!["*".to_string()],
            },
        );
        let mut groups = HashMap::new();
        groups.insert(
            "living-room-devices".to_string(),
            DeviceGroup { selection_rule: "Thing.ThingName: MATCHES_EXPRESSION: \"livingroom-*\"".to_string(), policies },
        );

        let evaluator = PolicyEvaluator::new(GroupManager::new(groups));
        let session = session_with("kitchen-1");
        assert!(!evaluator.authorize(&session, "mqtt:publish", "mqtt:topic:home/kitchen-1/telemetry").unwrap());
    }
}
