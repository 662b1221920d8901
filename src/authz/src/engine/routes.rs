//! Declarative route protection table

use super::guard::GuardChain;
use crate::error::{AuthzError, Result};
use crate::types::{AccessRequirement, Role};
use regex::Regex;
use serde::Deserialize;

/// How a route is protected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAccess {
    Public,
    Protected(AccessRequirement),
}

#[derive(Debug, Clone)]
struct RouteRule {
    pattern: String,
    matcher: Option<Regex>,
    access: RouteAccess,
}

impl RouteRule {
    fn new(pattern: &str, access: RouteAccess) -> Result<Self> {
        let matcher = if pattern.contains('*') {
            let regex_pattern = regex::escape(pattern).replace(r"\*", ".*");
            Some(
                Regex::new(&format!("^{}$", regex_pattern))
                    .map_err(|e| AuthzError::Config(format!("Invalid route pattern '{}': {}", pattern, e)))?,
            )
        } else {
            None
        };

        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
            access,
        })
    }

    fn matches(&self, route: &str) -> bool {
        match &self.matcher {
            Some(regex) => regex.is_match(route),
            None => self.pattern == route,
        }
    }
}

/// Entry of a route table file
#[derive(Debug, Deserialize)]
struct RouteEntry {
    pattern: String,
    #[serde(default)]
    public: bool,
    #[serde(flatten)]
    requirement: AccessRequirement,
}

/// Ordered route rules; the first matching rule wins
///
/// Routes no rule matches get the fallback requirement (authenticated only unless
/// configured otherwise).
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    fallback: AccessRequirement,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: AccessRequirement::authenticated(),
        }
    }

    /// Route layout of the appraisal front end
    pub fn appraisal_defaults() -> Self {
        // Patterns are static and known to compile
        let mut table = Self::new();
        let rules = [
            ("/", RouteAccess::Public),
            ("/auth", RouteAccess::Public),
            ("/plans", RouteAccess::Public),
            ("/dashboard", RouteAccess::Protected(AccessRequirement::authenticated())),
            ("/profile", RouteAccess::Protected(AccessRequirement::authenticated())),
            ("/appraisals", RouteAccess::Protected(AccessRequirement::entitled())),
            ("/appraisals/*", RouteAccess::Protected(AccessRequirement::entitled())),
            ("/admin*", RouteAccess::Protected(AccessRequirement::with_roles([Role::Admin]))),
        ];
        for (pattern, access) in rules {
            if let Ok(rule) = RouteRule::new(pattern, access) {
                table.rules.push(rule);
            }
        }
        table
    }

    /// Parse a JSON array of `{ pattern, public?, roles?, requires_entitlement? }`
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<RouteEntry> = serde_json::from_str(json)
            .map_err(|e| AuthzError::Config(format!("Invalid route table: {}", e)))?;

        let mut table = Self::new();
        for entry in entries {
            let access = if entry.public {
                RouteAccess::Public
            } else {
                RouteAccess::Protected(entry.requirement)
            };
            table.rules.push(RouteRule::new(&entry.pattern, access)?);
        }
        Ok(table)
    }

    pub fn with_fallback(mut self, fallback: AccessRequirement) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn public(mut self, pattern: &str) -> Result<Self> {
        self.rules.push(RouteRule::new(pattern, RouteAccess::Public)?);
        Ok(self)
    }

    pub fn protect(mut self, pattern: &str, requirement: AccessRequirement) -> Result<Self> {
        self.rules.push(RouteRule::new(pattern, RouteAccess::Protected(requirement))?);
        Ok(self)
    }

    /// Access rule for a route
    pub fn access_for(&self, route: &str) -> RouteAccess {
        self.rules
            .iter()
            .find(|rule| rule.matches(route))
            .map(|rule| rule.access.clone())
            .unwrap_or_else(|| RouteAccess::Protected(self.fallback.clone()))
    }

    /// Guard chain for a route
    pub fn chain_for(&self, route: &str) -> GuardChain {
        match self.access_for(route) {
            RouteAccess::Public => GuardChain::public(),
            RouteAccess::Protected(requirement) => GuardChain::for_requirement(&requirement),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::guard::Guard;

    #[test]
    fn test_exact_and_wildcard_matching() {
        let table = RouteTable::appraisal_defaults();

        assert_eq!(table.access_for("/"), RouteAccess::Public);
        assert_eq!(
            table.access_for("/appraisals/42/edit"),
            RouteAccess::Protected(AccessRequirement::entitled())
        );
        assert_eq!(
            table.access_for("/admin/gateways"),
            RouteAccess::Protected(AccessRequirement::with_roles([Role::Admin]))
        );
    }

    #[test]
    fn test_appraisals_index_requires_entitlement() {
        let table = RouteTable::appraisal_defaults();
        assert_eq!(
            table.access_for("/appraisals"),
            RouteAccess::Protected(AccessRequirement::entitled())
        );
    }

    #[test]
    fn test_unknown_route_uses_fallback() {
        let table = RouteTable::appraisal_defaults();
        assert_eq!(
            table.access_for("/settings"),
            RouteAccess::Protected(AccessRequirement::authenticated())
        );
    }

    #[test]
    fn test_first_match_wins() {
        let table = RouteTable::new()
            .public("/reports/sample")
            .unwrap()
            .protect("/reports/*", AccessRequirement::entitled())
            .unwrap();

        assert_eq!(table.access_for("/reports/sample"), RouteAccess::Public);
        assert_eq!(
            table.access_for("/reports/q3"),
            RouteAccess::Protected(AccessRequirement::entitled())
        );
    }

    #[test]
    fn test_dots_are_literal() {
        let table = RouteTable::new().public("/static/*.png").unwrap();
        assert_eq!(table.access_for("/static/logo.png"), RouteAccess::Public);
        assert_ne!(table.access_for("/static/logoxpng"), RouteAccess::Public);
    }

    #[test]
    fn test_from_json() {
        let table = RouteTable::from_json(
            r#"[
                {"pattern": "/", "public": true},
                {"pattern": "/admin/*", "roles": ["admin"]},
                {"pattern": "/appraisals/*", "requires_entitlement": true}
            ]"#,
        )
        .unwrap();

        assert_eq!(table.len(), 3);
        let chain = table.chain_for("/admin/users");
        assert_eq!(chain.guards()[0], Guard::Authenticated);
        assert!(matches!(chain.guards()[1], Guard::Role(_)));
        assert!(table.chain_for("/").is_empty());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(RouteTable::from_json("{"), Err(AuthzError::Config(_))));
    }
}
