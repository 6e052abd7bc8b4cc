//! OR-combined exact permission checks

use serde::{Deserialize, Serialize};

use super::{validate_permission, Resolver};
use crate::error::{GuardError, Result};
use crate::types::PermissionSnapshot;

/// Ordered, de-duplicated set of required permissions; any one suffices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct PlainSpec {
    permissions: Vec<String>,
}

impl PlainSpec {
    pub fn new<I, S>(permissions: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = Vec::new();
        for permission in permissions {
            let permission = permission.into();
            validate_permission(&permission)?;
            if !ordered.contains(&permission) {
                ordered.push(permission);
            }
        }

        if ordered.is_empty() {
            return Err(GuardError::Validation(
                "plain spec requires at least one permission".to_string(),
            ));
        }

        Ok(Self { permissions: ordered })
    }

    pub fn permissions(&self) -> &[String] {
        &self.permissions
    }
}

impl TryFrom<Vec<String>> for PlainSpec {
    type Error = GuardError;

    fn try_from(value: Vec<String>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PlainSpec> for Vec<String> {
    fn from(spec: PlainSpec) -> Self {
        spec.permissions
    }
}

/// `true` iff the snapshot holds at least one required permission
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainResolver;

impl Resolver for PlainResolver {
    type Spec = PlainSpec;

    fn evaluate(&self, snapshot: &PermissionSnapshot, spec: &PlainSpec) -> bool {
        spec.permissions.iter().any(|p| snapshot.holds(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserPermissions;
    use chrono::Utc;

    fn snapshot(perms: &[&str]) -> PermissionSnapshot {
        PermissionSnapshot::on_demand("alice", UserPermissions::new(perms.iter().copied()), 1, Utc::now())
    }

    #[test]
    fn test_any_of() {
        let snap = snapshot(&["user:read"]);
        let spec = PlainSpec::new(["user:read", "admin:users"]).unwrap();
        assert!(PlainResolver.evaluate(&snap, &spec));

        let spec = PlainSpec::new(["admin:users"]).unwrap();
        assert!(!PlainResolver.evaluate(&snap, &spec));
    }

    #[test]
    fn test_dedup_preserves_order() {
        let spec = PlainSpec::new(["b", "a", "b"]).unwrap();
        assert_eq!(spec.permissions(), &["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_rejects_empty_and_wildcards() {
        assert!(PlainSpec::new(Vec::<String>::new()).is_err());
        assert!(PlainSpec::new(["admin.*"]).is_err());
        assert!(PlainSpec::new([""]).is_err());
    }
}
