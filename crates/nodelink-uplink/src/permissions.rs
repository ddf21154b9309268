//! Which tools a client may announce, and to whom.

use crate::entities::ToolDescriptor;
use std::collections::BTreeSet;

/// Group id marking a tool as visible to everyone.
pub const PUBLIC_GROUP_ID: &str = "public";

/// The access groups declared for a tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    pub public: bool,
    pub group_ids: BTreeSet<String>,
}

impl PermissionSet {
    pub fn public() -> Self {
        Self {
            public: true,
            group_ids: BTreeSet::new(),
        }
    }

    pub fn groups<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            public: false,
            group_ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

/// Query side of the local authorization model.
pub trait AuthorizationProvider: Send + Sync {
    fn is_public(&self, set: &PermissionSet) -> bool;

    /// Groups of `set` the local user is a member of.
    fn intersecting_groups(&self, set: &PermissionSet) -> Vec<String>;
}

/// Authorization based on a fixed list of group memberships.
#[derive(Debug, Clone, Default)]
pub struct StaticGroupAuthorization {
    memberships: BTreeSet<String>,
}

impl StaticGroupAuthorization {
    pub fn new<I, S>(memberships: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            memberships: memberships.into_iter().map(Into::into).collect(),
        }
    }
}

impl AuthorizationProvider for StaticGroupAuthorization {
    fn is_public(&self, set: &PermissionSet) -> bool {
        set.public
    }

    fn intersecting_groups(&self, set: &PermissionSet) -> Vec<String> {
        set.group_ids
            .intersection(&self.memberships)
            .cloned()
            .collect()
    }
}

/// A locally available tool together with its declared permissions.
#[derive(Debug, Clone)]
pub struct ToolPublication {
    pub descriptor: ToolDescriptor,
    pub permissions: PermissionSet,
}

/// The descriptors that may be announced, each carrying the group ids it
/// is visible to. Tools without a public flag or shared group are dropped.
pub fn publishable_descriptors(
    provider: &dyn AuthorizationProvider,
    publications: &[ToolPublication],
) -> Vec<ToolDescriptor> {
    publications
        .iter()
        .filter_map(|p| {
            let groups = if provider.is_public(&p.permissions) {
                vec![PUBLIC_GROUP_ID.to_string()]
            } else {
                provider.intersecting_groups(&p.permissions)
            };
            if groups.is_empty() {
                return None;
            }
            let mut descriptor = p.descriptor.clone();
            descriptor.authorization_group_ids = groups;
            Some(descriptor)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filtering() {
        let auth = StaticGroupAuthorization::new(["lab", "ops"]);
        let publications = vec![
            ToolPublication {
                descriptor: ToolDescriptor::new("open", "1"),
                permissions: PermissionSet::public(),
            },
            ToolPublication {
                descriptor: ToolDescriptor::new("shared", "1"),
                permissions: PermissionSet::groups(["ops", "finance"]),
            },
            ToolPublication {
                descriptor: ToolDescriptor::new("private", "1"),
                permissions: PermissionSet::groups(["finance"]),
            },
        ];
        let published = publishable_descriptors(&auth, &publications);
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].authorization_group_ids, vec![PUBLIC_GROUP_ID]);
        assert_eq!(published[1].tool_id, "shared");
        assert_eq!(published[1].authorization_group_ids, vec!["ops"]);
    }
}
