use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single action a caller may hold against a node of the access tree,
/// ordered `Deny < List < Read < Write < Manage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Deny,
    List,
    Read,
    Write,
    Manage,
}

impl Action {
    pub fn can_read(self) -> bool {
        self >= Action::Read
    }
}

/// A single node of a caller's permission subtree, rooted at
/// `image://{cluster}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionNode {
    #[serde(default = "default_action")]
    pub action: ActionOrDefault,
    #[serde(default)]
    pub children: HashMap<String, PermissionNode>,
}

fn default_action() -> ActionOrDefault {
    ActionOrDefault(Action::Deny)
}

/// Newtype so `PermissionNode` can derive `Default` while `Action` has no
/// natural default beyond `Deny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionOrDefault(pub Action);

impl Default for ActionOrDefault {
    fn default() -> Self {
        ActionOrDefault(Action::Deny)
    }
}

impl PermissionNode {
    pub fn leaf(action: Action) -> Self {
        Self {
            action: ActionOrDefault(action),
            children: HashMap::new(),
        }
    }

    pub fn with_child(mut self, name: &str, child: PermissionNode) -> Self {
        self.children.insert(name.to_string(), child);
        self
    }
}

/// A permission request against the authorization service: `uri` is an
/// `image://` scoped resource, `action` the level required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub uri: String,
    pub action: Action,
}

impl Permission {
    pub fn read(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            action: Action::Read,
        }
    }

    pub fn write(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            action: Action::Write,
        }
    }
}

/// Walks `tree` along `image_name`'s `/`-separated segments. At each step,
/// a node whose action is already `>= read` decides the outcome (its
/// descendants inherit read access); otherwise we must find the named
/// child to continue. Reaching a dead end without resolving to `read` is
/// a denial.
pub fn check_image_catalog_permission(image_name: &str, tree: &PermissionNode) -> bool {
    let mut node = tree;
    for part in image_name.split('/') {
        if node.action.0.can_read() {
            return true;
        }
        match node.children.get(part) {
            Some(child) => node = child,
            None => return false,
        }
    }
    node.action.0.can_read()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> PermissionNode {
        PermissionNode::leaf(Action::List).with_child(
            "alice",
            PermissionNode::leaf(Action::Manage),
        )
    }

    #[test]
    fn grants_under_managed_subtree() {
        let t = tree();
        assert!(check_image_catalog_permission("alice/img1", &t));
        assert!(check_image_catalog_permission("alice/nested/img", &t));
    }

    #[test]
    fn denies_other_subtrees() {
        let t = tree();
        assert!(!check_image_catalog_permission("bob/img2", &t));
    }

    #[test]
    fn denies_when_root_denies_outright() {
        let t = PermissionNode::leaf(Action::Deny);
        assert!(!check_image_catalog_permission("anything", &t));
    }

    #[test]
    fn read_exactly_at_leaf_grants() {
        let t = PermissionNode::leaf(Action::List)
            .with_child("alice", PermissionNode::leaf(Action::Read));
        assert!(check_image_catalog_permission("alice", &t));
    }

    #[test]
    fn action_ordering() {
        assert!(Action::Manage > Action::Write);
        assert!(Action::Write > Action::Read);
        assert!(Action::Read > Action::List);
        assert!(Action::List > Action::Deny);
    }
}
