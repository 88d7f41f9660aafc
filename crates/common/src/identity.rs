// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::NodeId;

/// An opaque principal that owns tasks and is mapped to exactly one node at a
/// time. Cheap to clone; equality and hashing are by name.
///
/// The core never creates identities on its own except through [`Identity::minted`],
/// which produces a globally-unique synthetic owner for "run with new identity"
/// submissions.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Arc<str>);

impl Identity {
    /// An identity for a named principal (a logged-in user, an application).
    pub fn named(name: &str) -> Self {
        Identity(Arc::from(name))
    }

    /// Mint a globally-unique synthetic identity for isolated work. The node
    /// id is folded into the name so operators can tell where it came from.
    pub fn minted(node_id: NodeId) -> Self {
        Identity(Arc::from(format!("id:{}.{}", node_id, Uuid::new_v4().simple()).as_str()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_identities_compare_by_name() {
        assert_eq!(Identity::named("fred"), Identity::named("fred"));
        assert_ne!(Identity::named("fred"), Identity::named("barney"));
    }

    #[test]
    fn minted_identities_are_unique() {
        let a = Identity::minted(3);
        let b = Identity::minted(3);
        assert_ne!(a, b);
        assert!(a.name().starts_with("id:3."));
    }
}
