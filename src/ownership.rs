//! Unix file ownership of archive entries.
//!
//! Tar headers carry numeric ids and, for ustar/GNU/PAX archives, the owner
//! and group names as well. Folder sources fill in ids from the real
//! filesystem. Names are never resolved against the local user database.
//!
//! # Example
//!
//! ```rust
//! use seekstone::Ownership;
//!
//! let owner = Ownership::from_ids(1000, 100).with_names("user", "users");
//! assert_eq!(owner.uid, 1000);
//! assert_eq!(owner.user_name.as_deref(), Some("user"));
//! ```

use std::fs::Metadata;

/// Unix file ownership information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Ownership {
    /// User ID (UID).
    pub uid: u32,
    /// Group ID (GID).
    pub gid: u32,
    /// User name (owner), if recorded.
    pub user_name: Option<String>,
    /// Group name, if recorded.
    pub group_name: Option<String>,
}

impl Ownership {
    /// Creates ownership from UID and GID only.
    pub fn from_ids(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            user_name: None,
            group_name: None,
        }
    }

    /// Attaches owner and group names. Empty names are treated as absent.
    pub fn with_names(mut self, user: impl Into<String>, group: impl Into<String>) -> Self {
        let user = user.into();
        let group = group.into();
        self.user_name = (!user.is_empty()).then_some(user);
        self.group_name = (!group.is_empty()).then_some(group);
        self
    }

    /// Reads ownership from filesystem metadata.
    ///
    /// On platforms without Unix ownership this is root:root.
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self::from_ids(metadata.uid(), metadata.gid())
    }

    /// Reads ownership from filesystem metadata.
    ///
    /// On platforms without Unix ownership this is root:root.
    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &Metadata) -> Self {
        Self::default()
    }
}
