//! Known users and the search box filter.

use gather_shared::{UserIdentity, UserProfile};

/// Users the local user can chat with.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: Vec<UserProfile>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the listing; the local user and repeated usernames are dropped.
    pub fn replace(&mut self, local: &UserIdentity, profiles: Vec<UserProfile>) {
        let mut users: Vec<UserProfile> = Vec::with_capacity(profiles.len());
        for profile in profiles {
            if &profile.username == local || users.iter().any(|u| u.username == profile.username) {
                continue;
            }
            users.push(profile);
        }
        self.users = users;
    }

    pub fn users(&self) -> &[UserProfile] {
        &self.users
    }

    /// Case-insensitive substring match on the username. A blank term
    /// returns every user.
    pub fn search(&self, term: &str) -> Vec<&UserProfile> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return self.users.iter().collect();
        }
        self.users
            .iter()
            .filter(|u| u.username.as_str().to_lowercase().contains(&term))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserIdentity {
        UserIdentity::parse(name).unwrap()
    }

    fn directory() -> UserDirectory {
        let mut dir = UserDirectory::new();
        dir.replace(
            &user("me"),
            ["Alice", "bob", "me", "Malice", "bob"]
                .into_iter()
                .map(|n| UserProfile::new(user(n)))
                .collect(),
        );
        dir
    }

    #[test]
    fn test_replace_excludes_self_and_duplicates() {
        let dir = directory();
        let names: Vec<&str> = dir.users().iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["Alice", "bob", "Malice"]);
    }

    #[test]
    fn test_search_is_case_insensitive_substring() {
        let dir = directory();
        let names: Vec<&str> = dir
            .search("ALI")
            .iter()
            .map(|u| u.username.as_str())
            .collect();
        assert_eq!(names, vec!["Alice", "Malice"]);
    }

    #[test]
    fn test_blank_search_returns_all() {
        let dir = directory();
        assert_eq!(dir.search("   ").len(), dir.len());
        assert!(dir.search("zed").is_empty());
    }
}
