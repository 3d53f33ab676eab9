//! User document collection.
//!
//! Handlers only see [`UserRepository`]; the server wires in
//! [`InMemoryUserStore`] at startup.

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{CreateUser, UpdateUser, User};

pub trait UserRepository: Send + Sync {
    fn list(&self) -> Vec<User>;
    fn get(&self, id: &str) -> Option<User>;
    fn insert(&self, new_user: CreateUser) -> Result<User, ApiError>;
    fn update(&self, id: &str, changes: UpdateUser) -> Result<User, ApiError>;
    fn delete(&self, id: &str) -> Result<(), ApiError>;
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: DashMap<String, User>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn email_taken(&self, email: &str, except_id: Option<&str>) -> bool {
        self.users.iter().any(|entry| {
            Some(entry.key().as_str()) != except_id && entry.email.eq_ignore_ascii_case(email)
        })
    }
}

fn not_found(id: &str) -> ApiError {
    ApiError::NotFound(format!("User {id} not found"))
}

fn duplicate_email(email: &str) -> ApiError {
    ApiError::Conflict(format!("Email {email} is already registered"))
}

impl UserRepository for InMemoryUserStore {
    fn list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|entry| entry.value().clone()).collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        users
    }

    fn get(&self, id: &str) -> Option<User> {
        self.users.get(id).map(|entry| entry.value().clone())
    }

    fn insert(&self, new_user: CreateUser) -> Result<User, ApiError> {
        if self.email_taken(&new_user.email, None) {
            return Err(duplicate_email(&new_user.email));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            name: new_user.name,
            email: new_user.email,
            created_at: now,
            updated_at: now,
        };
        self.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    fn update(&self, id: &str, changes: UpdateUser) -> Result<User, ApiError> {
        if let Some(email) = changes.email.as_deref() {
            if self.email_taken(email, Some(id)) {
                return Err(duplicate_email(email));
            }
        }

        let mut user = self.users.get_mut(id).ok_or_else(|| not_found(id))?;
        if let Some(name) = changes.name {
            user.name = name;
        }
        if let Some(email) = changes.email {
            user.email = email;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    fn delete(&self, id: &str) -> Result<(), ApiError> {
        self.users.remove(id).map(|_| ()).ok_or_else(|| not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(name: &str, email: &str) -> CreateUser {
        CreateUser {
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    #[test]
    fn insert_then_get() {
        let store = InMemoryUserStore::new();
        let user = store.insert(create("Ada", "ada@example.com")).unwrap();
        assert_eq!(store.get(&user.id), Some(user.clone()));
        assert_eq!(store.list(), vec![user]);
    }

    #[test]
    fn duplicate_email_is_a_conflict() {
        let store = InMemoryUserStore::new();
        store.insert(create("Ada", "ada@example.com")).unwrap();
        let err = store.insert(create("Other", "ADA@example.com")).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn update_keeps_absent_fields() {
        let store = InMemoryUserStore::new();
        let user = store.insert(create("Ada", "ada@example.com")).unwrap();
        let updated = store
            .update(
                &user.id,
                UpdateUser {
                    name: Some("Ada Lovelace".into()),
                    email: None,
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Ada Lovelace");
        assert_eq!(updated.email, "ada@example.com");
        assert!(updated.updated_at >= user.updated_at);
    }

    #[test]
    fn update_may_keep_own_email() {
        let store = InMemoryUserStore::new();
        let user = store.insert(create("Ada", "ada@example.com")).unwrap();
        let changes = UpdateUser {
            name: None,
            email: Some("ada@example.com".into()),
        };
        assert!(store.update(&user.id, changes).is_ok());
    }

    #[test]
    fn missing_ids_are_not_found() {
        let store = InMemoryUserStore::new();
        assert!(store.get("nope").is_none());
        assert!(matches!(
            store.update("nope", UpdateUser::default()),
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(store.delete("nope"), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn delete_removes_document() {
        let store = InMemoryUserStore::new();
        let user = store.insert(create("Ada", "ada@example.com")).unwrap();
        store.delete(&user.id).unwrap();
        assert!(store.list().is_empty());
    }
}
