use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

// User document as stored and returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// POST /api/users body
#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub name: String,
    pub email: String,
}

// PUT /api/users/{id} body, absent fields are left alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUser {
    pub name: Option<String>,
    pub email: Option<String>,
}

pub fn validate_name(name: &str) -> Result<String, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Name is required".to_string()));
    }
    Ok(name.to_string())
}

pub fn validate_email(email: &str) -> Result<String, ApiError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email.to_string()),
        _ => Err(ApiError::BadRequest(
            "A valid email address is required".to_string(),
        )),
    }
}

impl CreateUser {
    pub fn validated(self) -> Result<Self, ApiError> {
        Ok(Self {
            name: validate_name(&self.name)?,
            email: validate_email(&self.email)?,
        })
    }
}

impl UpdateUser {
    pub fn validated(self) -> Result<Self, ApiError> {
        Ok(Self {
            name: self.name.as_deref().map(validate_name).transpose()?,
            email: self.email.as_deref().map(validate_email).transpose()?,
        })
    }
}
