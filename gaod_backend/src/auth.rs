use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::UserStore;

const INVALID_CREDENTIALS: &str = "Invalid email or password";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => UserRole::Admin,
            _ => UserRole::User,
        }
    }
}

/// Public view of an account. Never carries credential material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Stored account row: the public user plus its salted password digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user: User,
    pub password_salt: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    Success { user: User, token: String },
    Failure { error: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default = "default_new_user_role")]
    pub role: UserRole,
}

fn default_new_user_role() -> UserRole {
    UserRole::User
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

impl UserRecord {
    pub fn new(email: &str, name: &str, password: &str, role: UserRole) -> Self {
        let salt = uuid::Uuid::new_v4().simple().to_string();
        Self {
            user: User {
                id: uuid::Uuid::new_v4().to_string(),
                email: email.trim().to_string(),
                name: name.trim().to_string(),
                role,
                created_at: Utc::now(),
            },
            password_hash: hash_password(&salt, password),
            password_salt: salt,
        }
    }

    fn password_matches(&self, password: &str) -> bool {
        hash_password(&self.password_salt, password) == self.password_hash
    }
}

/// Login, session lookup and the admin user listing.
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    /// Create the seed admin when no accounts exist yet.
    pub async fn ensure_seed_admin(&self, email: &str, password: Option<&str>) -> Result<()> {
        if !self.users.list_users().await?.is_empty() {
            return Ok(());
        }
        let Some(password) = password.filter(|p| !p.is_empty()) else {
            tracing::warn!("No users exist and no admin password configured; set GAOD_ADMIN_PASSWORD");
            return Ok(());
        };
        let record = UserRecord::new(email, "Admin", password, UserRole::Admin);
        self.users.create_user(&record).await?;
        tracing::info!("Seeded admin account {}", record.user.id);
        Ok(())
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        let Some(record) = self.users.find_user_by_email(email).await? else {
            return Ok(LoginOutcome::Failure {
                error: INVALID_CREDENTIALS.to_string(),
            });
        };
        if !record.password_matches(password) {
            return Ok(LoginOutcome::Failure {
                error: INVALID_CREDENTIALS.to_string(),
            });
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        self.users.create_session(&token, &record.user.id).await?;
        Ok(LoginOutcome::Success {
            user: record.user,
            token,
        })
    }

    pub async fn logout(&self, token: &str) -> Result<()> {
        self.users.delete_session(token).await
    }

    pub async fn current_user(&self, token: &str) -> Result<Option<User>> {
        let Some(user_id) = self.users.session_user_id(token).await? else {
            return Ok(None);
        };
        Ok(self.users.get_user(&user_id).await?.map(|record| record.user))
    }

    pub async fn list_users(&self, requester: &User) -> Result<Vec<User>> {
        if !requester.is_admin() {
            return Err(anyhow!("Unauthorized"));
        }
        Ok(self
            .users
            .list_users()
            .await?
            .into_iter()
            .map(|record| record.user)
            .collect())
    }

    pub async fn create_user(&self, requester: &User, new_user: &NewUser) -> Result<User> {
        if !requester.is_admin() {
            return Err(anyhow!("Unauthorized"));
        }
        if new_user.email.trim().is_empty() || new_user.password.is_empty() {
            return Err(anyhow!("email and password are required"));
        }
        let record = UserRecord::new(
            &new_user.email,
            &new_user.name,
            &new_user.password,
            new_user.role,
        );
        self.users.create_user(&record).await?;
        Ok(record.user)
    }
}
