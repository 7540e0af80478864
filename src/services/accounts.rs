use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use chrono::{Duration, Utc};
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PublicUser, UserAccount};
use crate::services::manifest::sha256_hex;

const MIN_PASSWORD_LEN: usize = 6;
const RESET_TOKEN_TTL_HOURS: i64 = 1;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email pattern")
});

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("E-mail já cadastrado.")]
    EmailTaken,
    #[error("E-mail não cadastrado.")]
    UnknownEmail,
    #[error("invalid e-mail address")]
    InvalidEmail,
    #[error("password must have at least 6 characters")]
    WeakPassword,
    #[error("name must not be empty")]
    MissingName,
    #[error("invalid e-mail or password")]
    InvalidCredentials,
    #[error("Token inválido ou expirado.")]
    InvalidResetToken,
    #[error("user `{0}` not found")]
    UserNotFound(String),
    #[error("session expired or invalid")]
    InvalidSession,
    #[error("user store error: {0}")]
    Store(String),
}

/// Persistence for user documents.
pub trait UserStore: Send + Sync {
    fn find_by_id(&self, id: &str) -> Result<Option<UserAccount>, AccountError>;
    fn find_by_email(&self, email: &str) -> Result<Option<UserAccount>, AccountError>;
    fn find_by_reset_token(&self, token: &str) -> Result<Option<UserAccount>, AccountError>;
    fn insert(&self, user: UserAccount) -> Result<(), AccountError>;
    fn update(&self, user: UserAccount) -> Result<(), AccountError>;
}

/// All users in one JSON file, rewritten on every change. The in-memory
/// copy only changes once the file write succeeded.
pub struct JsonUserStore {
    path: PathBuf,
    users: Mutex<Vec<UserAccount>>,
}

impl JsonUserStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AccountError> {
        let path = path.into();
        let users = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| AccountError::Store(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(AccountError::Store(format!("{}: {}", path.display(), e))),
        };
        tracing::info!(path = %path.display(), count = users.len(), "user store opened");
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    fn persist(path: &Path, users: &[UserAccount]) -> Result<(), AccountError> {
        let store_err =
            |e: &dyn std::fmt::Display| AccountError::Store(format!("{}: {}", path.display(), e));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| store_err(&e))?;
        }
        let json = serde_json::to_string_pretty(users).map_err(|e| store_err(&e))?;
        fs::write(path, json).map_err(|e| store_err(&e))
    }

    fn with_users<T>(
        &self,
        f: impl FnOnce(&mut Vec<UserAccount>) -> Result<T, AccountError>,
    ) -> Result<T, AccountError> {
        let mut guard = self
            .users
            .lock()
            .map_err(|_| AccountError::Store("user store lock poisoned".to_string()))?;
        f(&mut guard)
    }

    fn find(&self, pred: impl Fn(&UserAccount) -> bool) -> Result<Option<UserAccount>, AccountError> {
        self.with_users(|users| Ok(users.iter().find(|u| pred(u)).cloned()))
    }
}

impl UserStore for JsonUserStore {
    fn find_by_id(&self, id: &str) -> Result<Option<UserAccount>, AccountError> {
        self.find(|u| u.id == id)
    }

    fn find_by_email(&self, email: &str) -> Result<Option<UserAccount>, AccountError> {
        let email = normalize_email(email);
        self.find(|u| u.email == email)
    }

    fn find_by_reset_token(&self, token: &str) -> Result<Option<UserAccount>, AccountError> {
        self.find(|u| u.reset_token.as_deref() == Some(token))
    }

    fn insert(&self, user: UserAccount) -> Result<(), AccountError> {
        self.with_users(|users| {
            if users.iter().any(|u| u.email == user.email) {
                return Err(AccountError::EmailTaken);
            }
            let mut next = users.clone();
            next.push(user);
            Self::persist(&self.path, &next)?;
            *users = next;
            Ok(())
        })
    }

    fn update(&self, user: UserAccount) -> Result<(), AccountError> {
        self.with_users(|users| {
            let mut next = users.clone();
            let slot = next
                .iter_mut()
                .find(|u| u.id == user.id)
                .ok_or_else(|| AccountError::UserNotFound(user.id.clone()))?;
            *slot = user;
            Self::persist(&self.path, &next)?;
            *users = next;
            Ok(())
        })
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn hash_password(salt: &str, password: &str) -> String {
    sha256_hex(&format!("{}{}", salt, password))
}

#[derive(Debug, Clone)]
pub struct AccountSettings {
    pub admin_email: Option<String>,
    pub require_subscription: bool,
    pub app_url: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Session {
    pub token: String,
    pub user: PublicUser,
}

/// Registration, login sessions, password resets and subscription flags.
pub struct AccountService<S> {
    store: S,
    settings: AccountSettings,
    sessions: Mutex<HashMap<String, String>>,
}

impl<S: UserStore> AccountService<S> {
    pub fn new(store: S, settings: AccountSettings) -> Self {
        Self {
            store,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn is_admin(&self, email: &str) -> bool {
        self.settings.admin_email.as_deref() == Some(email)
    }

    fn public(&self, user: &UserAccount) -> PublicUser {
        PublicUser {
            id: user.id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            subscription_active: user.subscription_active,
            is_admin: self.is_admin(&user.email),
        }
    }

    pub fn register(&self, name: &str, email: &str, password: &str) -> Result<PublicUser, AccountError> {
        let name = name.trim();
        let email = normalize_email(email);
        if name.is_empty() {
            return Err(AccountError::MissingName);
        }
        if !EMAIL_RE.is_match(&email) {
            return Err(AccountError::InvalidEmail);
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AccountError::WeakPassword);
        }
        if self.store.find_by_email(&email)?.is_some() {
            return Err(AccountError::EmailTaken);
        }

        let salt = Uuid::new_v4().simple().to_string();
        let user = UserAccount {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            password_hash: hash_password(&salt, password),
            salt,
            email,
            subscription_active: false,
            subscription_updated_at: None,
            created_at: Utc::now(),
            reset_token: None,
            reset_token_expiry: None,
        };
        self.store.insert(user.clone())?;
        tracing::info!(user = %user.id, "user registered");
        Ok(self.public(&user))
    }

    pub fn authenticate(&self, email: &str, password: &str) -> Result<Session, AccountError> {
        let user = self
            .store
            .find_by_email(email)?
            .ok_or(AccountError::InvalidCredentials)?;
        if hash_password(&user.salt, password) != user.password_hash {
            tracing::warn!(user = %user.id, "failed login attempt");
            return Err(AccountError::InvalidCredentials);
        }

        let token = Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .map_err(|_| AccountError::Store("session lock poisoned".to_string()))?
            .insert(token.clone(), user.id.clone());
        Ok(Session {
            token,
            user: self.public(&user),
        })
    }

    /// Resolves a bearer token to the current state of its user.
    pub fn session(&self, token: &str) -> Result<PublicUser, AccountError> {
        let user_id = self
            .sessions
            .lock()
            .map_err(|_| AccountError::Store("session lock poisoned".to_string()))?
            .get(token)
            .cloned()
            .ok_or(AccountError::InvalidSession)?;
        let user = self
            .store
            .find_by_id(&user_id)?
            .ok_or(AccountError::InvalidSession)?;
        Ok(self.public(&user))
    }

    pub fn logout(&self, token: &str) {
        if let Ok(mut guard) = self.sessions.lock() {
            guard.remove(token);
        }
    }

    /// Issues a reset token valid for one hour. Delivery is simulated by
    /// logging the reset link.
    pub fn request_password_reset(&self, email: &str) -> Result<String, AccountError> {
        let mut user = self
            .store
            .find_by_email(email)?
            .ok_or(AccountError::UnknownEmail)?;

        let nonce = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let token = sha256_hex(&format!("{}{}{}", user.email, nonce, Uuid::new_v4()));
        user.reset_token = Some(token.clone());
        user.reset_token_expiry = Some(Utc::now() + Duration::hours(RESET_TOKEN_TTL_HOURS));
        self.store.update(user.clone())?;

        tracing::info!(
            user = %user.id,
            "password reset link: {}/?reset_token={}",
            self.settings.app_url.trim_end_matches('/'),
            token
        );
        Ok(token)
    }

    pub fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AccountError> {
        if new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AccountError::WeakPassword);
        }
        let mut user = self
            .store
            .find_by_reset_token(token)?
            .ok_or(AccountError::InvalidResetToken)?;
        let valid = user.reset_token_expiry.is_some_and(|expiry| expiry > Utc::now());
        if !valid {
            return Err(AccountError::InvalidResetToken);
        }

        let salt = Uuid::new_v4().simple().to_string();
        user.password_hash = hash_password(&salt, new_password);
        user.salt = salt;
        user.reset_token = None;
        user.reset_token_expiry = None;
        self.store.update(user)
    }

    pub fn update_subscription_status(&self, user_id: &str, active: bool) -> Result<PublicUser, AccountError> {
        let mut user = self
            .store
            .find_by_id(user_id)?
            .ok_or_else(|| AccountError::UserNotFound(user_id.to_string()))?;
        user.subscription_active = active;
        user.subscription_updated_at = Some(Utc::now());
        self.store.update(user.clone())?;
        tracing::info!(user = %user_id, active, "subscription status updated");
        Ok(self.public(&user))
    }

    pub fn can_generate(&self, user: &PublicUser) -> bool {
        !self.settings.require_subscription || user.subscription_active || user.is_admin
    }
}
