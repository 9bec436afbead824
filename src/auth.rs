//! Staff authentication with bcrypt.
//!
//! Users belong to one tenant and log in with email and password. Lockout
//! state lives on the `users` row so it survives restarts; sessions are
//! kept in memory and handed out as opaque bearer tokens.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::db::DbState;
use crate::data_helpers::{check_len, clean, is_valid_email, new_id, now_rfc3339, to_rfc3339};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::tenants;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const MAX_FAILED_ATTEMPTS: i64 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 60;
const SESSION_MAX_DURATION_HOURS: i64 = 12;

#[cfg(not(test))]
const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const BCRYPT_COST: u32 = 4;

pub const ROLES: &[&str] = &["admin", "manager", "technician", "receptionist"];

const ADMIN_PERMISSIONS: &[&str] = &[
    "customers:read",
    "customers:write",
    "devices:read",
    "devices:write",
    "devices:assign",
    "inventory:read",
    "inventory:write",
    "inventory:use",
    "appointments:read",
    "appointments:write",
    "sms:read",
    "sms:send",
    "sms:manage",
    "analytics:view",
    "sales:read",
    "sales:write",
    "settings:read",
    "settings:write",
    "users:manage",
    "system:view",
    "backup:export",
];

const MANAGER_PERMISSIONS: &[&str] = &[
    "customers:read",
    "customers:write",
    "devices:read",
    "devices:write",
    "devices:assign",
    "inventory:read",
    "inventory:write",
    "inventory:use",
    "appointments:read",
    "appointments:write",
    "sms:read",
    "sms:send",
    "sms:manage",
    "analytics:view",
    "sales:read",
    "sales:write",
    "settings:read",
    "system:view",
    "backup:export",
];

const TECHNICIAN_PERMISSIONS: &[&str] = &[
    "customers:read",
    "devices:read",
    "devices:write",
    "inventory:read",
    "inventory:use",
    "appointments:read",
    "sms:read",
];

const RECEPTIONIST_PERMISSIONS: &[&str] = &[
    "customers:read",
    "customers:write",
    "devices:read",
    "devices:write",
    "inventory:read",
    "appointments:read",
    "appointments:write",
    "sms:read",
    "sms:send",
    "sales:read",
    "sales:write",
    "settings:read",
];

pub fn permissions_for_role(role: &str) -> &'static [&'static str] {
    match role {
        "admin" => ADMIN_PERMISSIONS,
        "manager" => MANAGER_PERMISSIONS,
        "technician" => TECHNICIAN_PERMISSIONS,
        "receptionist" => RECEPTIONIST_PERMISSIONS,
        _ => &[],
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub tenant_id: String,
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub last_login_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const USER_COLUMNS: &str = "id, tenant_id, email, full_name, phone, role, is_active, \
                            last_login_at, created_at, updated_at";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        email: row.get(2)?,
        full_name: row.get(3)?,
        phone: row.get(4)?,
        role: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        last_login_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub email: String,
    #[serde(alias = "full_name", alias = "name")]
    pub full_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    pub password: String,
}

fn default_role() -> String {
    "technician".into()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    #[serde(default, alias = "full_name", alias = "name")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, alias = "is_active")]
    pub is_active: Option<bool>,
}

pub fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < 8 {
        return Err(AppError::validation(
            "Password must be at least 8 characters",
        ));
    }
    let has_letter = password.chars().any(char::is_alphabetic);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !has_letter || !has_digit {
        return Err(AppError::validation(
            "Password must contain a letter and a digit",
        ));
    }
    Ok(())
}

/// Hash a password and wipe the plaintext.
pub fn hash_password(mut password: String) -> AppResult<String> {
    let result = bcrypt::hash(&password, BCRYPT_COST)
        .map_err(|e| AppError::internal(format!("Failed to hash password: {e}")));
    password.zeroize();
    result
}

fn verify_password(mut password: String, hash: &str) -> bool {
    let ok = bcrypt::verify(&password, hash).unwrap_or(false);
    password.zeroize();
    ok
}

fn validate_role(role: &str) -> AppResult<()> {
    if ROLES.contains(&role) {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "role must be one of {}",
            ROLES.join(", ")
        )))
    }
}

/// A validated new user with the password already hashed.
#[derive(Debug, Clone)]
pub struct PreparedUser {
    email: String,
    full_name: String,
    phone: Option<String>,
    role: String,
    password_hash: String,
}

/// Validate a new user and hash its password. Runs bcrypt, so call it
/// off the async workers and without the database lock.
pub fn prepare_user(input: NewUser) -> AppResult<PreparedUser> {
    let email = input.email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(AppError::validation("A valid email is required"));
    }
    let full_name = input.full_name.trim().to_string();
    check_len("fullName", &full_name, 2, 100)?;
    let role = input.role.trim().to_lowercase();
    validate_role(&role)?;
    validate_password(&input.password)?;

    Ok(PreparedUser {
        email,
        full_name,
        phone: clean(input.phone),
        role,
        password_hash: hash_password(input.password)?,
    })
}

pub fn insert_user(conn: &Connection, tenant_id: &str, user: PreparedUser) -> AppResult<User> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE tenant_id = ?1 AND email = ?2)",
        params![tenant_id, user.email],
        |row| row.get(0),
    )?;
    if exists {
        return Err(AppError::conflict(format!(
            "A user with email {} already exists",
            user.email
        )));
    }

    let id = new_id("user");
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO users (id, tenant_id, email, full_name, phone, role, password_hash,
                            is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
        params![
            id,
            tenant_id,
            user.email,
            user.full_name,
            user.phone,
            user.role,
            user.password_hash,
            now
        ],
    )?;
    info!(tenant_id, user_id = %id, role = %user.role, "user created");
    get_user(conn, tenant_id, &id)
}

/// Create a user, hashing before the database lock is taken.
pub fn create_user(db: &DbState, tenant_id: &str, input: NewUser) -> AppResult<User> {
    let prepared = prepare_user(input)?;
    let conn = db.lock()?;
    insert_user(&conn, tenant_id, prepared)
}

pub fn get_user(conn: &Connection, tenant_id: &str, user_id: &str) -> AppResult<User> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE tenant_id = ?1 AND id = ?2"),
        params![tenant_id, user_id],
        user_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("User"))
}

pub fn list_users(conn: &Connection, tenant_id: &str) -> AppResult<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE tenant_id = ?1 ORDER BY full_name COLLATE NOCASE"
    ))?;
    let rows = stmt.query_map(params![tenant_id], user_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Active users of a tenant.
pub fn active_users(conn: &Connection, tenant_id: &str) -> AppResult<Vec<User>> {
    Ok(list_users(conn, tenant_id)?
        .into_iter()
        .filter(|u| u.is_active)
        .collect())
}

fn other_active_admins(conn: &Connection, tenant_id: &str, user_id: &str) -> AppResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM users
         WHERE tenant_id = ?1 AND id != ?2 AND role = 'admin' AND is_active = 1",
        params![tenant_id, user_id],
        |row| row.get(0),
    )?)
}

pub fn update_user(
    conn: &Connection,
    auth: &AuthState,
    tenant_id: &str,
    user_id: &str,
    update: UserUpdate,
) -> AppResult<User> {
    let current = get_user(conn, tenant_id, user_id)?;

    let full_name = match clean(update.full_name) {
        Some(name) => {
            check_len("fullName", &name, 2, 100)?;
            name
        }
        None => current.full_name.clone(),
    };
    let role = match update.role {
        Some(r) => {
            let r = r.trim().to_lowercase();
            validate_role(&r)?;
            r
        }
        None => current.role.clone(),
    };
    let is_active = update.is_active.unwrap_or(current.is_active);
    let phone = match update.phone {
        Some(p) => clean(Some(p)),
        None => current.phone.clone(),
    };

    let loses_admin = current.role == "admin"
        && current.is_active
        && (role != "admin" || !is_active);
    if loses_admin && other_active_admins(conn, tenant_id, user_id)? == 0 {
        return Err(AppError::conflict(
            "The last active admin cannot be demoted or deactivated",
        ));
    }

    conn.execute(
        "UPDATE users SET full_name = ?1, phone = ?2, role = ?3, is_active = ?4, updated_at = ?5
         WHERE tenant_id = ?6 AND id = ?7",
        params![
            full_name,
            phone,
            role,
            is_active as i64,
            now_rfc3339(),
            tenant_id,
            user_id
        ],
    )?;

    if !is_active || role != current.role {
        let revoked = auth.revoke_user(user_id);
        if revoked > 0 {
            info!(user_id, revoked, "sessions revoked after user update");
        }
    }
    get_user(conn, tenant_id, user_id)
}

/// Admin reset of another user's password. Existing sessions are revoked.
pub fn reset_password(
    db: &DbState,
    auth: &AuthState,
    tenant_id: &str,
    user_id: &str,
    new_password: String,
) -> AppResult<()> {
    get_user(&*db.lock()?, tenant_id, user_id)?;
    validate_password(&new_password)?;
    let hash = hash_password(new_password)?;
    let updated = db.lock()?.execute(
        "UPDATE users SET password_hash = ?1, failed_attempts = 0, last_failed_at = NULL,
                          updated_at = ?2
         WHERE tenant_id = ?3 AND id = ?4",
        params![hash, now_rfc3339(), tenant_id, user_id],
    )?;
    if updated == 0 {
        return Err(AppError::not_found("User"));
    }
    auth.revoke_user(user_id);
    info!(tenant_id, user_id, "password reset");
    Ok(())
}

pub fn change_own_password(
    db: &DbState,
    tenant_id: &str,
    user_id: &str,
    current_password: String,
    new_password: String,
) -> AppResult<()> {
    let hash: String = db
        .lock()?
        .query_row(
            "SELECT password_hash FROM users WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("User"))?;
    if !verify_password(current_password, &hash) {
        return Err(AppError::validation("Current password is incorrect"));
    }
    validate_password(&new_password)?;
    let new_hash = hash_password(new_password)?;
    // Only replace the hash that was verified.
    let updated = db.lock()?.execute(
        "UPDATE users SET password_hash = ?1, updated_at = ?2
         WHERE tenant_id = ?3 AND id = ?4 AND password_hash = ?5",
        params![new_hash, now_rfc3339(), tenant_id, user_id, hash],
    )?;
    if updated == 0 {
        return Err(AppError::conflict("The password was changed by another request"));
    }
    info!(tenant_id, user_id, "password changed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// An active staff session.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
    pub full_name: String,
    pub email: String,
    pub permissions: Vec<String>,
    pub login_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Check whether this session has expired (inactivity or max duration).
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
            || now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES)
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "userId": self.user_id,
            "tenantId": self.tenant_id,
            "fullName": self.full_name,
            "email": self.email,
            "role": {
                "name": self.role,
                "permissions": self.permissions,
            },
            "loginTime": to_rfc3339(self.login_time),
            "lastActivity": to_rfc3339(self.last_activity),
            "expiresAt": to_rfc3339(self.expires_at),
        })
    }
}

/// In-memory session store shared by all request handlers.
#[derive(Debug, Default)]
pub struct AuthState {
    sessions: Mutex<HashMap<String, Session>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_session(&self, user: &User) -> AppResult<Session> {
        let now = Utc::now();
        let session = Session {
            token: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
            user_id: user.id.clone(),
            tenant_id: user.tenant_id.clone(),
            role: user.role.clone(),
            full_name: user.full_name.clone(),
            email: user.email.clone(),
            permissions: permissions_for_role(&user.role)
                .iter()
                .map(|p| p.to_string())
                .collect(),
            login_time: now,
            last_activity: now,
            expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
        };

        let mut sessions = self.sessions.lock()?;
        sessions.retain(|_, s| !s.is_expired_at(now));
        sessions.insert(session.token.clone(), session.clone());
        Ok(session)
    }

    /// Resolve a token to its session and refresh the inactivity timer.
    pub fn authenticate(&self, token: &str) -> AppResult<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock()?;
        let expired = match sessions.get_mut(token) {
            None => {
                return Err(AppError::Unauthorized(
                    "Session expired or not found".into(),
                ))
            }
            Some(session) if session.is_expired_at(now) => true,
            Some(session) => {
                session.last_activity = now;
                return Ok(session.clone());
            }
        };
        if expired {
            sessions.remove(token);
        }
        Err(AppError::Unauthorized("Session expired or not found".into()))
    }

    pub fn logout(&self, token: &str) -> AppResult<bool> {
        let removed = self.sessions.lock()?.remove(token);
        if let Some(ref s) = removed {
            info!(user_id = %s.user_id, "session logged out");
        }
        Ok(removed.is_some())
    }

    /// Drop every session of one user. Returns how many were removed.
    pub fn revoke_user(&self, user_id: &str) -> usize {
        match self.sessions.lock() {
            Ok(mut sessions) => {
                let before = sessions.len();
                sessions.retain(|_, s| s.user_id != user_id);
                before - sessions.len()
            }
            Err(_) => 0,
        }
    }

    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        self.sessions
            .lock()
            .map(|s| s.values().filter(|s| !s.is_expired_at(now)).count())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn backdate(&self, token: &str, minutes: i64) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(s) = sessions.get_mut(token) {
            s.last_activity -= Duration::minutes(minutes);
        }
    }
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(alias = "tenant", alias = "tenant_slug", alias = "shop")]
    pub tenant_slug: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: String,
    pub user: User,
    pub tenant: tenants::Tenant,
}

struct Credentials {
    user: User,
    password_hash: String,
    failed_attempts: i64,
    last_failed_at: Option<DateTime<Utc>>,
}

fn load_credentials(conn: &Connection, tenant_id: &str, email: &str) -> AppResult<Option<Credentials>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {USER_COLUMNS}, password_hash, failed_attempts, last_failed_at
                 FROM users WHERE tenant_id = ?1 AND email = ?2"
            ),
            params![tenant_id, email],
            |row| {
                Ok((
                    user_from_row(row)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, i64>(11)?,
                    row.get::<_, Option<String>>(12)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(user, password_hash, failed_attempts, last_failed)| Credentials {
        user,
        password_hash,
        failed_attempts,
        last_failed_at: last_failed
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    }))
}

/// Returns the remaining lockout in minutes, if the account is locked.
fn lockout_remaining(creds: &Credentials, now: DateTime<Utc>) -> Option<i64> {
    if creds.failed_attempts < MAX_FAILED_ATTEMPTS {
        return None;
    }
    let last = creds.last_failed_at?;
    let elapsed = now - last;
    if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
        Some((LOCKOUT_MINUTES - elapsed.num_minutes()).max(1))
    } else {
        None
    }
}

fn invalid_credentials() -> AppError {
    AppError::Unauthorized("Invalid email or password".into())
}

/// Verify credentials and open a session. The database lock is released
/// while bcrypt runs.
pub fn login(db: &DbState, auth: &AuthState, request: LoginRequest) -> AppResult<LoginResponse> {
    let LoginRequest {
        tenant_slug,
        email,
        password,
    } = request;
    let email = email.trim().to_lowercase();
    if email.is_empty() || password.is_empty() {
        return Err(AppError::validation("Email and password are required"));
    }

    let (tenant, creds) = {
        let conn = db.lock()?;
        let tenant = tenants::find_by_slug(&conn, tenant_slug.trim())?.ok_or_else(invalid_credentials)?;
        let creds = load_credentials(&conn, &tenant.id, &email)?.ok_or_else(invalid_credentials)?;
        (tenant, creds)
    };

    let now = Utc::now();
    if let Some(remaining) = lockout_remaining(&creds, now) {
        return Err(AppError::Locked(format!(
            "Too many failed attempts. Try again in {remaining} minute(s)."
        )));
    }
    let verified = verify_password(password, &creds.password_hash);
    let conn = db.lock()?;

    if !verified {
        // Counted in SQL so concurrent failures all land. A lapsed lockout
        // starts a fresh window.
        let lapsed_before = to_rfc3339(now - Duration::minutes(LOCKOUT_MINUTES));
        let attempts: i64 = conn.query_row(
            "UPDATE users
             SET failed_attempts = CASE
                     WHEN failed_attempts >= ?1 AND (last_failed_at IS NULL OR last_failed_at <= ?2)
                     THEN 1 ELSE failed_attempts + 1 END,
                 last_failed_at = ?3
             WHERE id = ?4
             RETURNING failed_attempts",
            params![MAX_FAILED_ATTEMPTS, lapsed_before, to_rfc3339(now), creds.user.id],
            |row| row.get(0),
        )?;
        warn!(tenant_id = %tenant.id, user_id = %creds.user.id, attempts, "failed login attempt");
        return Err(invalid_credentials());
    }

    if !creds.user.is_active {
        return Err(AppError::Unauthorized("Account is disabled".into()));
    }

    let now_str = to_rfc3339(now);
    conn.execute(
        "UPDATE users SET failed_attempts = 0, last_failed_at = NULL, last_login_at = ?1
         WHERE id = ?2",
        params![now_str, creds.user.id],
    )?;

    drop(conn);

    let mut user = creds.user;
    user.last_login_at = Some(now_str);
    let session = auth.create_session(&user)?;
    info!(tenant_id = %tenant.id, user_id = %user.id, role = %user.role, "login successful");

    Ok(LoginResponse {
        token: session.token,
        expires_at: to_rfc3339(session.expires_at),
        user,
        tenant,
    })
}

// ---------------------------------------------------------------------------
// Request extractor
// ---------------------------------------------------------------------------

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub token: String,
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
    pub permissions: Vec<String>,
    pub session: Session,
}

impl AuthUser {
    pub fn can(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn require(&self, permission: &str) -> AppResult<()> {
        if self.can(permission) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "Missing permission: {permission}"
            )))
        }
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let raw = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthorized("Missing bearer token".into()))?;
        let session = state.auth.authenticate(token)?;
        Ok(AuthUser {
            token: session.token.clone(),
            user_id: session.user_id.clone(),
            tenant_id: session.tenant_id.clone(),
            role: session.role.clone(),
            permissions: session.permissions.clone(),
            session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::tenants::fixtures;
    use std::sync::Arc;

    fn setup() -> (db::DbState, tenants::Tenant) {
        let state = db::test_state();
        let tenant = {
            let conn = state.lock().unwrap();
            fixtures::signup(
                &conn,
                tenants::NewTenant {
                    name: "Bole Fix".into(),
                    slug: "bole-fix".into(),
                    admin: tenants::NewAdmin {
                        full_name: "Admin One".into(),
                        email: "admin@bole.example".into(),
                        password: "secret123".into(),
                        phone: None,
                    },
                },
            )
            .expect("create tenant")
            .tenant
        };
        (state, tenant)
    }

    fn login_req(password: &str) -> LoginRequest {
        LoginRequest {
            tenant_slug: "bole-fix".into(),
            email: "ADMIN@bole.example".into(),
            password: password.into(),
        }
    }

    fn failed_attempts(state: &db::DbState) -> i64 {
        state
            .lock()
            .unwrap()
            .query_row(
                "SELECT failed_attempts FROM users WHERE email = 'admin@bole.example'",
                [],
                |row| row.get(0),
            )
            .unwrap()
    }

    fn new_user(email: &str, role: &str) -> NewUser {
        NewUser {
            email: email.into(),
            full_name: "Second User".into(),
            phone: None,
            role: role.into(),
            password: "another123".into(),
        }
    }

    #[test]
    fn password_policy() {
        assert!(validate_password("short1").is_err());
        assert!(validate_password("onlyletters").is_err());
        assert!(validate_password("12345678").is_err());
        assert!(validate_password("letters123").is_ok());
    }

    #[test]
    fn role_permission_tables() {
        assert!(permissions_for_role("admin").contains(&"users:manage"));
        assert!(!permissions_for_role("manager").contains(&"users:manage"));
        assert!(permissions_for_role("technician").contains(&"inventory:use"));
        assert!(!permissions_for_role("receptionist").contains(&"analytics:view"));
        assert!(permissions_for_role("guest").is_empty());
    }

    #[test]
    fn login_succeeds_and_session_authenticates() {
        let (state, tenant) = setup();
        let auth = AuthState::new();
        let resp = login(&state, &auth, login_req("secret123")).expect("login");
        assert_eq!(resp.tenant.id, tenant.id);
        assert_eq!(resp.user.role, "admin");

        let session = auth.authenticate(&resp.token).expect("session valid");
        assert!(session.permissions.iter().any(|p| p == "backup:export"));

        assert!(auth.logout(&resp.token).unwrap());
        assert!(auth.authenticate(&resp.token).is_err());
    }

    #[test]
    fn inactive_session_expires() {
        let (state, _) = setup();
        let auth = AuthState::new();
        let resp = login(&state, &auth, login_req("secret123")).unwrap();
        auth.backdate(&resp.token, SESSION_INACTIVITY_MINUTES + 1);
        assert!(matches!(
            auth.authenticate(&resp.token),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn active_session_still_ends_at_the_absolute_cap() {
        let (state, _) = setup();
        let auth = AuthState::new();
        let resp = login(&state, &auth, login_req("secret123")).unwrap();
        {
            let mut sessions = auth.sessions.lock().unwrap();
            let s = sessions.get_mut(&resp.token).unwrap();
            s.login_time -= Duration::hours(SESSION_MAX_DURATION_HOURS) + Duration::minutes(1);
            s.expires_at = s.login_time + Duration::hours(SESSION_MAX_DURATION_HOURS);
            s.last_activity = Utc::now() - Duration::minutes(1);
        }
        assert!(matches!(
            auth.authenticate(&resp.token),
            Err(AppError::Unauthorized(_))
        ));
        assert_eq!(auth.active_count(), 0);
    }

    #[test]
    fn lockout_persists_across_auth_state_restart() {
        let (state, _) = setup();
        let auth_before_restart = AuthState::new();

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let err = login(&state, &auth_before_restart, login_req("wrong-pass1"))
                .expect_err("invalid login should fail");
            assert!(matches!(err, AppError::Unauthorized(_)));
        }
        assert_eq!(failed_attempts(&state), MAX_FAILED_ATTEMPTS);

        let auth_after_restart = AuthState::new();
        let err = login(&state, &auth_after_restart, login_req("secret123"))
            .expect_err("lockout should remain active after restart");
        assert!(matches!(err, AppError::Locked(_)), "unexpected error: {err}");
        assert_eq!(
            failed_attempts(&state),
            MAX_FAILED_ATTEMPTS,
            "blocked attempt should not increment counter while lockout is active"
        );
    }

    #[test]
    fn successful_login_resets_counter_and_lapsed_lockout_allows_login() {
        let (state, _) = setup();
        let auth = AuthState::new();

        for _ in 0..2 {
            let _ = login(&state, &auth, login_req("wrong-pass1"));
        }
        assert_eq!(failed_attempts(&state), 2);
        login(&state, &auth, login_req("secret123")).expect("valid login");
        assert_eq!(failed_attempts(&state), 0);

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = login(&state, &auth, login_req("wrong-pass1"));
        }
        let lapsed = to_rfc3339(Utc::now() - Duration::minutes(LOCKOUT_MINUTES + 1));
        state
            .lock()
            .unwrap()
            .execute("UPDATE users SET last_failed_at = ?1", params![lapsed])
            .unwrap();
        let _ = login(&state, &auth, login_req("wrong-pass1"));
        assert_eq!(failed_attempts(&state), 1, "a lapsed lockout starts a fresh window");
        login(&state, &auth, login_req("secret123")).expect("lockout lapsed");
    }

    #[test]
    fn concurrent_failed_logins_are_all_counted() {
        let (state, _) = setup();
        let state = Arc::new(state);
        let auth = Arc::new(AuthState::new());
        let threads: Vec<_> = (0..3)
            .map(|_| {
                let (state, auth) = (state.clone(), auth.clone());
                std::thread::spawn(move || login(&state, &auth, login_req("wrong-pass1")))
            })
            .collect();
        for t in threads {
            assert!(matches!(t.join().unwrap(), Err(AppError::Unauthorized(_))));
        }
        assert_eq!(failed_attempts(&state), 3);
    }

    #[test]
    fn unknown_tenant_or_email_is_unauthorized() {
        let (state, _) = setup();
        let auth = AuthState::new();
        let mut req = login_req("secret123");
        req.tenant_slug = "nope".into();
        assert!(matches!(
            login(&state, &auth, req),
            Err(AppError::Unauthorized(_))
        ));
        let mut req = login_req("secret123");
        req.email = "ghost@bole.example".into();
        assert!(matches!(
            login(&state, &auth, req),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn last_admin_cannot_be_demoted() {
        let (state, tenant) = setup();
        let auth = AuthState::new();
        let admin = list_users(&state.lock().unwrap(), &tenant.id).unwrap().remove(0);
        let demote = || UserUpdate {
            role: Some("manager".into()),
            ..Default::default()
        };

        let err = update_user(&state.lock().unwrap(), &auth, &tenant.id, &admin.id, demote())
            .expect_err("sole admin demotion");
        assert!(matches!(err, AppError::Conflict(_)));

        let second = create_user(&state, &tenant.id, new_user("second@bole.example", "admin")).unwrap();
        let demoted = update_user(&state.lock().unwrap(), &auth, &tenant.id, &admin.id, demote())
            .expect("demotion allowed with another admin");
        assert_eq!(demoted.role, "manager");
        assert_eq!(second.role, "admin");
    }

    #[test]
    fn duplicate_email_conflicts_and_password_change_checks_old() {
        let (state, tenant) = setup();
        let dup = create_user(&state, &tenant.id, new_user("Admin@Bole.example", "technician"));
        assert!(matches!(dup, Err(AppError::Conflict(_))));

        let admin = list_users(&state.lock().unwrap(), &tenant.id).unwrap().remove(0);
        assert!(change_own_password(
            &state,
            &tenant.id,
            &admin.id,
            "not-it-123".into(),
            "brandnew123".into()
        )
        .is_err());
        change_own_password(
            &state,
            &tenant.id,
            &admin.id,
            "secret123".into(),
            "brandnew123".into(),
        )
        .expect("change");
        let auth = AuthState::new();
        login(&state, &auth, login_req("brandnew123")).expect("new password works");
    }

    #[test]
    fn reset_password_revokes_sessions_and_rejects_unknown_user() {
        let (state, tenant) = setup();
        let auth = AuthState::new();
        let resp = login(&state, &auth, login_req("secret123")).unwrap();

        reset_password(&state, &auth, &tenant.id, &resp.user.id, "fresh1234".into()).unwrap();
        assert!(auth.authenticate(&resp.token).is_err());
        login(&state, &auth, login_req("fresh1234")).expect("reset password works");

        let missing = reset_password(&state, &auth, &tenant.id, "user_nope", "fresh1234".into());
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }
}
