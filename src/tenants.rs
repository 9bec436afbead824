//! Tenants: one row per repair shop. Signup creates the shop, its first
//! admin and the default settings in one transaction.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{self, NewUser, PreparedUser, User};
use crate::data_helpers::{check_len, new_id, now_rfc3339};
use crate::error::{AppError, AppResult};
use crate::settings;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTenant {
    #[serde(alias = "shopName", alias = "shop_name")]
    pub name: String,
    pub slug: String,
    pub admin: NewAdmin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAdmin {
    #[serde(alias = "full_name", alias = "name")]
    pub full_name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTenant {
    pub tenant: Tenant,
    pub admin: User,
}

fn tenant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

pub fn validate_slug(slug: &str) -> AppResult<()> {
    let ok_len = (3..=40).contains(&slug.len());
    let ok_chars = slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !ok_len || !ok_chars || slug.starts_with('-') || slug.ends_with('-') {
        return Err(AppError::validation(
            "slug must be 3 to 40 characters of a-z, 0-9 and '-'",
        ));
    }
    Ok(())
}

/// A validated signup with the admin password already hashed.
#[derive(Debug, Clone)]
pub struct PreparedTenant {
    name: String,
    slug: String,
    admin: PreparedUser,
}

/// Validate a signup and hash the admin password. Runs bcrypt, so call it
/// without the database lock.
pub fn prepare_tenant(input: NewTenant) -> AppResult<PreparedTenant> {
    let name = input.name.trim().to_string();
    check_len("name", &name, 2, 100)?;
    let slug = input.slug.trim().to_lowercase();
    validate_slug(&slug)?;
    let admin = auth::prepare_user(NewUser {
        email: input.admin.email,
        full_name: input.admin.full_name,
        phone: input.admin.phone,
        role: "admin".into(),
        password: input.admin.password,
    })?;
    Ok(PreparedTenant { name, slug, admin })
}

pub fn create_tenant(conn: &Connection, input: PreparedTenant) -> AppResult<CreatedTenant> {
    let PreparedTenant { name, slug, admin } = input;
    if find_by_slug(conn, &slug)?.is_some() {
        return Err(AppError::conflict(format!("Slug '{slug}' is already taken")));
    }

    let tx = conn.unchecked_transaction()?;
    let id = new_id("tenant");
    let now = now_rfc3339();
    tx.execute(
        "INSERT INTO tenants (id, name, slug, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        params![id, name, slug, now],
    )?;
    settings::seed_defaults(&tx, &id, &name)?;
    let admin = auth::insert_user(&tx, &id, admin)?;
    tx.commit()?;

    info!(tenant_id = %id, slug = %slug, "tenant created");
    Ok(CreatedTenant {
        tenant: get_tenant(conn, &id)?,
        admin,
    })
}

pub fn get_tenant(conn: &Connection, id: &str) -> AppResult<Tenant> {
    conn.query_row(
        "SELECT id, name, slug, created_at, updated_at FROM tenants WHERE id = ?1",
        params![id],
        tenant_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("Tenant"))
}

pub fn find_by_slug(conn: &Connection, slug: &str) -> AppResult<Option<Tenant>> {
    Ok(conn
        .query_row(
            "SELECT id, name, slug, created_at, updated_at FROM tenants WHERE slug = ?1",
            params![slug.to_lowercase()],
            tenant_from_row,
        )
        .optional()?)
}

pub fn list_tenants(conn: &Connection) -> AppResult<Vec<Tenant>> {
    let mut stmt =
        conn.prepare("SELECT id, name, slug, created_at, updated_at FROM tenants ORDER BY slug")?;
    let rows = stmt.query_map([], tenant_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use super::fixtures::signup;

    fn admin(email: &str) -> NewAdmin {
        NewAdmin {
            full_name: "Owner".into(),
            email: email.into(),
            password: "secret123".into(),
            phone: None,
        }
    }

    #[test]
    fn slug_rules() {
        assert!(validate_slug("bole-fix").is_ok());
        assert!(validate_slug("ab").is_err());
        assert!(validate_slug("Bole").is_err());
        assert!(validate_slug("-bole").is_err());
        assert!(validate_slug("bole fix").is_err());
    }

    #[test]
    fn create_tenant_seeds_admin_and_settings() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let created = signup(
            &conn,
            NewTenant {
                name: "Piassa Repairs".into(),
                slug: "Piassa".into(),
                admin: admin("owner@piassa.example"),
            },
        )
        .expect("create");
        assert_eq!(created.tenant.slug, "piassa");
        assert_eq!(created.admin.role, "admin");
        assert_eq!(
            db::get_setting(&conn, &created.tenant.id, "shop", "name").as_deref(),
            Some("Piassa Repairs")
        );
        assert!(find_by_slug(&conn, "PIASSA").unwrap().is_some());
    }

    #[test]
    fn duplicate_slug_conflicts_and_bad_admin_rolls_back() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        signup(
            &conn,
            NewTenant {
                name: "First".into(),
                slug: "merkato".into(),
                admin: admin("a@m.example"),
            },
        )
        .unwrap();
        let dup = signup(
            &conn,
            NewTenant {
                name: "Second".into(),
                slug: "merkato".into(),
                admin: admin("b@m.example"),
            },
        );
        assert!(matches!(dup, Err(AppError::Conflict(_))));

        let mut weak = admin("c@m.example");
        weak.password = "weak".into();
        let bad = signup(
            &conn,
            NewTenant {
                name: "Third".into(),
                slug: "kazanchis".into(),
                admin: weak,
            },
        );
        assert!(matches!(bad, Err(AppError::Validation(_))));
        assert!(find_by_slug(&conn, "kazanchis").unwrap().is_none());
        assert_eq!(list_tenants(&conn).unwrap().len(), 1);
    }
}
