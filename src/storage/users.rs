//! User persistence.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::user::User;
use crate::AppResult;

use super::database::{from_sql, now, to_sql};

pub struct UserStore;

/// Validated input for inserting a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub invited_by_chain: Vec<i64>,
}

impl NewUser {
    pub fn for_email(email: &str) -> Self {
        Self {
            email: email.trim().to_lowercase(),
            name: None,
            invited_by_chain: Vec::new(),
        }
    }
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    let device_ids_json: String = row.get("device_ids")?;
    let chain_json: String = row.get("ancestor_chain")?;
    let completed_str: Option<String> = row.get("profile_completed_at")?;
    let activity_str: Option<String> = row.get("last_activity")?;
    let created_str: String = row.get("created_at")?;

    Ok(User {
        id: row.get("id")?,
        email: row.get("email")?,
        name: row.get("name")?,
        device_ids: serde_json::from_str(&device_ids_json).unwrap_or_default(),
        apns_token: row.get("apns_token")?,
        ancestor_chain: serde_json::from_str(&chain_json).unwrap_or_default(),
        invites_remaining: row.get("invites_remaining")?,
        profile_complete: row.get::<_, i64>("profile_complete")? != 0,
        profile_completed_at: completed_str.and_then(|s| from_sql(&s).ok()),
        last_activity: activity_str.and_then(|s| from_sql(&s).ok()),
        created_at: from_sql(&created_str).unwrap_or_else(|_| chrono::Utc::now()),
    })
}

impl UserStore {
    /// Insert a user. The ancestor chain is the new id prepended to the
    /// inviter's chain.
    pub fn insert(conn: &Connection, user: &NewUser) -> AppResult<i64> {
        conn.execute(
            "INSERT INTO users (email, name, ancestor_chain, created_at)
             VALUES (?1, ?2, '[]', ?3)",
            params![user.email, user.name, to_sql(&now())],
        )?;
        let id = conn.last_insert_rowid();

        let mut chain = vec![id];
        chain.extend(&user.invited_by_chain);
        conn.execute(
            "UPDATE users SET ancestor_chain = ?1 WHERE id = ?2",
            params![serde_json::to_string(&chain).unwrap_or_else(|_| "[]".into()), id],
        )?;
        Ok(id)
    }

    pub fn by_email(conn: &Connection, email: &str) -> AppResult<Option<User>> {
        let email = email.trim().to_lowercase();
        let user = conn
            .query_row("SELECT * FROM users WHERE email = ?1", params![email], user_from_row)
            .optional()?;
        Ok(user)
    }

    pub fn by_id(conn: &Connection, user_id: i64) -> AppResult<Option<User>> {
        let user = conn
            .query_row("SELECT * FROM users WHERE id = ?1", params![user_id], user_from_row)
            .optional()?;
        Ok(user)
    }

    /// Look a user up by one of their opaque device ids.
    pub fn by_device_id(conn: &Connection, device_id: &str) -> AppResult<Option<User>> {
        let user = conn
            .query_row(
                "SELECT u.* FROM users u
                 WHERE EXISTS (
                     SELECT 1 FROM json_each(u.device_ids) WHERE json_each.value = ?1
                 )",
                params![device_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn add_device(conn: &Connection, user_id: i64, device_id: &str) -> AppResult<()> {
        let user = match Self::by_id(conn, user_id)? {
            Some(u) => u,
            None => return Ok(()),
        };
        if user.device_ids.iter().any(|d| d == device_id) {
            return Ok(());
        }
        let mut ids = user.device_ids;
        ids.push(device_id.to_string());
        conn.execute(
            "UPDATE users SET device_ids = ?1 WHERE id = ?2",
            params![serde_json::to_string(&ids).unwrap_or_else(|_| "[]".into()), user_id],
        )?;
        Ok(())
    }

    pub fn set_apns_token(conn: &Connection, user_id: i64, token: &str) -> AppResult<bool> {
        let changed = conn.execute(
            "UPDATE users SET apns_token = ?1 WHERE id = ?2",
            params![token, user_id],
        )?;
        Ok(changed > 0)
    }

    pub fn with_push_tokens(conn: &Connection) -> AppResult<Vec<User>> {
        let mut stmt = conn
            .prepare("SELECT * FROM users WHERE apns_token IS NOT NULL AND apns_token != ''")?;
        let users = stmt.query_map([], user_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Mark the profile complete; returns true on the first completion.
    pub fn set_profile_complete(conn: &Connection, user_id: i64) -> AppResult<bool> {
        let changed = conn.execute(
            "UPDATE users SET profile_complete = 1, profile_completed_at = ?1
             WHERE id = ?2 AND profile_complete = 0",
            params![to_sql(&now()), user_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_name(conn: &Connection, user_id: i64, name: &str) -> AppResult<()> {
        conn.execute("UPDATE users SET name = ?1 WHERE id = ?2", params![name, user_id])?;
        Ok(())
    }

    /// Users whose profile was completed after `since`.
    pub fn count_completed_since(conn: &Connection, since: &str) -> AppResult<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM users
             WHERE profile_complete = 1 AND profile_completed_at > ?1",
            params![since],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// All users with a complete profile. Callers order by proximity.
    pub fn all_complete(conn: &Connection) -> AppResult<Vec<User>> {
        let mut stmt = conn.prepare("SELECT * FROM users WHERE profile_complete = 1")?;
        let users = stmt.query_map([], user_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }
}
